//! Probe command lines, local or via remote job submission

use std::path::PathBuf;

use tracing::debug;

use crate::{ExecutionMode, MetricConfig};

/// Builds the shell command line for a probe run
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Job-submission client used in remote mode
    job_submit: PathBuf,
}

impl CommandBuilder {
    pub fn new(job_submit: impl Into<PathBuf>) -> Self {
        Self {
            job_submit: job_submit.into(),
        }
    }

    /// Command line for `metric` in its configured execution mode
    ///
    /// Local:  `<exe> -m <metric> -u <uri> <args>`
    /// Remote: `<submit> <host>/jobmanager-<jm> -s <exe> -- -m <metric> -u <uri> <args>`
    pub fn build(&self, metric: &MetricConfig) -> String {
        let mut probe_args = format!("-m {} -u {}", metric.name, metric.target.uri);
        let extra = metric.args_string();
        if !extra.is_empty() {
            probe_args.push(' ');
            probe_args.push_str(&extra);
        }

        let command = match metric.execution {
            ExecutionMode::Local => {
                format!("{} {}", metric.executable.display(), probe_args)
            }
            ExecutionMode::RemoteSubmission => format!(
                "{} {}/jobmanager-{} -s {} -- {}",
                self.job_submit.display(),
                metric.target.host,
                metric.jobmanager,
                metric.executable.display(),
                probe_args
            ),
        };

        debug!(mode = metric.execution.as_str(), command = %command, "Built probe command");
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutputFormat, ProxyConfig, Target};
    use std::time::Duration;

    fn metric(execution: ExecutionMode) -> MetricConfig {
        MetricConfig {
            name: "org.osg.globus.gram-authentication".to_string(),
            target: Target::parse("ce.example.org"),
            executable: PathBuf::from("/opt/vdt/osg-rsv/bin/metrics/org.osg.globus.gram-authentication"),
            execution,
            output_format: OutputFormat::Wlcg,
            metric_type: "status".to_string(),
            service_type: "OSG-CE".to_string(),
            jobmanager: "condor".to_string(),
            timeout: Duration::from_secs(300),
            args: vec![("verbose".to_string(), "1".to_string())],
            environment: Vec::new(),
            proxy: ProxyConfig::none(),
            trim_length: 10000,
            consumers: Vec::new(),
        }
    }

    #[test]
    fn test_local_command() {
        let builder = CommandBuilder::new("/opt/vdt/globus/bin/globus-job-run");
        assert_eq!(
            builder.build(&metric(ExecutionMode::Local)),
            "/opt/vdt/osg-rsv/bin/metrics/org.osg.globus.gram-authentication \
             -m org.osg.globus.gram-authentication -u ce.example.org --verbose 1"
        );
    }

    #[test]
    fn test_remote_command() {
        let builder = CommandBuilder::new("/opt/vdt/globus/bin/globus-job-run");
        assert_eq!(
            builder.build(&metric(ExecutionMode::RemoteSubmission)),
            "/opt/vdt/globus/bin/globus-job-run ce.example.org/jobmanager-condor \
             -s /opt/vdt/osg-rsv/bin/metrics/org.osg.globus.gram-authentication -- \
             -m org.osg.globus.gram-authentication -u ce.example.org --verbose 1"
        );
    }

    #[test]
    fn test_no_extra_args() {
        let mut m = metric(ExecutionMode::Local);
        m.args.clear();
        let command = CommandBuilder::new("globus-job-run").build(&m);
        assert!(command.ends_with("-u ce.example.org"));
    }
}
