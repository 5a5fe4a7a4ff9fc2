//! Probe execution engine
//!
//! Drives one probe run from a resolved [`MetricConfig`] to a published
//! [`ResultRecord`]:
//! - credential acquisition (service certificate or user proxy)
//! - target reachability check
//! - command construction for local or remote-submission mode
//! - timeout-bound execution with the job's environment overlay
//! - output parsing and fan-out to every enabled consumer
//!
//! Any stage may end the run early. Early endings are turned into a
//! CRITICAL record and published like a normal result, so a run always
//! produces exactly one record.
//!
//! The job environment is layered over the runner's environment only for
//! the spawned command. Several runs may share one process sequentially;
//! running several at once in one process is not a supported setup.

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::credential::{CertificateTool, CredentialManager, OpensslTool};
use crate::parser::{self, truncate_bytes, ResultFragment};
use crate::process::{JobRunner, ProcessRunner, RunOutcome};
use crate::publisher::{PublishReport, ResultPublisher};
use crate::reachability::{HostProbe, PingProbe};
use crate::remote::CommandBuilder;
use crate::{EnvironmentOverlay, ExecutionMode, InstallLayout, MetricConfig, ResultRecord};

/// Verbosity at which unparseable output is logged in full
pub const FULL_OUTPUT_VERBOSITY: u8 = 3;

pub const OPENSSL_EXE: &str = "/usr/bin/openssl";

/// Where a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Credential,
    Reachability,
    Execution,
    Parse,
    Completed,
}

/// Everything one run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub record: ResultRecord,
    pub publish: PublishReport,
    pub stage: Stage,
    /// Probe command line, once it was built
    pub command: Option<String>,
}

pub struct ProbeExecutor {
    credentials: CredentialManager,
    host_probe: Box<dyn HostProbe>,
    runner: Box<dyn JobRunner>,
    commands: CommandBuilder,
    publisher: ResultPublisher,
    verbosity: u8,
}

impl ProbeExecutor {
    /// Wire the executor with its external tools
    pub fn new(
        tool: Box<dyn CertificateTool>,
        host_probe: Box<dyn HostProbe>,
        runner: Box<dyn JobRunner>,
        commands: CommandBuilder,
        publisher: ResultPublisher,
    ) -> Self {
        Self {
            credentials: CredentialManager::new(tool),
            host_probe,
            runner,
            commands,
            publisher,
            verbosity: 1,
        }
    }

    /// Production wiring for an installation
    pub fn for_install(layout: &InstallLayout) -> Self {
        Self::new(
            Box::new(OpensslTool::new(
                OPENSSL_EXE,
                layout.globus_bin("grid-proxy-init"),
            )),
            Box::new(PingProbe::new()),
            Box::new(ProcessRunner::new()),
            CommandBuilder::new(layout.globus_bin("globus-job-run")),
            ResultPublisher::new(layout.output_root()),
        )
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_publisher(mut self, publisher: ResultPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Run `metric` once and publish its record
    #[instrument(skip(self, metric), fields(metric = %metric.name, target = %metric.target.uri))]
    pub async fn run(&self, metric: &MetricConfig) -> RunReport {
        let (stage, fragment, command) = self.evaluate(metric).await;

        let record = self.publisher.build_record(fragment, metric);
        let publish = self.publisher.publish(&record, &metric.consumers);

        info!(
            status = %record.status,
            stage = ?stage,
            written = publish.written.len(),
            skipped = publish.skipped.len(),
            "Probe run finished"
        );

        RunReport {
            record,
            publish,
            stage,
            command,
        }
    }

    /// Every stage up to, but not including, publication
    async fn evaluate(&self, metric: &MetricConfig) -> (Stage, ResultFragment, Option<String>) {
        info!("Checking proxy");
        let credential = match self.credentials.acquire(&metric.proxy).await {
            Ok(credential) => credential,
            Err(failure) => {
                error!(error = %failure, "Credential check failed");
                return (
                    Stage::Credential,
                    ResultFragment::critical(failure.details()),
                    None,
                );
            }
        };

        let reachability = self.host_probe.probe(&metric.target.host).await;
        if !reachability.reachable {
            warn!(host = %metric.target.host, "Host is not reachable");
            return (
                Stage::Reachability,
                ResultFragment::critical(ping_failure(&reachability.output)),
                None,
            );
        }
        debug!("Ping successful");

        let command = self.commands.build(metric);

        info!("Setting up job environment");
        let mut overlay = EnvironmentOverlay::from_process_env(&metric.environment);
        if let Some(credential) = &credential {
            overlay.extend(&credential.overlay());
        }

        info!(command = %command, "Running command");
        let outcome = match self.runner.run(&command, &overlay, metric.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Could not run job");
                return (
                    Stage::Execution,
                    ResultFragment::critical(job_failed(metric.execution, &command, &e.to_string())),
                    Some(command),
                );
            }
        };

        let output = match outcome {
            RunOutcome::TimedOut => {
                warn!(timeout_secs = metric.timeout.as_secs(), "Job timed out");
                return (
                    Stage::Execution,
                    ResultFragment::critical(job_timed_out(&command, metric.timeout.as_secs())),
                    Some(command),
                );
            }
            RunOutcome::Completed { exit_code, output } if exit_code != 0 => {
                warn!(exit_code, "Job failed");
                return (
                    Stage::Execution,
                    ResultFragment::critical(job_failed(metric.execution, &command, &output)),
                    Some(command),
                );
            }
            RunOutcome::Completed { output, .. } => output,
        };

        match parser::parse(&output, metric.output_format) {
            Ok(fragment) => (Stage::Completed, fragment, Some(command)),
            Err(e) => {
                error!(error = %e, "Invalid data returned from job");
                if self.verbosity < FULL_OUTPUT_VERBOSITY {
                    warn!(
                        "Displaying first {} bytes of output (use -v3 for full output):\n{}",
                        metric.trim_length,
                        truncate_bytes(&output, metric.trim_length)
                    );
                } else {
                    debug!("Displaying full output received from command:\n{}", output);
                }
                (
                    Stage::Parse,
                    ResultFragment::critical(invalid_output(&e.to_string(), &output)),
                    Some(command),
                )
            }
        }
    }
}

fn ping_failure(output: &str) -> String {
    format!(
        "Failed to ping host\n\n\
         Troubleshooting:\n  \
         Is the network available?\n  \
         Is the remote host available?\n\n\
         Ping output:\n{}",
        output
    )
}

fn job_failed(mode: ExecutionMode, command: &str, output: &str) -> String {
    let headline = match mode {
        ExecutionMode::Local => "Failed to run local job",
        ExecutionMode::RemoteSubmission => "Failed to run job via globus-job-run",
    };
    format!("{}\n\nJob run:\n{}\n\nOutput:\n{}", headline, command, output)
}

fn job_timed_out(command: &str, timeout_secs: u64) -> String {
    format!(
        "Timeout hit - execution of the job exceeded {} seconds\n\nJob run:\n{}\n",
        timeout_secs, command
    )
}

fn invalid_output(reason: &str, output: &str) -> String {
    format!(
        "Invalid data returned from job ({})\n\nOutput:\n{}",
        reason, output
    )
}
