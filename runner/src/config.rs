//! Configuration loading

use std::path::PathBuf;

use gridprobe_core::metric::{
    DEFAULT_JOBMANAGER, DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_METRIC_TYPE, DEFAULT_TRIM_LENGTH,
    GLOBAL_SECTION,
};
use gridprobe_core::{Error, IniConfig, InstallLayout, MetricConfig, Result, Target};
use tracing::{debug, info};

/// Locate the installation
///
/// An explicit `--vdt-location` wins over `OSG_LOCATION`, which wins over
/// `VDT_LOCATION`.
pub fn install_layout(flag: Option<PathBuf>) -> Result<InstallLayout> {
    if let Some(path) = flag {
        return Ok(InstallLayout::new(path));
    }

    InstallLayout::from_env().ok_or_else(|| {
        Error::ConfigError(
            "install root is unknown; pass --vdt-location or set OSG_LOCATION or VDT_LOCATION"
                .to_string(),
        )
    })
}

/// Build the layered store for one metric run
///
/// Layers, later ones override earlier ones:
/// global defaults, `rsv.conf`, metric defaults, `<metric>.conf`,
/// `<host>/<metric>.conf`.
pub fn load_store(layout: &InstallLayout, metric: &str, uri: &str) -> Result<IniConfig> {
    let mut store = IniConfig::new();

    store.set_default(GLOBAL_SECTION, "details-data-trim-length", DEFAULT_TRIM_LENGTH);
    store.set_default(GLOBAL_SECTION, "job-timeout", DEFAULT_JOB_TIMEOUT_SECS);

    info!(path = %layout.global_config().display(), "Reading global configuration");
    store.load_file(&layout.global_config(), true)?;

    store.set_default(metric, "jobmanager", DEFAULT_JOBMANAGER);
    store.set_default(metric, "metric-type", DEFAULT_METRIC_TYPE);

    store.load_file(&layout.metric_config(metric), false)?;

    let host = Target::parse(uri).host;
    if store.load_file(&layout.metric_host_config(&host, metric), false)? {
        debug!(host = %host, metric = %metric, "Applied host-specific metric configuration");
    }

    Ok(store)
}

/// Load and validate everything a run of `metric` against `uri` needs
pub fn load(layout: &InstallLayout, metric: &str, uri: &str) -> Result<MetricConfig> {
    let store = load_store(layout, metric, uri)?;
    MetricConfig::resolve(&store, layout, metric, uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridprobe_core::{ConfigStore, ExecutionMode, OutputFormat};
    use std::fs;
    use std::time::Duration;

    const METRIC: &str = "org.osg.general.ping-host";

    fn install() -> (tempfile::TempDir, InstallLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        fs::create_dir_all(layout.metric_config_dir()).unwrap();
        fs::create_dir_all(layout.metric_executable(METRIC).parent().unwrap()).unwrap();
        fs::write(layout.metric_executable(METRIC), "#!/bin/sh\n").unwrap();
        (dir, layout)
    }

    #[test]
    fn test_install_layout_flag() {
        let layout = install_layout(Some(PathBuf::from("/opt/vdt"))).unwrap();
        assert_eq!(layout.rsv_location, PathBuf::from("/opt/vdt/osg-rsv"));
    }

    #[test]
    fn test_missing_global_config() {
        let (_dir, layout) = install();
        let err = load(&layout, METRIC, "ce.example.org").unwrap_err();
        assert!(err.to_string().contains("rsv.conf"));
    }

    #[test]
    fn test_layering() {
        let (_dir, layout) = install();
        fs::write(
            layout.global_config(),
            "[rsv]\nconsumers = html-consumer, gratia-consumer\njob-timeout = 600\n",
        )
        .unwrap();
        fs::write(
            layout.metric_config(METRIC),
            format!(
                "[{m}]\nservice-type = OSG-CE\nexecute = local\noutput-format = brief\nneed-proxy = false\n\n\
                 [{m} args]\ncount = 3\n",
                m = METRIC
            ),
        )
        .unwrap();
        fs::create_dir_all(layout.metric_config_dir().join("ce.example.org")).unwrap();
        fs::write(
            layout.metric_host_config("ce.example.org", METRIC),
            format!("[{}]\njob-timeout = 30\njobmanager = condor\n", METRIC),
        )
        .unwrap();

        let config = load(&layout, METRIC, "ce.example.org:2119").unwrap();
        assert_eq!(config.execution, ExecutionMode::Local);
        assert_eq!(config.output_format, OutputFormat::Brief);
        assert_eq!(config.jobmanager, "condor");
        assert_eq!(config.metric_type, "status");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.trim_length, 10000);
        assert_eq!(config.consumers, vec!["html-consumer", "gratia-consumer"]);
        assert_eq!(config.args_string(), "--count 3");
    }

    #[test]
    fn test_defaults_without_metric_file() {
        let (_dir, layout) = install();
        fs::write(layout.global_config(), "[rsv]\n").unwrap();

        let store = load_store(&layout, METRIC, "ce.example.org").unwrap();
        assert_eq!(store.get_int(GLOBAL_SECTION, "job-timeout").unwrap(), 300);
        assert_eq!(store.get(METRIC, "jobmanager").unwrap(), "fork");

        // output-format and friends are still required
        assert!(MetricConfig::resolve(&store, &layout, METRIC, "ce.example.org").is_err());
    }

    #[test]
    fn test_invalid_timeout_is_config_error() {
        let (_dir, layout) = install();
        fs::write(layout.global_config(), "[rsv]\njob-timeout = soon\n").unwrap();
        fs::write(
            layout.metric_config(METRIC),
            format!(
                "[{}]\nservice-type = OSG-CE\nexecute = local\noutput-format = wlcg\nneed-proxy = false\n",
                METRIC
            ),
        )
        .unwrap();

        assert!(load(&layout, METRIC, "ce.example.org").is_err());
    }
}
