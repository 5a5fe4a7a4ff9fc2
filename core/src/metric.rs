//! Metric configuration resolution

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::environment::{load_directives, EnvironmentDirective};
use crate::{ConfigStore, Error, ExecutionMode, OutputFormat, Result};

/// Section holding install-wide settings
pub const GLOBAL_SECTION: &str = "rsv";

pub const DEFAULT_TRIM_LENGTH: usize = 10000;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_JOBMANAGER: &str = "fork";
pub const DEFAULT_METRIC_TYPE: &str = "status";

/// Filesystem layout of an installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    /// Install root (`VDT_LOCATION`)
    pub vdt_location: PathBuf,
    /// Probe root, `<vdt>/osg-rsv`
    pub rsv_location: PathBuf,
}

impl InstallLayout {
    pub fn new(vdt_location: impl Into<PathBuf>) -> Self {
        let vdt_location = vdt_location.into();
        let rsv_location = vdt_location.join("osg-rsv");
        Self {
            vdt_location,
            rsv_location,
        }
    }

    /// Discover the install root from `OSG_LOCATION`, then `VDT_LOCATION`
    pub fn from_env() -> Option<Self> {
        std::env::var("OSG_LOCATION")
            .or_else(|_| std::env::var("VDT_LOCATION"))
            .ok()
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    pub fn global_config(&self) -> PathBuf {
        self.rsv_location.join("etc").join("rsv.conf")
    }

    pub fn metric_config_dir(&self) -> PathBuf {
        self.rsv_location.join("etc").join("metrics")
    }

    pub fn metric_config(&self, metric: &str) -> PathBuf {
        self.metric_config_dir().join(format!("{}.conf", metric))
    }

    pub fn metric_host_config(&self, host: &str, metric: &str) -> PathBuf {
        self.metric_config_dir()
            .join(host)
            .join(format!("{}.conf", metric))
    }

    pub fn metric_executable(&self, metric: &str) -> PathBuf {
        self.rsv_location.join("bin").join("metrics").join(metric)
    }

    /// Root of the per-consumer record directories
    pub fn output_root(&self) -> PathBuf {
        self.rsv_location.join("output")
    }

    pub fn globus_bin(&self, tool: &str) -> PathBuf {
        self.vdt_location.join("globus").join("bin").join(tool)
    }
}

/// Service certificate triple; all three must be configured to be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceCertificate {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub proxy: PathBuf,
}

/// Which credential, if any, a run should authenticate with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyConfig {
    /// False only when the metric explicitly sets `need-proxy = false`
    pub need_proxy: bool,
    pub service: Option<ServiceCertificate>,
    pub user_proxy: Option<PathBuf>,
}

impl ProxyConfig {
    /// No credential required
    pub fn none() -> Self {
        Self {
            need_proxy: false,
            service: None,
            user_proxy: None,
        }
    }
}

/// Target of a probe, `host` or `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub uri: String,
    pub host: String,
}

impl Target {
    pub fn parse(uri: &str) -> Self {
        match uri.split_once(':') {
            Some((host, _port)) => Self {
                uri: uri.to_string(),
                host: host.to_string(),
            },
            None => Self {
                uri: uri.to_string(),
                host: uri.to_string(),
            },
        }
    }
}

/// Fully resolved configuration of one probe run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricConfig {
    pub name: String,
    pub target: Target,
    pub executable: PathBuf,
    pub execution: ExecutionMode,
    pub output_format: OutputFormat,
    pub metric_type: String,
    pub service_type: String,
    pub jobmanager: String,
    #[serde(skip)]
    pub timeout: Duration,
    /// Ordered `--flag value` pairs
    pub args: Vec<(String, String)>,
    pub environment: Vec<EnvironmentDirective>,
    pub proxy: ProxyConfig,
    /// Byte limit on `detailsData`; 0 disables trimming
    pub trim_length: usize,
    /// Enabled consumers, in configuration order
    pub consumers: Vec<String>,
}

impl MetricConfig {
    pub fn args_section(metric: &str) -> String {
        format!("{} args", metric)
    }

    pub fn env_section(metric: &str) -> String {
        format!("{} env", metric)
    }

    /// Resolve and validate the configuration for `metric` against `uri`
    ///
    /// Every error returned here is a configuration error: nothing has been
    /// executed yet and no result record is owed.
    pub fn resolve(
        store: &dyn ConfigStore,
        layout: &InstallLayout,
        metric: &str,
        uri: &str,
    ) -> Result<Self> {
        info!(metric = %metric, "Validating configuration");

        let executable = layout.metric_executable(metric);
        if !executable.exists() {
            return Err(Error::ConfigError(format!(
                "metric does not exist at {}",
                executable.display()
            )));
        }

        let service_type = required(store, metric, "service-type")?;
        let execution: ExecutionMode = required(store, metric, "execute")?.parse()?;

        let output_format: OutputFormat = store
            .get(metric, "output-format")
            .map_err(|_| {
                Error::ConfigError(
                    "desired output-format is missing; the metric configuration file is likely missing or corrupt"
                        .to_string(),
                )
            })?
            .parse()?;

        let metric_type =
            optional(store, metric, "metric-type").unwrap_or_else(|| DEFAULT_METRIC_TYPE.into());
        let jobmanager =
            optional(store, metric, "jobmanager").unwrap_or_else(|| DEFAULT_JOBMANAGER.into());

        let timeout_secs = job_timeout(store, metric)?;
        let trim_length = trim_length(store)?;
        let consumers = enabled_consumers(store);

        let args = read_args(store, &Self::args_section(metric));
        let environment = load_directives(
            store,
            &Self::env_section(metric),
            &layout.vdt_location.to_string_lossy(),
        );
        let proxy = proxy_config(store, metric)?;

        debug!(
            metric = %metric,
            execution = execution.as_str(),
            format = output_format.as_str(),
            timeout_secs,
            trim_length,
            "Configuration resolved"
        );

        Ok(Self {
            name: metric.to_string(),
            target: Target::parse(uri),
            executable,
            execution,
            output_format,
            metric_type,
            service_type,
            jobmanager,
            timeout: Duration::from_secs(timeout_secs),
            args,
            environment,
            proxy,
            trim_length,
            consumers,
        })
    }

    /// `--flag value` argument string appended to the probe command
    pub fn args_string(&self) -> String {
        self.args
            .iter()
            .map(|(flag, value)| format!("--{} {}", flag, value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn required(store: &dyn ConfigStore, section: &str, key: &str) -> Result<String> {
    store
        .get(section, key)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "metric configuration is missing '{}'; the metric configuration file is likely missing or corrupt",
                key
            ))
        })
}

fn optional(store: &dyn ConfigStore, section: &str, key: &str) -> Option<String> {
    store
        .get(section, key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn job_timeout(store: &dyn ConfigStore, metric: &str) -> Result<u64> {
    let raw = match store.get_int(metric, "job-timeout") {
        Ok(v) => v,
        Err(e) if e.is_not_found() => match store.get_int(GLOBAL_SECTION, "job-timeout") {
            Ok(v) => v,
            Err(e) if e.is_not_found() => DEFAULT_JOB_TIMEOUT_SECS as i64,
            Err(e) => return Err(e),
        },
        Err(e) => return Err(e),
    };

    if raw <= 0 {
        return Err(Error::ConfigError(format!(
            "job-timeout must be a positive integer, got {}",
            raw
        )));
    }
    Ok(raw as u64)
}

fn trim_length(store: &dyn ConfigStore) -> Result<usize> {
    match store.get_int(GLOBAL_SECTION, "details-data-trim-length") {
        Ok(v) if v >= 0 => Ok(v as usize),
        Ok(v) => Err(Error::ConfigError(format!(
            "details-data-trim-length must be a non-negative integer, got {}",
            v
        ))),
        Err(e) if e.is_not_found() => Ok(DEFAULT_TRIM_LENGTH),
        Err(e) => Err(e),
    }
}

fn enabled_consumers(store: &dyn ConfigStore) -> Vec<String> {
    match store.get(GLOBAL_SECTION, "consumers") {
        Ok(list) => {
            let consumers: Vec<String> = list
                .split(',')
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
            info!(consumers = ?consumers, "Registered consumers");
            consumers
        }
        Err(_) => {
            warn!(
                "No consumers are registered; records will not be sent to a central collector"
            );
            Vec::new()
        }
    }
}

fn read_args(store: &dyn ConfigStore, section: &str) -> Vec<(String, String)> {
    match store.options(section) {
        Ok(options) => options
            .into_iter()
            .filter_map(|opt| store.get(section, &opt).ok().map(|v| (opt, v)))
            .collect(),
        Err(_) => {
            debug!(section = %section, "No args section found");
            Vec::new()
        }
    }
}

fn proxy_config(store: &dyn ConfigStore, metric: &str) -> Result<ProxyConfig> {
    let need_proxy = match store.get_bool(metric, "need-proxy") {
        Ok(v) => v,
        Err(e) if e.is_not_found() => true,
        Err(e) => return Err(e),
    };

    let path = |key: &str| optional(store, GLOBAL_SECTION, key).map(PathBuf::from);

    let service = match (path("service-cert"), path("service-key"), path("service-proxy")) {
        (Some(cert), Some(key), Some(proxy)) => Some(ServiceCertificate { cert, key, proxy }),
        _ => None,
    };

    Ok(ProxyConfig {
        need_proxy,
        service,
        user_proxy: path("proxy-file"),
    })
}

/// Whether `path` is an existing file
pub(crate) fn file_exists(path: &Path) -> bool {
    path.is_file()
}
