//! X.509 proxy discovery, validation and renewal

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::metric::file_exists;
use crate::process::{JobRunner, ProcessRunner, RunOutcome};
use crate::{EnvironmentOverlay, ProxyConfig, ServiceCertificate};

/// Service proxies expiring sooner than this are renewed
pub const SERVICE_PROXY_HORIZON: Duration = Duration::from_secs(4 * 60 * 60);

/// Lifetime requested when renewing a service proxy
pub const SERVICE_PROXY_VALIDITY: Duration = Duration::from_secs(6 * 60 * 60);

/// User proxies expiring sooner than this fail the run
pub const USER_PROXY_HORIZON: Duration = Duration::from_secs(10 * 60);

pub const PROXY_ENV_VARS: [&str; 2] = ["X509_USER_PROXY", "X509_PROXY_FILE"];

/// Where an active credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Service,
    User,
}

/// An active proxy credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub path: PathBuf,
    pub source: CredentialSource,
    /// `notAfter` of the proxy, when the inspection tool reported it
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Environment the probe needs to find this proxy
    pub fn overlay(&self) -> EnvironmentOverlay {
        let mut overlay = EnvironmentOverlay::new();
        for var in PROXY_ENV_VARS {
            overlay.set(var, self.path.to_string_lossy());
        }
        overlay
    }
}

/// Result of asking the inspection tool about a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidityCheck {
    /// Valid for at least the requested horizon
    Valid {
        expires_at: Option<DateTime<Utc>>,
        output: String,
    },
    /// The tool ran and reported expiry within the horizon (or a bad file)
    Expiring { output: String },
}

/// The certificate tool itself could not be run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not invoke {tool}: {output}")]
pub struct ToolInvocation {
    pub tool: String,
    pub output: String,
}

/// Renewal ran and failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("renewal failed: {output}")]
pub struct RenewalError {
    pub output: String,
}

/// External certificate tooling
#[async_trait]
pub trait CertificateTool: Send + Sync {
    /// Check whether `proxy` stays valid for at least `horizon`
    async fn check(
        &self,
        proxy: &Path,
        horizon: Duration,
    ) -> std::result::Result<ValidityCheck, ToolInvocation>;

    /// Issue a fresh proxy from `cert`/`key` into `proxy`
    async fn renew(
        &self,
        cert: &Path,
        key: &Path,
        proxy: &Path,
        validity: Duration,
    ) -> std::result::Result<(), RenewalError>;
}

/// Terminal credential outcomes; each becomes a CRITICAL record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialFailure {
    #[error("no proxy configured")]
    NoProxyConfigured,

    #[error("user proxy '{}' does not exist", .path.display())]
    MissingUserProxy { path: PathBuf },

    #[error("user proxy '{}' is expired or expiring soon", .path.display())]
    ExpiredUserProxy {
        path: PathBuf,
        output: String,
        horizon: Duration,
    },

    #[error("service proxy '{}' could not be renewed", .service.proxy.display())]
    ServiceProxyRenewalFailed {
        service: ServiceCertificate,
        output: String,
    },
}

impl CredentialFailure {
    /// `detailsData` of the synthesized record
    pub fn details(&self) -> String {
        match self {
            Self::NoProxyConfigured => "No proxy is setup in rsv.conf.\n\n\
                To use a service certificate (recommended), set the following variables:\n\
                service-cert, service-key, service-proxy\n\n\
                To use a user certificate, set the following variable:\n\
                proxy-file"
                .to_string(),
            Self::MissingUserProxy { path } => format!(
                "proxy-file is set in rsv.conf, but the file '{}' does not exist.",
                path.display()
            ),
            Self::ExpiredUserProxy {
                path,
                output,
                horizon,
            } => format!(
                "Proxy file '{}' is expired (or is expiring within {} minutes)\n\n\
                 openssl output:\n{}",
                path.display(),
                horizon.as_secs() / 60,
                output
            ),
            Self::ServiceProxyRenewalFailed { service, output } => format!(
                "Proxy file '{}' could not be renewed.\n\
                 Service cert - {}\n\
                 Service key  - {}\n\
                 openssl output:\n{}",
                service.proxy.display(),
                service.cert.display(),
                service.key.display(),
                output
            ),
        }
    }
}

/// Resolves the credential a run should use
pub struct CredentialManager {
    tool: Box<dyn CertificateTool>,
}

impl CredentialManager {
    pub fn new(tool: Box<dyn CertificateTool>) -> Self {
        Self { tool }
    }

    /// Find, check and if needed renew the configured proxy
    ///
    /// Returns `Ok(None)` when the metric does not need a proxy.
    #[instrument(skip(self, config))]
    pub async fn acquire(
        &self,
        config: &ProxyConfig,
    ) -> std::result::Result<Option<Credential>, CredentialFailure> {
        if !config.need_proxy {
            info!("Skipping proxy check because need-proxy=false");
            return Ok(None);
        }

        // The service certificate wins over a user proxy when both are set
        if let Some(service) = &config.service {
            return self.service_proxy(service).await.map(Some);
        }

        if let Some(path) = &config.user_proxy {
            return self.user_proxy(path).await.map(Some);
        }

        Err(CredentialFailure::NoProxyConfigured)
    }

    async fn service_proxy(
        &self,
        service: &ServiceCertificate,
    ) -> std::result::Result<Credential, CredentialFailure> {
        info!(proxy = %service.proxy.display(), "Checking service certificate proxy");

        let check = self.tool.check(&service.proxy, SERVICE_PROXY_HORIZON).await;
        let mut expires_at = None;
        let needs_renewal = match check {
            Ok(ValidityCheck::Valid {
                expires_at: expiry, ..
            }) => {
                info!(
                    hours = SERVICE_PROXY_HORIZON.as_secs() / 3600,
                    "Service certificate proxy valid"
                );
                expires_at = expiry;
                false
            }
            Ok(ValidityCheck::Expiring { output }) => {
                info!(output = %output.trim(), "Service certificate proxy expiring soon, renewing it");
                true
            }
            Err(e) => {
                warn!(error = %e, "Could not inspect service proxy, renewing it");
                true
            }
        };

        if needs_renewal {
            if let Err(e) = self
                .tool
                .renew(
                    &service.cert,
                    &service.key,
                    &service.proxy,
                    SERVICE_PROXY_VALIDITY,
                )
                .await
            {
                error!(
                    proxy = %service.proxy.display(),
                    output = %e.output.trim(),
                    "Service proxy renewal failed"
                );
                // Keep going with the old proxy while it is still on disk
                if !file_exists(&service.proxy) {
                    return Err(CredentialFailure::ServiceProxyRenewalFailed {
                        service: service.clone(),
                        output: e.output,
                    });
                }
            } else if let Ok(ValidityCheck::Valid { expires_at: e, .. }) =
                self.tool.check(&service.proxy, SERVICE_PROXY_HORIZON).await
            {
                expires_at = e;
            }
        }

        Ok(Credential {
            path: service.proxy.clone(),
            source: CredentialSource::Service,
            expires_at,
        })
    }

    async fn user_proxy(&self, path: &Path) -> std::result::Result<Credential, CredentialFailure> {
        info!(proxy = %path.display(), "Checking user proxy");

        if !file_exists(path) {
            return Err(CredentialFailure::MissingUserProxy {
                path: path.to_path_buf(),
            });
        }

        match self.tool.check(path, USER_PROXY_HORIZON).await {
            Ok(ValidityCheck::Valid { expires_at, .. }) => Ok(Credential {
                path: path.to_path_buf(),
                source: CredentialSource::User,
                expires_at,
            }),
            Ok(ValidityCheck::Expiring { output }) => Err(CredentialFailure::ExpiredUserProxy {
                path: path.to_path_buf(),
                output,
                horizon: USER_PROXY_HORIZON,
            }),
            Err(e) => Err(CredentialFailure::ExpiredUserProxy {
                path: path.to_path_buf(),
                output: e.to_string(),
                horizon: USER_PROXY_HORIZON,
            }),
        }
    }
}

/// Parse the `notAfter=` line printed by `openssl x509 -enddate`
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let raw = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("notAfter="))?;
    let raw = raw.trim().trim_end_matches("GMT").trim();
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// `openssl` for inspection and `grid-proxy-init` for renewal
pub struct OpensslTool {
    openssl: PathBuf,
    grid_proxy_init: PathBuf,
    runner: ProcessRunner,
    deadline: Duration,
}

impl OpensslTool {
    pub fn new(openssl: impl Into<PathBuf>, grid_proxy_init: impl Into<PathBuf>) -> Self {
        Self {
            openssl: openssl.into(),
            grid_proxy_init: grid_proxy_init.into(),
            runner: ProcessRunner::new(),
            deadline: Duration::from_secs(120),
        }
    }
}

fn validity_arg(validity: Duration) -> String {
    let minutes = validity.as_secs() / 60;
    format!("{}:{:02}", minutes / 60, minutes % 60)
}

#[async_trait]
impl CertificateTool for OpensslTool {
    async fn check(
        &self,
        proxy: &Path,
        horizon: Duration,
    ) -> std::result::Result<ValidityCheck, ToolInvocation> {
        let tool = self.openssl.display().to_string();
        if !self.openssl.exists() {
            return Err(ToolInvocation {
                tool,
                output: "executable not found".to_string(),
            });
        }

        let command = format!(
            "{} x509 -in {} -noout -enddate -checkend {}",
            self.openssl.display(),
            proxy.display(),
            horizon.as_secs()
        );
        match self
            .runner
            .run(&command, &EnvironmentOverlay::new(), self.deadline)
            .await
        {
            Ok(RunOutcome::Completed { exit_code: 0, output }) => Ok(ValidityCheck::Valid {
                expires_at: parse_not_after(&output),
                output,
            }),
            Ok(RunOutcome::Completed { output, .. }) => Ok(ValidityCheck::Expiring { output }),
            Ok(RunOutcome::TimedOut) => Err(ToolInvocation {
                tool,
                output: format!("timed out after {}s", self.deadline.as_secs()),
            }),
            Err(e) => Err(ToolInvocation {
                tool,
                output: e.to_string(),
            }),
        }
    }

    async fn renew(
        &self,
        cert: &Path,
        key: &Path,
        proxy: &Path,
        validity: Duration,
    ) -> std::result::Result<(), RenewalError> {
        let command = format!(
            "{} -cert {} -key {} -valid {} -debug -out {}",
            self.grid_proxy_init.display(),
            cert.display(),
            key.display(),
            validity_arg(validity),
            proxy.display()
        );
        match self
            .runner
            .run(&command, &EnvironmentOverlay::new(), self.deadline)
            .await
        {
            Ok(RunOutcome::Completed { exit_code: 0, .. }) => Ok(()),
            Ok(RunOutcome::Completed { output, .. }) => Err(RenewalError { output }),
            Ok(RunOutcome::TimedOut) => Err(RenewalError {
                output: format!("timed out after {}s", self.deadline.as_secs()),
            }),
            Err(e) => Err(RenewalError {
                output: e.to_string(),
            }),
        }
    }
}
