//! Core library for GridProbe
//!
//! This crate holds the probe execution engine: credential handling,
//! timeout-bound subprocess execution, probe output parsing, result
//! publication and the executor that drives them, plus the configuration
//! store and shared types they use.

pub mod config;
pub mod credential;
pub mod environment;
pub mod error;
pub mod executor;
pub mod metric;
pub mod parser;
pub mod process;
pub mod publisher;
pub mod reachability;
pub mod remote;
pub mod types;

// Re-exports
pub use config::{ConfigStore, IniConfig};
pub use credential::{
    CertificateTool, Credential, CredentialFailure, CredentialManager, CredentialSource,
    OpensslTool,
};
pub use environment::{EnvAction, EnvironmentDirective, EnvironmentOverlay};
pub use error::{Error, Result};
pub use executor::{ProbeExecutor, RunReport, Stage};
pub use metric::{InstallLayout, MetricConfig, ProxyConfig, ServiceCertificate, Target};
pub use parser::{ParseError, ResultFragment};
pub use process::{JobRunner, ProcessRunner, RunOutcome};
pub use publisher::{PublishReport, ResultPublisher};
pub use reachability::{HostProbe, PingProbe, Reachability};
pub use remote::CommandBuilder;
pub use types::{ExecutionMode, OutputFormat, ResultRecord, Status};
