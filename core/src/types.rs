//! Shared types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Probe status as reported in `metricStatus`
///
/// The four standard values get their own variants; anything else a probe
/// reports is carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Unknown,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s.trim() {
            "OK" => Self::Ok,
            "WARNING" => Self::Warning,
            "CRITICAL" => Self::Critical,
            "UNKNOWN" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Status::from(s.as_str())
    }
}

impl From<Status> for String {
    fn from(s: Status) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the probe executable is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Run on this host
    Local,
    /// Wrap in a remote job submission to the target's job manager
    RemoteSubmission,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::RemoteSubmission => "remote-globus",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote-globus" | "remote-submission" => Ok(Self::RemoteSubmission),
            other => Err(Error::UnknownExecutionMode(other.to_string())),
        }
    }
}

/// Declared format of a probe's standard output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// A complete wire record, published verbatim
    Wlcg,
    /// `JOB RESULTS:` / status / details
    Brief,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wlcg => "wlcg",
            Self::Brief => "brief",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wlcg" => Ok(Self::Wlcg),
            "brief" => Ok(Self::Brief),
            other => Err(Error::UnknownOutputFormat(other.to_string())),
        }
    }
}

/// Terminal outcome of one probe run
///
/// Exactly one of these is produced per run. The two timestamp renderings
/// are fixed when the record is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub metric_name: String,
    pub metric_type: String,
    pub status: Status,
    pub service_type: String,
    #[serde(rename = "serviceURI")]
    pub service_uri: String,
    pub gathered_at: String,
    pub timestamp: DateTime<Utc>,
    pub utc_timestamp: String,
    pub local_timestamp: String,
    pub details_data: String,
    #[serde(skip)]
    pub(crate) verbatim: Option<VerbatimRecord>,
}

/// Pre-formatted record text supplied by a `wlcg` probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VerbatimRecord {
    pub utc: String,
    pub local: String,
}

impl ResultRecord {
    /// Wire record with the UTC timestamp
    pub fn render_utc(&self) -> String {
        match &self.verbatim {
            Some(v) => v.utc.clone(),
            None => self.render_with(&self.utc_timestamp),
        }
    }

    /// Wire record with the local timestamp
    pub fn render_local(&self) -> String {
        match &self.verbatim {
            Some(v) => v.local.clone(),
            None => self.render_with(&self.local_timestamp),
        }
    }

    /// Whether the record text came straight from the probe
    pub fn is_verbatim(&self) -> bool {
        self.verbatim.is_some()
    }

    fn render_with(&self, timestamp: &str) -> String {
        // metricStatus and summaryData carry the same value
        let mut out = String::new();
        out.push_str(&format!("metricName: {}\n", self.metric_name));
        out.push_str(&format!("metricType: {}\n", self.metric_type));
        out.push_str(&format!("timestamp: {}\n", timestamp));
        out.push_str(&format!("metricStatus: {}\n", self.status));
        out.push_str(&format!("serviceType: {}\n", self.service_type));
        out.push_str(&format!("serviceURI: {}\n", self.service_uri));
        out.push_str(&format!("gatheredAt: {}\n", self.gathered_at));
        out.push_str(&format!("summaryData: {}\n", self.status));
        out.push_str(&format!("detailsData: {}\n", self.details_data));
        out.push_str("EOT\n");
        out
    }
}
