//! Result record construction and consumer fan-out
//!
//! Every run ends here. The publisher fixes the record's timestamps,
//! applies the details trim and writes one fresh file per enabled consumer
//! under `<output root>/<consumer>/`. A consumer that cannot be written is
//! skipped with a warning; the others still get their record.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::parser::{truncate_bytes, ResultFragment, UTC_TIME_FORMAT};
use crate::types::VerbatimRecord;
use crate::{Error, MetricConfig, Result, ResultRecord};

/// Local rendering, e.g. `2010-07-25 00:18:14 CDT`
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

/// The one consumer that receives local-time records
pub const HTML_CONSUMER: &str = "html-consumer";

/// Best guess at the host's time zone
///
/// Checks `TZ`, then `/etc/timezone`, then the `/etc/localtime` symlink,
/// and falls back to UTC.
pub fn local_timezone() -> Tz {
    let from_tz_var = std::env::var("TZ")
        .ok()
        .and_then(|v| v.trim_start_matches(':').parse::<Tz>().ok());
    if let Some(tz) = from_tz_var {
        return tz;
    }

    let from_file = std::fs::read_to_string("/etc/timezone")
        .ok()
        .and_then(|v| v.trim().parse::<Tz>().ok());
    if let Some(tz) = from_file {
        return tz;
    }

    std::fs::read_link("/etc/localtime")
        .ok()
        .and_then(|target| {
            let target = target.to_string_lossy().into_owned();
            target
                .split_once("zoneinfo/")
                .and_then(|(_, name)| name.parse::<Tz>().ok())
        })
        .unwrap_or(Tz::UTC)
}

/// Fully qualified name of this host as reported in `gatheredAt`
pub fn this_host() -> String {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    qualify(name, canonical_name)
}

/// `resolve`'s answer when it is a dotted name, else `name` unchanged
fn qualify(name: String, resolve: impl Fn(&str) -> Option<String>) -> String {
    match resolve(&name) {
        Some(fqdn) if fqdn.contains('.') => fqdn,
        _ => name,
    }
}

/// Forward then reverse lookup of `name`, skipping loopback addresses
fn canonical_name(name: &str) -> Option<String> {
    let addrs = match dns_lookup::lookup_host(name) {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(host = %name, error = %e, "Host name lookup failed");
            return None;
        }
    };
    addrs
        .iter()
        .filter(|addr| !addr.is_loopback())
        .find_map(|addr| dns_lookup::lookup_addr(addr).ok())
        .filter(|fqdn| fqdn.contains('.'))
}

pub fn render_utc(instant: DateTime<Utc>) -> String {
    instant.format(UTC_TIME_FORMAT).to_string()
}

pub fn render_local(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format(LOCAL_TIME_FORMAT).to_string()
}

/// A record file written for one consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerRecord {
    pub consumer: String,
    pub path: PathBuf,
}

/// A consumer that did not get a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedConsumer {
    pub consumer: String,
    pub reason: String,
}

/// What happened during fan-out
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
    pub written: Vec<ConsumerRecord>,
    pub skipped: Vec<SkippedConsumer>,
    /// Local-time rendering shown to the operator
    pub local_summary: String,
}

pub struct ResultPublisher {
    output_root: PathBuf,
    tz: Tz,
    gathered_at: String,
}

impl ResultPublisher {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            tz: local_timezone(),
            gathered_at: this_host(),
        }
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    pub fn with_gathered_at(mut self, host: impl Into<String>) -> Self {
        self.gathered_at = host.into();
        self
    }

    /// Build the run's record, stamped now
    pub fn build_record(&self, fragment: ResultFragment, metric: &MetricConfig) -> ResultRecord {
        self.build_record_at(fragment, metric, Utc::now())
    }

    /// Build the run's record as of `now`
    ///
    /// `wlcg` fragments use their embedded timestamp instead of `now` when
    /// it parses.
    pub fn build_record_at(
        &self,
        fragment: ResultFragment,
        metric: &MetricConfig,
        now: DateTime<Utc>,
    ) -> ResultRecord {
        if metric.trim_length > 0 {
            debug!(
                trim_length = metric.trim_length,
                "Trimming details because details-data-trim-length is set"
            );
        }

        match fragment {
            ResultFragment::Brief { status, details } => ResultRecord {
                metric_name: metric.name.clone(),
                metric_type: metric.metric_type.clone(),
                status,
                service_type: metric.service_type.clone(),
                service_uri: metric.target.uri.clone(),
                gathered_at: self.gathered_at.clone(),
                timestamp: now,
                utc_timestamp: render_utc(now),
                local_timestamp: render_local(now, self.tz),
                details_data: truncate_bytes(&details, metric.trim_length).to_string(),
                verbatim: None,
            },
            ResultFragment::Wlcg(output) => {
                let output = output.trimmed(metric.trim_length);
                let embedded = output.timestamp();
                let timestamp = embedded.unwrap_or(now);
                let utc_timestamp = render_utc(timestamp);
                let local_timestamp = render_local(timestamp, self.tz);
                // An unparseable timestamp line is left exactly as the probe wrote it
                let local = if embedded.is_some() {
                    output.with_timestamp(&local_timestamp)
                } else {
                    output.text.clone()
                };
                let field = |key: &str, fallback: &str| {
                    output.field(key).unwrap_or(fallback).to_string()
                };

                ResultRecord {
                    metric_name: field("metricName", metric.name.as_str()),
                    metric_type: field("metricType", metric.metric_type.as_str()),
                    status: output.status(),
                    service_type: field("serviceType", metric.service_type.as_str()),
                    service_uri: field("serviceURI", metric.target.uri.as_str()),
                    gathered_at: field("gatheredAt", self.gathered_at.as_str()),
                    timestamp,
                    utc_timestamp,
                    local_timestamp,
                    details_data: output.details().unwrap_or_default().to_string(),
                    verbatim: Some(VerbatimRecord {
                        utc: output.text.clone(),
                        local,
                    }),
                }
            }
        }
    }

    /// Write `record` for every consumer in `consumers`
    pub fn publish(&self, record: &ResultRecord, consumers: &[String]) -> PublishReport {
        let utc = record.render_utc();
        let local = record.render_local();
        let mut report = PublishReport {
            local_summary: local.clone(),
            ..Default::default()
        };

        for consumer in consumers {
            let body = if consumer == HTML_CONSUMER { &local } else { &utc };
            match self.write_consumer_record(consumer, &record.metric_name, body) {
                Ok(path) => {
                    info!(consumer = %consumer, path = %path.display(), "Created consumer record");
                    report.written.push(ConsumerRecord {
                        consumer: consumer.clone(),
                        path,
                    });
                }
                Err(e) => {
                    warn!(consumer = %consumer, error = %e, "Cannot write record for consumer");
                    report.skipped.push(SkippedConsumer {
                        consumer: consumer.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    fn consumer_dir(&self, consumer: &str) -> Result<PathBuf> {
        let dir = self.output_root.join(consumer);

        if dir.exists() {
            if !dir.is_dir() {
                return Err(Error::PublishError(format!(
                    "'{}' exists and is not a directory",
                    dir.display()
                )));
            }
            return Ok(dir);
        }

        info!(path = %dir.display(), "Creating consumer directory");
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder.create(&dir).map_err(|e| {
            Error::PublishError(format!("failed to make directory '{}': {}", dir.display(), e))
        })?;
        Ok(dir)
    }

    fn write_consumer_record(&self, consumer: &str, metric: &str, body: &str) -> Result<PathBuf> {
        let dir = self.consumer_dir(consumer)?;

        let prefix = format!("{}.", metric.replace('/', "_"));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(6)
            .tempfile_in(&dir)
            .map_err(|e| {
                Error::PublishError(format!("'{}' is not writable: {}", dir.display(), e))
            })?;
        file.write_all(body.as_bytes())?;
        file.flush()?;

        let (_, path) = file
            .keep()
            .map_err(|e| Error::PublishError(format!("failed to keep record: {}", e)))?;
        Ok(path)
    }
}
