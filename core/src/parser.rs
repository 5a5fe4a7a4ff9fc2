//! Probe output decoding

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

use crate::{OutputFormat, Status};

pub const BRIEF_HEADER: &str = "JOB RESULTS:";

/// UTC rendering used on the wire
pub const UTC_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Why probe output could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("first line is not '{}'", BRIEF_HEADER)]
    MissingHeader,

    #[error("no status line after the header")]
    MissingStatus,

    #[error("no details after the status line")]
    MissingDetails,
}

/// Decoded probe output, before timestamps and trimming are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultFragment {
    /// Status and details, rendered into a wire record later
    Brief { status: Status, details: String },
    /// A complete record produced by the probe itself
    Wlcg(WlcgOutput),
}

impl ResultFragment {
    /// Fragment for a failure detected by the runner itself
    pub fn critical(details: impl Into<String>) -> Self {
        Self::Brief {
            status: Status::Critical,
            details: details.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Brief { status, .. } => status.clone(),
            Self::Wlcg(output) => output.status(),
        }
    }
}

/// Verbatim `wlcg` record text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WlcgOutput {
    pub text: String,
}

const DETAILS_KEY: &str = "detailsData:";

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^timestamp: (\S+)").expect("valid timestamp regex"))
}

impl WlcgOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Value of a single-line `key: value` field
    pub fn field(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}:", key);
        self.text
            .lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .map(str::trim)
    }

    pub fn status(&self) -> Status {
        self.field("metricStatus")
            .map(Status::from)
            .unwrap_or(Status::Unknown)
    }

    /// Raw text of the `timestamp:` field
    pub fn timestamp_text(&self) -> Option<&str> {
        timestamp_regex()
            .captures(self.header())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Embedded timestamp, if present and well formed
    ///
    /// Accepts the wire form `YYYY-MM-DDTHH:MM:SSZ` and any RFC 3339 value.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp_text()?;
        NaiveDateTime::parse_from_str(raw, UTC_TIME_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)))
            .ok()
    }

    /// Copy of the text with every `timestamp:` field line replaced by
    /// `rendered`; the `detailsData` value is never touched
    pub fn with_timestamp(&self, rendered: &str) -> String {
        let header = self.header();
        let mut text = timestamp_regex()
            .replace_all(header, |_: &regex::Captures<'_>| {
                format!("timestamp: {}", rendered)
            })
            .into_owned();
        text.push_str(&self.text[header.len()..]);
        text
    }

    /// Field lines ahead of `detailsData`
    fn header(&self) -> &str {
        match self.details_line_start() {
            Some(start) => &self.text[..start],
            None => &self.text,
        }
    }

    fn details_line_start(&self) -> Option<usize> {
        if self.text.starts_with(DETAILS_KEY) {
            Some(0)
        } else {
            self.text.find(&format!("\n{}", DETAILS_KEY)).map(|i| i + 1)
        }
    }

    /// Byte span of the `detailsData` value, which runs up to the `EOT` line
    fn details_span(&self) -> Option<(usize, usize)> {
        let line_start = self.details_line_start()?;
        let mut start = line_start + DETAILS_KEY.len();
        if self.text[start..].starts_with(' ') {
            start += 1;
        }
        let end = self.text[start..]
            .find("\nEOT")
            .map(|i| start + i)
            .unwrap_or_else(|| self.text.trim_end_matches('\n').len().max(start));
        Some((start, end))
    }

    /// Contents of the `detailsData` field
    pub fn details(&self) -> Option<&str> {
        self.details_span().map(|(s, e)| &self.text[s..e])
    }

    /// Copy with `detailsData` cut to at most `limit` bytes (0 keeps all)
    pub fn trimmed(&self, limit: usize) -> WlcgOutput {
        match self.details_span() {
            Some((start, end)) if limit > 0 && end - start > limit => {
                let details = truncate_bytes(&self.text[start..end], limit);
                let mut text = String::with_capacity(self.text.len());
                text.push_str(&self.text[..start]);
                text.push_str(details);
                text.push_str(&self.text[end..]);
                WlcgOutput { text }
            }
            _ => self.clone(),
        }
    }
}

/// Cut `s` to at most `limit` bytes on a character boundary; 0 disables
pub fn truncate_bytes(s: &str, limit: usize) -> &str {
    if limit == 0 || s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Decode raw probe output according to its declared format
pub fn parse(raw: &str, format: OutputFormat) -> Result<ResultFragment, ParseError> {
    match format {
        OutputFormat::Wlcg => Ok(ResultFragment::Wlcg(WlcgOutput::new(raw))),
        OutputFormat::Brief => parse_brief(raw),
    }
}

fn parse_brief(raw: &str) -> Result<ResultFragment, ParseError> {
    let mut lines = raw.split('\n');

    if lines.next() != Some(BRIEF_HEADER) {
        return Err(ParseError::MissingHeader);
    }

    let status = lines
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingStatus)?;

    let details = lines.collect::<Vec<_>>().join("\n");
    let details = details.trim_end_matches('\n');
    if details.is_empty() {
        return Err(ParseError::MissingDetails);
    }

    Ok(ResultFragment::Brief {
        status: Status::from(status),
        details: details.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WLCG: &str = "metricName: org.osg.certificates.cacert-expiry\n\
        metricType: status\n\
        timestamp: 2010-07-25T05:18:14Z\n\
        metricStatus: WARNING\n\
        serviceType: OSG-CE\n\
        serviceURI: ce.example.org\n\
        gatheredAt: rsv.example.org\n\
        summaryData: WARNING\n\
        detailsData: first line\n\
        second line\n\
        EOT\n";

    #[test]
    fn test_brief() {
        let fragment = parse("JOB RESULTS:\n  OK \nall good\n", OutputFormat::Brief).unwrap();
        assert_eq!(
            fragment,
            ResultFragment::Brief {
                status: Status::Ok,
                details: "all good".to_string()
            }
        );

        let fragment = parse("JOB RESULTS:\nCRITICAL\nline 1\nline 2", OutputFormat::Brief).unwrap();
        assert_eq!(
            fragment,
            ResultFragment::Brief {
                status: Status::Critical,
                details: "line 1\nline 2".to_string()
            }
        );
    }

    #[test]
    fn test_brief_rejects_malformed() {
        for raw in [
            "",
            "job results:\nOK\ndetails",
            " JOB RESULTS:\nOK\ndetails",
            "Some banner\nJOB RESULTS:\nOK\ndetails",
            "JOB RESULTS: \nOK\ndetails",
        ] {
            assert_eq!(
                parse(raw, OutputFormat::Brief),
                Err(ParseError::MissingHeader),
                "{:?}",
                raw
            );
        }
        assert_eq!(
            parse("JOB RESULTS:\n   \ndetails", OutputFormat::Brief),
            Err(ParseError::MissingStatus)
        );
        assert_eq!(
            parse("JOB RESULTS:\nOK\n", OutputFormat::Brief),
            Err(ParseError::MissingDetails)
        );
    }

    #[test]
    fn test_wlcg_fields() {
        let output = WlcgOutput::new(WLCG);
        assert_eq!(output.status(), Status::Warning);
        assert_eq!(output.field("serviceURI"), Some("ce.example.org"));
        assert_eq!(output.details(), Some("first line\nsecond line"));
        assert_eq!(
            output.timestamp(),
            Some(Utc.with_ymd_and_hms(2010, 7, 25, 5, 18, 14).unwrap())
        );
    }

    #[test]
    fn test_wlcg_timestamp_rewrite() {
        let output = WlcgOutput::new(WLCG);
        let local = output.with_timestamp("2010-07-25 00:18:14 CDT");
        assert!(local.contains("timestamp: 2010-07-25 00:18:14 CDT\nmetricStatus"));
        assert_eq!(local.replace("2010-07-25 00:18:14 CDT", "2010-07-25T05:18:14Z"), WLCG);
    }

    #[test]
    fn test_wlcg_fractional_and_offset_timestamps() {
        let output = WlcgOutput::new(WLCG.replace("05:18:14Z", "05:18:14.5Z"));
        assert_eq!(output.timestamp_text(), Some("2010-07-25T05:18:14.5Z"));
        assert_eq!(
            output.timestamp(),
            Some(
                Utc.with_ymd_and_hms(2010, 7, 25, 5, 18, 14).unwrap()
                    + chrono::Duration::milliseconds(500)
            )
        );

        let output = WlcgOutput::new(WLCG.replace("05:18:14Z", "00:18:14-05:00"));
        assert_eq!(
            output.timestamp(),
            Some(Utc.with_ymd_and_hms(2010, 7, 25, 5, 18, 14).unwrap())
        );

        let output = WlcgOutput::new(WLCG.replace("2010-07-25T05:18:14Z", "yesterday"));
        assert_eq!(output.timestamp_text(), Some("yesterday"));
        assert_eq!(output.timestamp(), None);
    }

    #[test]
    fn test_wlcg_rewrite_skips_details() {
        let text = WLCG.replace(
            "second line\n",
            "timestamp: 1999-01-01T00:00:00Z\nmetricStatus: OK\n",
        );
        let output = WlcgOutput::new(text.as_str());
        assert_eq!(
            output.timestamp(),
            Some(Utc.with_ymd_and_hms(2010, 7, 25, 5, 18, 14).unwrap())
        );

        let local = output.with_timestamp("2010-07-25 00:18:14 CDT");
        assert!(local.contains("timestamp: 2010-07-25 00:18:14 CDT\nmetricStatus: WARNING"));
        assert!(local.contains("first line\ntimestamp: 1999-01-01T00:00:00Z\n"));
        assert_eq!(output.status(), Status::Warning);

        let doubled = WlcgOutput::new(WLCG.replace(
            "metricStatus: WARNING\n",
            "metricStatus: WARNING\ntimestamp: 2010-07-25T05:18:14Z\n",
        ));
        let local = doubled.with_timestamp("X");
        assert_eq!(local.matches("timestamp: X\n").count(), 2);
    }

    #[test]
    fn test_wlcg_trim() {
        let output = WlcgOutput::new(WLCG);
        let trimmed = output.trimmed(5);
        assert_eq!(trimmed.details(), Some("first"));
        assert!(trimmed.text.ends_with("detailsData: first\nEOT\n"));
        assert_eq!(output.trimmed(0), output);
        assert_eq!(output.trimmed(1000), output);
    }

    #[test]
    fn test_wlcg_without_timestamp() {
        let output = WlcgOutput::new("metricStatus: OK\nEOT\n");
        assert_eq!(output.timestamp(), None);
        assert_eq!(output.with_timestamp("x"), output.text);
        assert_eq!(output.details(), None);
    }

    #[test]
    fn test_truncate_bytes() {
        assert_eq!(truncate_bytes("abcdef", 3), "abc");
        assert_eq!(truncate_bytes("abcdef", 0), "abcdef");
        assert_eq!(truncate_bytes("ab", 10), "ab");
        // never splits a multi-byte character
        assert_eq!(truncate_bytes("aé", 2), "a");
    }
}
