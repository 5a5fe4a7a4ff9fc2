//! Layered INI-style configuration store
//!
//! Probe configuration is spread across several files (the global
//! `rsv.conf`, the per-metric file and an optional per-host override).
//! Each file is read into the same [`IniConfig`] in order, so later files
//! override earlier ones while defaults registered up front fill the gaps.

use std::path::Path;

use tracing::{debug, info};

use crate::{Error, Result};

/// Read-only view of a configuration store
///
/// The executor only ever reads configuration through this trait, so tests
/// can hand it an in-memory store without touching the filesystem.
pub trait ConfigStore: Send + Sync {
    /// Get the raw value of `key` in `section`
    fn get(&self, section: &str, key: &str) -> Result<String>;

    /// Ordered option names of `section`
    fn options(&self, section: &str) -> Result<Vec<String>>;

    /// Get a value and parse it as an integer
    fn get_int(&self, section: &str, key: &str) -> Result<i64> {
        let value = self.get(section, key)?;
        value.trim().parse::<i64>().map_err(|_| Error::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value,
        })
    }

    /// Get a value and parse it as a boolean
    fn get_bool(&self, section: &str, key: &str) -> Result<bool> {
        let value = self.get(section, key)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(Error::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Check whether `key` is set in `section`
    fn has_option(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_ok()
    }
}

#[derive(Debug, Clone, Default)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn set(&mut self, key: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }
}

/// In-memory INI configuration with ordered sections and keys
#[derive(Debug, Clone, Default)]
pub struct IniConfig {
    sections: Vec<Section>,
}

impl IniConfig {
    pub fn new() -> Self {
        Self::default()
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Set a value, creating the section if needed
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).set(key, value.into());
    }

    /// Register a default; identical to `set` but reads better at call sites
    /// that run before any file is loaded
    pub fn set_default(&mut self, section: &str, key: &str, value: impl ToString) {
        self.set(section, key, value.to_string());
    }

    /// Merge INI text into the store
    ///
    /// `origin` only names the source in error messages.
    pub fn load_str(&mut self, contents: &str, origin: &str) -> Result<()> {
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (lineno, line) in contents.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // Indented lines continue the previous value
            if line.starts_with(|c: char| c.is_whitespace()) {
                if let (Some(section), Some(key)) = (&current, &last_key) {
                    let section = section.clone();
                    let key = key.clone();
                    let existing = self.get(&section, &key).unwrap_or_default();
                    let joined = if existing.is_empty() {
                        trimmed.to_string()
                    } else {
                        format!("{}\n{}", existing, trimmed)
                    };
                    self.set(&section, &key, joined);
                    continue;
                }
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    Error::ConfigError(format!(
                        "{}:{}: unterminated section header '{}'",
                        origin,
                        lineno + 1,
                        trimmed
                    ))
                })?;
                let name = name.trim().to_string();
                self.section_mut(&name);
                current = Some(name);
                last_key = None;
                continue;
            }

            let section = current.clone().ok_or_else(|| {
                Error::ConfigError(format!(
                    "{}:{}: option '{}' appears before any section header",
                    origin,
                    lineno + 1,
                    trimmed
                ))
            })?;

            let split_at = trimmed.find(|c: char| c == '=' || c == ':').ok_or_else(|| {
                Error::ConfigError(format!(
                    "{}:{}: expected 'key = value', got '{}'",
                    origin,
                    lineno + 1,
                    trimmed
                ))
            })?;
            let key = trimmed[..split_at].trim().to_string();
            let value = trimmed[split_at + 1..].trim().to_string();
            self.set(&section, &key, value);
            last_key = Some(key);
        }

        Ok(())
    }

    /// Merge a file into the store
    ///
    /// A missing file is an error when `required`, otherwise it is skipped
    /// and `false` is returned.
    pub fn load_file(&mut self, path: &Path, required: bool) -> Result<bool> {
        debug!(path = %path.display(), "Reading configuration file");

        if !path.exists() {
            if required {
                return Err(Error::ConfigError(format!(
                    "missing required configuration file '{}'",
                    path.display()
                )));
            }
            info!(path = %path.display(), "Configuration file does not exist");
            return Ok(false);
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read '{}': {}", path.display(), e))
        })?;
        self.load_str(&contents, &path.display().to_string())?;
        Ok(true)
    }
}

impl ConfigStore for IniConfig {
    fn get(&self, section: &str, key: &str) -> Result<String> {
        let sect = self
            .section(section)
            .ok_or_else(|| Error::NoSection(section.to_string()))?;
        sect.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::MissingOption {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    fn options(&self, section: &str) -> Result<Vec<String>> {
        self.section(section)
            .map(|s| s.entries.iter().map(|(k, _)| k.clone()).collect())
            .ok_or_else(|| Error::NoSection(section.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_override() {
        let mut config = IniConfig::new();
        config.set_default("rsv", "job-timeout", 300);
        config
            .load_str(
                "# global\n[rsv]\njob-timeout = 60\nconsumers: html-consumer, gratia-consumer\n",
                "rsv.conf",
            )
            .unwrap();

        assert_eq!(config.get_int("rsv", "job-timeout").unwrap(), 60);
        assert_eq!(
            config.get("rsv", "consumers").unwrap(),
            "html-consumer, gratia-consumer"
        );
        assert_eq!(
            config.options("rsv").unwrap(),
            vec!["job-timeout".to_string(), "consumers".to_string()]
        );
    }

    #[test]
    fn test_key_order_survives_override() {
        let mut config = IniConfig::new();
        config
            .load_str("[probe args]\nfirst = 1\nsecond = 2\n", "a")
            .unwrap();
        config.load_str("[probe args]\nfirst = 10\n", "b").unwrap();

        assert_eq!(config.options("probe args").unwrap(), vec!["first", "second"]);
        assert_eq!(config.get("probe args", "first").unwrap(), "10");
    }

    #[test]
    fn test_lookup_errors() {
        let mut config = IniConfig::new();
        config.load_str("[rsv]\njob-timeout = soon\n", "x").unwrap();

        assert!(matches!(config.get("nope", "k"), Err(Error::NoSection(_))));
        assert!(matches!(
            config.get("rsv", "k"),
            Err(Error::MissingOption { .. })
        ));
        assert!(matches!(
            config.get_int("rsv", "job-timeout"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(config.get("rsv", "k").unwrap_err().is_not_found());
    }

    #[test]
    fn test_continuation_and_keys_are_case_sensitive() {
        let mut config = IniConfig::new();
        config
            .load_str("[m env]\nPATH = APPEND | /opt/bin\n  /more\npath = SET | x\n", "x")
            .unwrap();

        assert_eq!(config.get("m env", "PATH").unwrap(), "APPEND | /opt/bin\n/more");
        assert_eq!(config.get("m env", "path").unwrap(), "SET | x");
    }

    #[test]
    fn test_malformed_input() {
        let mut config = IniConfig::new();
        assert!(config.load_str("key = value\n", "x").is_err());
        assert!(config.load_str("[rsv\n", "x").is_err());
        assert!(config.load_str("[rsv]\njust words\n", "x").is_err());
    }

    #[test]
    fn test_get_bool() {
        let mut config = IniConfig::new();
        config.set("m", "need-proxy", "False");
        config.set("m", "other", "maybe");
        assert!(!config.get_bool("m", "need-proxy").unwrap());
        assert!(config.get_bool("m", "other").is_err());
    }

    #[test]
    fn test_load_file_optional() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IniConfig::new();
        let missing = dir.path().join("missing.conf");
        assert!(!config.load_file(&missing, false).unwrap());
        assert!(config.load_file(&missing, true).is_err());

        let present = dir.path().join("rsv.conf");
        std::fs::write(&present, "[rsv]\nuser = rsvuser\n").unwrap();
        assert!(config.load_file(&present, true).unwrap());
        assert_eq!(config.get("rsv", "user").unwrap(), "rsvuser");
    }
}
