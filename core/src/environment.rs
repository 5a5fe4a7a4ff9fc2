//! Job environment directives
//!
//! A metric's `<metric> env` section describes how the probe's environment
//! differs from the runner's. Directives are resolved against the ambient
//! environment into an [`EnvironmentOverlay`] that is applied to the spawned
//! command only; the runner's own process environment is never modified.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ConfigStore, Error, Result};

/// What a directive does to its variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvAction {
    Set,
    Unset,
    Append,
    Prepend,
}

impl EnvAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "SET",
            Self::Unset => "UNSET",
            Self::Append => "APPEND",
            Self::Prepend => "PREPEND",
        }
    }
}

impl FromStr for EnvAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SET" => Ok(Self::Set),
            "UNSET" => Ok(Self::Unset),
            "APPEND" => Ok(Self::Append),
            "PREPEND" => Ok(Self::Prepend),
            other => Err(Error::ConfigError(format!(
                "invalid environment action '{}' (must be one of: SET UNSET APPEND PREPEND)",
                other
            ))),
        }
    }
}

impl fmt::Display for EnvAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `VAR = ACTION | VALUE` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDirective {
    pub variable: String,
    pub action: EnvAction,
    pub value: String,
}

impl EnvironmentDirective {
    pub fn new(variable: impl Into<String>, action: EnvAction, value: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            action,
            value: value.into(),
        }
    }

    /// Parse the right-hand side of a directive (`ACTION | VALUE`)
    pub fn parse(variable: &str, setting: &str) -> Result<Self> {
        let (action, value) = setting.split_once('|').ok_or_else(|| {
            Error::ConfigError(format!(
                "invalid entry '{} = {}': format must be VAR = ACTION | VALUE",
                variable, setting
            ))
        })?;

        Ok(Self {
            variable: variable.to_string(),
            action: action.parse()?,
            value: value.trim().to_string(),
        })
    }
}

/// Read the `<metric> env` section
///
/// Malformed entries are dropped with a warning. `!!VDT_LOCATION!!` in a
/// value is replaced by `vdt_location`. A missing section yields no
/// directives.
pub fn load_directives(
    store: &dyn ConfigStore,
    section: &str,
    vdt_location: &str,
) -> Vec<EnvironmentDirective> {
    let options = match store.options(section) {
        Ok(options) => options,
        Err(_) => {
            debug!(section = %section, "No environment section in metric configuration");
            return Vec::new();
        }
    };

    let mut directives = Vec::new();
    for var in options {
        let setting = match store.get(section, &var) {
            Ok(setting) => setting,
            Err(_) => continue,
        };

        match EnvironmentDirective::parse(&var, &setting) {
            Ok(mut directive) => {
                directive.value = directive.value.replace("!!VDT_LOCATION!!", vdt_location);
                directives.push(directive);
            }
            Err(e) => {
                warn!(section = %section, error = %e, "Ignoring environment setting");
            }
        }
    }
    directives
}

/// Environment changes for one spawned command
///
/// Every entry is either `Some(value)` (set) or `None` (remove), keyed by
/// variable name, and is layered over the inherited environment when the
/// command is spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverlay {
    changes: Vec<(String, Option<String>)>,
}

impl EnvironmentOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve directives in order against `base`
    ///
    /// Later directives see the effect of earlier ones, so an APPEND after a
    /// SET of the same variable composes with the SET value.
    pub fn resolve(directives: &[EnvironmentDirective], base: &HashMap<String, String>) -> Self {
        let mut overlay = Self::new();
        for directive in directives {
            let current = overlay.effective(&directive.variable, base);
            let next = match directive.action {
                EnvAction::Set => Some(directive.value.clone()),
                EnvAction::Unset => None,
                EnvAction::Append => Some(match current {
                    Some(existing) => format!("{}:{}", existing, directive.value),
                    None => directive.value.clone(),
                }),
                EnvAction::Prepend => Some(match current {
                    Some(existing) => format!("{}:{}", directive.value, existing),
                    None => directive.value.clone(),
                }),
            };
            debug!(
                var = %directive.variable,
                action = %directive.action,
                value = %directive.value,
                "Environment directive"
            );
            overlay.put(&directive.variable, next);
        }
        overlay
    }

    /// Resolve directives against the runner's current environment
    pub fn from_process_env(directives: &[EnvironmentDirective]) -> Self {
        let base: HashMap<String, String> = std::env::vars().collect();
        Self::resolve(directives, &base)
    }

    fn put(&mut self, variable: &str, value: Option<String>) {
        match self.changes.iter_mut().find(|(k, _)| k == variable) {
            Some(entry) => entry.1 = value,
            None => self.changes.push((variable.to_string(), value)),
        }
    }

    /// Set a variable unconditionally
    pub fn set(&mut self, variable: &str, value: impl Into<String>) {
        self.put(variable, Some(value.into()));
    }

    /// Remove a variable from the child's environment
    pub fn unset(&mut self, variable: &str) {
        self.put(variable, None);
    }

    /// Value the child will see for `variable`
    pub fn effective(&self, variable: &str, base: &HashMap<String, String>) -> Option<String> {
        match self.changes.iter().find(|(k, _)| k == variable) {
            Some((_, value)) => value.clone(),
            None => base.get(variable).cloned(),
        }
    }

    /// Apply to a command about to be spawned
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        for (key, value) in &self.changes {
            match value {
                Some(value) => {
                    cmd.env(key, value);
                }
                None => {
                    cmd.env_remove(key);
                }
            }
        }
    }

    /// Apply to `base` and return the child's full environment
    pub fn applied_to(&self, base: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = base.clone();
        for (key, value) in &self.changes {
            match value {
                Some(value) => {
                    env.insert(key.clone(), value.clone());
                }
                None => {
                    env.remove(key);
                }
            }
        }
        env
    }

    /// Layer `other` on top of this overlay
    pub fn extend(&mut self, other: &EnvironmentOverlay) {
        for (key, value) in &other.changes {
            self.put(key, value.clone());
        }
    }
}
