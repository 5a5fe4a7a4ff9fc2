//! Target reachability check

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::process::{JobRunner, ProcessRunner, RunOutcome};
use crate::EnvironmentOverlay;

/// Outcome of probing a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachability {
    pub reachable: bool,
    /// Raw tool output, kept for the failure record
    pub output: String,
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self, host: &str) -> Reachability;
}

/// Single ICMP echo with a short reply wait
pub struct PingProbe {
    ping: String,
    runner: ProcessRunner,
    deadline: Duration,
}

impl PingProbe {
    pub fn new() -> Self {
        Self {
            ping: "/bin/ping".to_string(),
            runner: ProcessRunner::new(),
            deadline: Duration::from_secs(10),
        }
    }

    pub fn with_binary(mut self, ping: impl Into<String>) -> Self {
        self.ping = ping.into();
        self
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostProbe for PingProbe {
    async fn probe(&self, host: &str) -> Reachability {
        info!(host = %host, "Pinging host");
        let command = format!("{} -W 3 -c 1 {}", self.ping, host);

        match self
            .runner
            .run(&command, &EnvironmentOverlay::new(), self.deadline)
            .await
        {
            Ok(RunOutcome::Completed { exit_code, output }) => {
                debug!(exit_code, "Ping finished");
                Reachability {
                    reachable: exit_code == 0,
                    output,
                }
            }
            Ok(RunOutcome::TimedOut) => Reachability {
                reachable: false,
                output: format!("ping did not finish within {}s", self.deadline.as_secs()),
            },
            Err(e) => Reachability {
                reachable: false,
                output: e.to_string(),
            },
        }
    }
}
