//! Remote shell availability probing
//!
//! A provider reporting `running` says nothing about whether sshd is up yet.
//! The probe opens real sessions until one completes, backing off linearly:
//! 5s, 10s, 15s, 20s, then 20s flat.

use crate::instance::ConnectionEndpoint;
use crate::remote::RemoteShell;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Backoff step
const DELAY_STEP: Duration = Duration::from_secs(5);

/// Backoff ceiling
const MAX_DELAY: Duration = Duration::from_secs(20);

/// Delay after failed attempt `attempt` (1-based)
pub fn probe_delay(attempt: u32) -> Duration {
    (DELAY_STEP * attempt.max(1)).min(MAX_DELAY)
}

/// Polls an endpoint until a remote shell session succeeds
pub struct TransportAvailabilityProbe {
    shell: Arc<dyn RemoteShell>,
    attempt_timeout: Duration,
}

impl TransportAvailabilityProbe {
    /// Create a probe with the default 10s per-attempt timeout
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    /// Set the per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// True on the first successful session, false once `deadline` elapses.
    ///
    /// Transport errors count as a failed attempt, and so does an attempt
    /// that outlives its timeout, whatever the shell does with it.
    pub async fn await_reachable(&self, endpoint: &ConnectionEndpoint, deadline: Duration) -> bool {
        let start = Instant::now();
        let until = start + deadline;
        let mut attempt = 0u32;

        info!(endpoint = %endpoint, deadline = ?deadline, "Waiting for remote shell");

        loop {
            attempt += 1;
            let remaining = until.saturating_duration_since(Instant::now());
            let timeout = self.attempt_timeout.min(remaining).max(Duration::from_secs(1));

            match tokio::time::timeout(timeout, self.shell.probe(endpoint, timeout)).await {
                Ok(Ok(true)) => {
                    info!(
                        endpoint = %endpoint,
                        attempt,
                        elapsed = ?start.elapsed(),
                        "Remote shell reachable"
                    );
                    return true;
                }
                Ok(Ok(false)) => debug!(endpoint = %endpoint, attempt, "Probe attempt failed"),
                Ok(Err(e)) => warn!(endpoint = %endpoint, attempt, error = %e, "Probe attempt errored"),
                Err(_) => warn!(endpoint = %endpoint, attempt, timeout = ?timeout, "Probe attempt timed out"),
            }

            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let delay = probe_delay(attempt).min(remaining);
            info!(
                endpoint = %endpoint,
                attempt,
                retry_in = ?delay,
                elapsed = ?start.elapsed(),
                "Remote shell not reachable yet"
            );
            tokio::time::sleep(delay).await;

            if Instant::now() >= until {
                break;
            }
        }

        warn!(endpoint = %endpoint, attempts = attempt, waited = ?start.elapsed(), "Remote shell unreachable");
        false
    }
}
