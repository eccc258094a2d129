//! Resilient execution of the setup payload
//!
//! Payloads that upgrade kernel or driver packages reboot the machine halfway
//! through. The executor tells that apart from a real failure and keeps going:
//!
//! ```text
//! Uploading → Executing → Succeeded
//!                       → ScriptFailed                 (stop)
//!                       → Disconnected → settle → probe → Uploading
//!                                                      → RetriesExhausted
//! ```
//!
//! Upload failures and non-zero exits are never retried. Disconnects are
//! retried at most `max_retries` times.

use crate::config::Timeouts;
use crate::error::{OrchestratorError, Result};
use crate::instance::ConnectionEndpoint;
use crate::payload::SetupPayload;
use crate::probe::TransportAvailabilityProbe;
use crate::remote::{RemoteProcess, RemoteShell};
use crate::session::{DeploymentSession, SessionClassifier, SessionOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Retry budget and timing for [`ResilientExecutor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Additional attempts allowed after a disconnect
    pub max_retries: u32,

    /// How long the process may take to exit after its output ends
    pub grace_period: Duration,

    /// Pause after a disconnect before probing again
    pub settle_delay: Duration,

    /// Probe deadline after a disconnect (covers a full reboot)
    pub reboot_probe_deadline: Duration,

    /// Per-attempt probe timeout
    pub probe_attempt_timeout: Duration,

    /// Upper bound for a single execution
    pub execution_deadline: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::default(), 2)
    }
}

impl ExecutorConfig {
    /// Build from the deploy timing policy
    pub fn from_timeouts(timeouts: &Timeouts, max_retries: u32) -> Self {
        Self {
            max_retries,
            grace_period: timeouts.grace_period,
            settle_delay: timeouts.settle_delay,
            reboot_probe_deadline: timeouts.reboot_probe_deadline,
            probe_attempt_timeout: timeouts.probe_attempt_timeout,
            execution_deadline: timeouts.execution_deadline,
        }
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Attempts executed, including the successful one
    pub attempts_used: u32,

    /// Disconnects survived along the way
    pub disconnects: u32,

    /// Last output line of the successful attempt
    pub last_line: Option<String>,

    /// Wall time from first upload to success
    pub duration: Duration,
}

/// Uploads and runs a payload, surviving reboots
pub struct ResilientExecutor {
    shell: Arc<dyn RemoteShell>,
    probe: TransportAvailabilityProbe,
    classifier: SessionClassifier,
    config: ExecutorConfig,
}

impl ResilientExecutor {
    /// Create an executor over a remote shell
    pub fn new(shell: Arc<dyn RemoteShell>, config: ExecutorConfig) -> Self {
        let probe = TransportAvailabilityProbe::new(shell.clone())
            .with_attempt_timeout(config.probe_attempt_timeout);
        Self {
            shell,
            probe,
            classifier: SessionClassifier::default(),
            config,
        }
    }

    /// Replace the reboot classifier
    pub fn with_classifier(mut self, classifier: SessionClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run `payload` on `endpoint` to completion.
    ///
    /// The endpoint must already be reachable (see
    /// [`TransportAvailabilityProbe`]).
    pub async fn run(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &SetupPayload,
    ) -> Result<ExecutionReport> {
        let start = Instant::now();
        let max_attempts = self.config.max_retries + 1;
        let mut last_line: Option<String> = None;
        let mut disconnects = 0;

        for attempt in 0..max_attempts {
            info!(
                endpoint = %endpoint,
                attempt = attempt + 1,
                max_attempts,
                remote_path = %payload.remote_path,
                "Uploading setup payload"
            );
            self.shell
                .upload(endpoint, payload.script.as_bytes(), &payload.remote_path)
                .await
                .map_err(|e| OrchestratorError::UploadFailed {
                    instance_id: None,
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;

            let (session, outcome) = self.execute_once(endpoint, payload, attempt).await?;
            if session.last_line.is_some() {
                last_line = session.last_line.clone();
            }

            match outcome {
                SessionOutcome::Succeeded => {
                    info!(
                        endpoint = %endpoint,
                        attempts = attempt + 1,
                        elapsed = ?start.elapsed(),
                        "Setup completed"
                    );
                    return Ok(ExecutionReport {
                        attempts_used: attempt + 1,
                        disconnects,
                        last_line: session.last_line,
                        duration: start.elapsed(),
                    });
                }
                SessionOutcome::ScriptFailed(exit_code) => {
                    error!(
                        endpoint = %endpoint,
                        exit_code,
                        last_line = ?last_line,
                        log = %payload.log_path,
                        "Setup script failed"
                    );
                    return Err(OrchestratorError::ScriptFailed {
                        instance_id: None,
                        endpoint: endpoint.clone(),
                        exit_code,
                        last_line,
                        log_path: payload.log_path.clone(),
                    });
                }
                SessionOutcome::Disconnected => {
                    disconnects += 1;
                    if attempt + 1 >= max_attempts {
                        break;
                    }

                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt + 1,
                        reboot_detected = session.reboot_detected,
                        settle = ?self.config.settle_delay,
                        "Session disconnected, waiting for the host to come back"
                    );
                    tokio::time::sleep(self.config.settle_delay).await;

                    if !self
                        .probe
                        .await_reachable(endpoint, self.config.reboot_probe_deadline)
                        .await
                    {
                        error!(endpoint = %endpoint, "Host did not come back after disconnect");
                        return Err(OrchestratorError::RetriesExhausted {
                            instance_id: None,
                            endpoint: endpoint.clone(),
                            attempts: attempt + 1,
                            last_line,
                        });
                    }
                    info!(endpoint = %endpoint, "Host is back, re-running setup");
                }
            }
        }

        error!(endpoint = %endpoint, attempts = max_attempts, "Retry budget exhausted");
        Err(OrchestratorError::RetriesExhausted {
            instance_id: None,
            endpoint: endpoint.clone(),
            attempts: max_attempts,
            last_line,
        })
    }

    async fn execute_once(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &SetupPayload,
        attempt: u32,
    ) -> Result<(DeploymentSession, SessionOutcome)> {
        let mut session = DeploymentSession::new(attempt);
        let mut process = self.shell.execute(endpoint, &payload.command()).await?;

        let exit = if self.stream(&mut process, &mut session).await {
            process.wait_exit(self.config.grace_period).await
        } else {
            warn!(
                endpoint = %endpoint,
                deadline = ?self.config.execution_deadline,
                "Execution deadline reached, tearing down session"
            );
            process.kill();
            None
        };

        if exit.is_none() {
            warn!(endpoint = %endpoint, "No exit status from remote session");
        }
        let outcome = self.classifier.classify(exit, session.reboot_detected);
        info!(
            endpoint = %endpoint,
            attempt = attempt + 1,
            outcome = ?outcome,
            lines = session.lines_seen,
            "Session finished"
        );
        Ok((session, outcome))
    }

    /// Forward output until the stream ends; false if the execution deadline hit first
    async fn stream(&self, process: &mut RemoteProcess, session: &mut DeploymentSession) -> bool {
        let deadline = Instant::now() + self.config.execution_deadline;
        loop {
            match tokio::time::timeout_at(deadline, process.next_line()).await {
                Ok(Some(line)) => {
                    info!("[remote] {}", line);
                    session.observe(&line, &self.classifier);
                }
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}
