//! Instance readiness polling
//!
//! Fixed-interval status reads until the instance is running and its remote
//! shell port has been forwarded. Boot time dominates, so there is no backoff.

use crate::error::{OrchestratorError, Result};
use crate::instance::{ConnectionEndpoint, InstanceStatus, REMOTE_SHELL_PORT};
use crate::provider::GpuMarketplace;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Waits for an instance to become connectable
pub struct ReadinessPoller {
    provider: Arc<dyn GpuMarketplace>,
    shell_port: u16,
}

impl ReadinessPoller {
    /// Create a poller for the standard remote shell port
    pub fn new(provider: Arc<dyn GpuMarketplace>) -> Self {
        Self {
            provider,
            shell_port: REMOTE_SHELL_PORT,
        }
    }

    /// Use a different internal shell port
    pub fn with_shell_port(mut self, port: u16) -> Self {
        self.shell_port = port;
        self
    }

    /// Poll until `instance_id` is running with a shell port mapping.
    ///
    /// `error`/`terminated` fail at once with `ProvisionFailed`. Failed status
    /// reads are logged and polling continues. Past `deadline` the result is
    /// `ReadinessTimeout` carrying the last status seen.
    pub async fn await_running(
        &self,
        instance_id: &str,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<ConnectionEndpoint> {
        let start = Instant::now();
        let mut last_status: Option<InstanceStatus> = None;
        let mut polls = 0u32;

        info!(instance_id = %instance_id, deadline = ?deadline, "Waiting for instance to be running");

        loop {
            polls += 1;
            match self.provider.get_instance(instance_id).await {
                Ok(instance) => {
                    if last_status != Some(instance.status) {
                        info!(instance_id = %instance_id, status = %instance.status, "Instance status");
                    }
                    last_status = Some(instance.status);

                    if let Some(endpoint) = instance.connection_endpoint(self.shell_port) {
                        info!(
                            instance_id = %instance_id,
                            endpoint = %endpoint,
                            polls,
                            elapsed = ?start.elapsed(),
                            "Instance ready"
                        );
                        return Ok(endpoint);
                    }

                    if instance.status.is_terminal() {
                        return Err(OrchestratorError::ProvisionFailed {
                            instance_id: instance_id.to_string(),
                            status: instance.status,
                        });
                    }

                    if instance.status == InstanceStatus::Running {
                        debug!(instance_id = %instance_id, "Running, shell port not mapped yet");
                    }
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Status read failed");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(OrchestratorError::ReadinessTimeout {
                    instance_id: instance_id.to_string(),
                    last_status,
                    waited: elapsed,
                });
            }

            debug!(instance_id = %instance_id, elapsed = ?elapsed, "Instance not ready, polling again");
            tokio::time::sleep(poll_interval.min(deadline - elapsed)).await;
        }
    }
}
