//! Instance listing and termination
//!
//! Termination is destructive and costs nothing to get wrong only once, so
//! every delete goes through an injected [`Confirm`] capability. Batches are
//! not atomic: each instance is deleted on its own and reported on its own.

use crate::error::{OrchestratorError, Result};
use crate::instance::Instance;
use crate::provider::GpuMarketplace;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Operator confirmation for destructive or billable actions
pub trait Confirm: Send + Sync {
    /// Ask `prompt`; true means proceed
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Approves everything (`--yes`)
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Confirm for AutoApprove {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Why one termination did not happen
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminateError {
    /// Operator said no
    #[error("termination declined by operator")]
    Declined,

    /// Provider answered outside 200/204
    #[error("provider rejected termination: {status} - {message}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Provider message
        message: String,
    },

    /// Request never got an answer
    #[error("termination request failed: {0}")]
    Transport(String),
}

impl From<OrchestratorError> for TerminateError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Api { status, message } => Self::Rejected { status, message },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Per-instance result of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateOutcome {
    /// Instance id
    pub instance_id: String,
    /// What happened to it
    pub result: std::result::Result<(), TerminateError>,
}

/// Lists and terminates instances
pub struct InstanceManager {
    provider: Arc<dyn GpuMarketplace>,
    confirm: Arc<dyn Confirm>,
}

impl InstanceManager {
    /// Create a manager; `confirm` gates every termination
    pub fn new(provider: Arc<dyn GpuMarketplace>, confirm: Arc<dyn Confirm>) -> Self {
        Self { provider, confirm }
    }

    /// All instances with current details.
    ///
    /// When the provider's list omits details, one detail read is issued per
    /// summary. A failed detail read keeps the summary.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let summaries = self.provider.list_instances().await?;
        if self.provider.list_includes_details() {
            return Ok(summaries);
        }

        let mut instances = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if summary.has_details() || summary.id.is_empty() {
                instances.push(summary);
                continue;
            }
            match self.provider.get_instance(&summary.id).await {
                Ok(mut detail) => {
                    if detail.name.is_empty() {
                        detail.name = summary.name.clone();
                    }
                    instances.push(detail);
                }
                Err(e) => {
                    warn!(instance_id = %summary.id, error = %e, "Detail read failed, showing summary");
                    instances.push(summary);
                }
            }
        }
        Ok(instances)
    }

    /// Terminate one instance after confirmation
    pub async fn terminate(&self, instance_id: &str) -> std::result::Result<(), TerminateError> {
        if !self
            .confirm
            .confirm(&format!("Terminate instance {}?", instance_id))
        {
            info!(instance_id = %instance_id, "Termination declined");
            return Err(TerminateError::Declined);
        }
        self.delete(instance_id).await
    }

    /// Terminate several instances with a single confirmation.
    ///
    /// Deletes run one after another; a failure does not stop the rest and
    /// nothing is rolled back.
    pub async fn terminate_batch(&self, instance_ids: &[String]) -> Vec<TerminateOutcome> {
        if instance_ids.is_empty() {
            return Vec::new();
        }

        let prompt = format!(
            "Terminate {} instance(s): {}?",
            instance_ids.len(),
            instance_ids.join(", ")
        );
        if !self.confirm.confirm(&prompt) {
            info!(count = instance_ids.len(), "Batch termination declined");
            return instance_ids
                .iter()
                .map(|id| TerminateOutcome {
                    instance_id: id.clone(),
                    result: Err(TerminateError::Declined),
                })
                .collect();
        }

        let mut outcomes = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            let result = self.delete(id).await;
            outcomes.push(TerminateOutcome {
                instance_id: id.clone(),
                result,
            });
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            requested = instance_ids.len(),
            terminated = instance_ids.len() - failed,
            failed,
            "Batch termination finished"
        );
        outcomes
    }

    async fn delete(&self, instance_id: &str) -> std::result::Result<(), TerminateError> {
        info!(instance_id = %instance_id, "Terminating instance");
        match self.provider.delete_instance(instance_id).await {
            Ok(()) => {
                info!(instance_id = %instance_id, "Instance terminated");
                Ok(())
            }
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Termination failed");
                Err(e.into())
            }
        }
    }
}
