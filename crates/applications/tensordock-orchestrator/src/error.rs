//! Error types for the orchestrator
//!
//! Every fatal stage outcome is its own variant and carries the context an
//! operator needs to act on it (instance id, last status, last output line).
//! A transport disconnect during setup is not an error here: it is a
//! [`SessionOutcome`](crate::session::SessionOutcome) that the executor retries.

use crate::instance::{ConnectionEndpoint, InstanceStatus};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur in the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Provider location lookup failed
    #[error("location catalog unavailable: {reason}")]
    CatalogUnavailable {
        /// Why the lookup failed
        reason: String,
    },

    /// No location offers the requested accelerator
    #[error("no location currently offers an accelerator matching '{pattern}'")]
    NoCandidates {
        /// Accelerator pattern searched for
        pattern: String,
    },

    /// Provider refused the creation request
    #[error("provisioning rejected by provider: {reason}")]
    ProvisionRejected {
        /// Provider message
        reason: String,
    },

    /// Instance entered a terminal state before it was running
    #[error("instance {instance_id} entered status '{status}' before it was running")]
    ProvisionFailed {
        /// Instance that failed
        instance_id: String,
        /// Terminal status it reported
        status: InstanceStatus,
    },

    /// Instance never became running (with a shell port) before the deadline
    #[error(
        "instance {instance_id} not ready after {waited:?} (last status: {})",
        .last_status.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "never observed".to_string())
    )]
    ReadinessTimeout {
        /// Instance being waited on
        instance_id: String,
        /// Last status read, if any read succeeded
        last_status: Option<InstanceStatus>,
        /// Time spent polling
        waited: Duration,
    },

    /// Remote shell never accepted a session before the deadline
    #[error(
        "{}remote shell at {endpoint} unreachable after {waited:?}; retry `ssh-setup` later",
        on_instance(.instance_id)
    )]
    TransportUnreachable {
        /// Instance behind the endpoint, when known
        instance_id: Option<String>,
        /// Address that was probed
        endpoint: ConnectionEndpoint,
        /// Probe deadline
        waited: Duration,
    },

    /// Setup payload could not be transferred
    #[error("{}upload to {endpoint} failed: {reason}", on_instance(.instance_id))]
    UploadFailed {
        /// Instance behind the endpoint, when known
        instance_id: Option<String>,
        /// Upload target
        endpoint: ConnectionEndpoint,
        /// Transport error text
        reason: String,
    },

    /// Setup payload exited with a real failure
    #[error(
        "{}setup script on {endpoint} exited with code {exit_code} (last output: {}); see {log_path}",
        on_instance(.instance_id),
        .last_line.as_deref().unwrap_or("<none>")
    )]
    ScriptFailed {
        /// Instance behind the endpoint, when known
        instance_id: Option<String>,
        /// Where the script ran
        endpoint: ConnectionEndpoint,
        /// Script exit code
        exit_code: i32,
        /// Last output line seen
        last_line: Option<String>,
        /// Remote log file
        log_path: String,
    },

    /// Disconnect retry budget consumed
    #[error(
        "{}setup on {endpoint} did not complete after {attempts} attempt(s) (last output: {})",
        on_instance(.instance_id),
        .last_line.as_deref().unwrap_or("<none>")
    )]
    RetriesExhausted {
        /// Instance behind the endpoint, when known
        instance_id: Option<String>,
        /// Where the script ran
        endpoint: ConnectionEndpoint,
        /// Attempts used
        attempts: u32,
        /// Last output line seen
        last_line: Option<String>,
    },

    /// Any other failure after an instance was created
    #[error("instance {instance_id}: {source}")]
    OnInstance {
        /// Instance that was created
        instance_id: String,
        /// Underlying failure
        #[source]
        source: Box<OrchestratorError>,
    },

    /// Provider API returned a non-success status or an embedded error
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Provider message
        message: String,
    },

    /// Remote shell transport error
    #[error("Remote shell error: {0}")]
    Remote(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operator declined a confirmation
    #[error("Aborted: {0}")]
    Aborted(String),
}

fn on_instance(instance_id: &Option<String>) -> String {
    instance_id
        .as_deref()
        .map(|id| format!("instance {}: ", id))
        .unwrap_or_default()
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a remote shell error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create an API error
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Attach the id of an instance that exists, so the operator can find it.
    ///
    /// Variants that already name an instance are returned unchanged; transport
    /// and local failures are wrapped in [`OrchestratorError::OnInstance`].
    pub fn with_instance_id(self, id: &str) -> Self {
        match self {
            Self::TransportUnreachable {
                instance_id: None,
                endpoint,
                waited,
            } => Self::TransportUnreachable {
                instance_id: Some(id.to_string()),
                endpoint,
                waited,
            },
            Self::UploadFailed {
                instance_id: None,
                endpoint,
                reason,
            } => Self::UploadFailed {
                instance_id: Some(id.to_string()),
                endpoint,
                reason,
            },
            Self::ScriptFailed {
                instance_id: None,
                endpoint,
                exit_code,
                last_line,
                log_path,
            } => Self::ScriptFailed {
                instance_id: Some(id.to_string()),
                endpoint,
                exit_code,
                last_line,
                log_path,
            },
            Self::RetriesExhausted {
                instance_id: None,
                endpoint,
                attempts,
                last_line,
            } => Self::RetriesExhausted {
                instance_id: Some(id.to_string()),
                endpoint,
                attempts,
                last_line,
            },
            err @ (Self::Api { .. }
            | Self::Remote(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)) => Self::OnInstance {
                instance_id: id.to_string(),
                source: Box::new(err),
            },
            other => other,
        }
    }

    /// Instance this failure concerns, if one was created
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::ProvisionFailed { instance_id, .. }
            | Self::ReadinessTimeout { instance_id, .. }
            | Self::OnInstance { instance_id, .. } => Some(instance_id),
            Self::TransportUnreachable { instance_id, .. }
            | Self::UploadFailed { instance_id, .. }
            | Self::ScriptFailed { instance_id, .. }
            | Self::RetriesExhausted { instance_id, .. } => instance_id.as_deref(),
            _ => None,
        }
    }

    /// Name of the failure class, as reported to the operator
    pub fn classification(&self) -> &'static str {
        match self {
            Self::OnInstance { source, .. } => source.classification(),
            Self::CatalogUnavailable { .. } => "CatalogUnavailable",
            Self::NoCandidates { .. } => "NoCandidates",
            Self::ProvisionRejected { .. } => "ProvisionRejected",
            Self::ProvisionFailed { .. } => "ProvisionFailed",
            Self::ReadinessTimeout { .. } => "ReadinessTimeout",
            Self::TransportUnreachable { .. } => "TransportUnreachable",
            Self::UploadFailed { .. } => "UploadFailed",
            Self::ScriptFailed { .. } => "ScriptFailed",
            Self::RetriesExhausted { .. } => "RetriesExhausted",
            Self::Api { .. } => "ApiError",
            Self::Remote(_) => "RemoteError",
            Self::Http(_) => "HttpError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Config(_) => "ConfigError",
            Self::Aborted(_) => "Aborted",
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::OnInstance { source, .. } => source.exit_code(),
            Self::Aborted(_) => 130,
            Self::CatalogUnavailable { .. } | Self::NoCandidates { .. } => 2,
            Self::ProvisionRejected { .. } | Self::ProvisionFailed { .. } => 3,
            Self::ReadinessTimeout { .. } => 4,
            Self::TransportUnreachable { .. } => 5,
            Self::UploadFailed { .. } => 6,
            Self::ScriptFailed { .. } => 7,
            Self::RetriesExhausted { .. } => 8,
            _ => 1,
        }
    }
}
