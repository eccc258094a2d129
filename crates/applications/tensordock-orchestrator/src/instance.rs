//! Instance data model and provisioning
//!
//! Instances are created by [`InstanceProvisioner`] and afterwards only ever
//! mutated by the provider. The orchestrator polls and reads them.

use crate::error::{OrchestratorError, Result};
use crate::provider::GpuMarketplace;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Internal port of the remote shell service
pub const REMOTE_SHELL_PORT: u16 = 22;

/// Internal port of the served application (ComfyUI)
pub const DEFAULT_SERVICE_PORT: u16 = 8188;

/// Instance lifecycle status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Accepted, still being created or booted
    Creating,
    /// Provider considers the instance fully started
    Running,
    /// Provider gave up on the instance
    Error,
    /// Instance is gone (or going)
    Terminated,
    /// Status string we do not recognise
    Unknown,
}

impl InstanceStatus {
    /// Parse from the provider's status string
    pub fn from_provider(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "creating" | "provisioning" | "pending" | "starting" | "deploying" | "booting" => {
                Self::Creating
            }
            "running" => Self::Running,
            "error" | "failed" => Self::Error,
            "terminated" | "terminating" | "deleted" | "deleting" | "stopped" => Self::Terminated,
            _ => Self::Unknown,
        }
    }

    /// No point polling further once the instance is here
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One internal → external port forward on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the guest
    pub internal_port: u16,
    /// Port reachable on the instance address
    pub external_port: u16,
}

/// A port forward to request at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortExposure {
    /// Port inside the guest
    pub internal_port: u16,
    /// Requested external port; `None` lets the provider pick one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

impl PortExposure {
    /// Expose an internal port on a provider-assigned external port
    pub fn new(internal_port: u16) -> Self {
        Self {
            internal_port,
            external_port: None,
        }
    }

    /// Request a specific external port
    pub fn with_external_port(mut self, external_port: u16) -> Self {
        self.external_port = Some(external_port);
        self
    }
}

/// Accelerators attached to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAllocation {
    /// Provider model identifier (e.g. "geforcertx4090-pcie-24gb")
    pub model: String,
    /// Number of GPUs of that model
    pub count: u32,
}

/// Resource snapshot of an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Virtual CPUs
    pub vcpu_count: u32,
    /// Memory in GB
    pub ram_gb: u32,
    /// Storage in GB
    pub storage_gb: u32,
    /// Attached accelerators
    pub gpus: Vec<GpuAllocation>,
}

impl ResourceSnapshot {
    /// Human-readable GPU summary, e.g. "1x geforcertx4090-pcie-24gb"
    pub fn gpu_summary(&self) -> String {
        let parts: Vec<String> = self
            .gpus
            .iter()
            .filter(|g| g.count > 0)
            .map(|g| format!("{}x {}", g.count, g.model))
            .collect();
        if parts.is_empty() {
            "None".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Network endpoint of a running instance's remote shell
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionEndpoint {
    /// Public address
    pub address: String,
    /// External port forwarded to the remote shell
    pub port: u16,
}

impl ConnectionEndpoint {
    /// Create an endpoint
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for ConnectionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A provider instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider-assigned identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Lifecycle status
    pub status: InstanceStatus,

    /// Public address, once assigned
    pub ip_address: Option<String>,

    /// Port forwards, once assigned
    pub port_forwards: Vec<PortMapping>,

    /// Resources, when the provider response included them
    pub resources: Option<ResourceSnapshot>,

    /// Creation timestamp as reported by the provider
    pub created_at: Option<String>,
}

impl Instance {
    /// External port forwarded to `internal_port`, if mapped
    pub fn external_port(&self, internal_port: u16) -> Option<u16> {
        self.port_forwards
            .iter()
            .find(|m| m.internal_port == internal_port)
            .map(|m| m.external_port)
    }

    /// The remote-shell endpoint, only once it can be trusted.
    ///
    /// Requires status `running`, an address, and a port mapping for
    /// `shell_port`. Anything less is `None`, never a placeholder.
    pub fn connection_endpoint(&self, shell_port: u16) -> Option<ConnectionEndpoint> {
        if self.status != InstanceStatus::Running {
            return None;
        }
        let address = self.ip_address.as_deref().filter(|a| !a.is_empty())?;
        let port = self.external_port(shell_port)?;
        Some(ConnectionEndpoint::new(address, port))
    }

    /// Whether the record carries more than an id/name summary
    pub fn has_details(&self) -> bool {
        self.status != InstanceStatus::Unknown && self.resources.is_some()
    }
}

/// Resource ask for a new instance. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    /// Instance display name
    pub name: String,

    /// Provider accelerator model identifier
    pub accelerator_model: String,

    /// Number of accelerators
    pub accelerator_count: u32,

    /// Virtual CPUs
    pub vcpus: u32,

    /// Memory in GB
    pub ram_gb: u32,

    /// Storage in GB
    pub storage_gb: u32,

    /// Operating system image
    pub image: String,

    /// Port forwards to request
    pub exposures: Vec<PortExposure>,

    /// Public key installed for the remote shell user
    pub ssh_public_key: Option<String>,
}

impl Default for ProvisioningRequest {
    fn default() -> Self {
        Self {
            name: format!("ComfyUI-{}", chrono::Utc::now().timestamp()),
            accelerator_model: String::new(), // Must be set
            accelerator_count: 1,
            vcpus: 8,
            ram_gb: 32,
            storage_gb: 200,
            image: "ubuntu2404".to_string(),
            exposures: vec![
                PortExposure::new(REMOTE_SHELL_PORT),
                PortExposure::new(DEFAULT_SERVICE_PORT),
            ],
            ssh_public_key: None,
        }
    }
}

impl ProvisioningRequest {
    /// Create a request for the given accelerator model
    pub fn new(accelerator_model: impl Into<String>) -> Self {
        Self {
            accelerator_model: accelerator_model.into(),
            ..Default::default()
        }
    }

    /// Set instance name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set accelerator count
    pub fn with_accelerator_count(mut self, count: u32) -> Self {
        self.accelerator_count = count;
        self
    }

    /// Set vCPU count
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set memory size
    pub fn with_ram_gb(mut self, ram_gb: u32) -> Self {
        self.ram_gb = ram_gb;
        self
    }

    /// Set storage size
    pub fn with_storage_gb(mut self, storage_gb: u32) -> Self {
        self.storage_gb = storage_gb;
        self
    }

    /// Set OS image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Replace the requested port forwards
    pub fn with_exposures(mut self, exposures: Vec<PortExposure>) -> Self {
        self.exposures = exposures;
        self
    }

    /// Set the public key for the remote shell
    pub fn with_ssh_public_key(mut self, key: impl Into<String>) -> Self {
        self.ssh_public_key = Some(key.into());
        self
    }

    /// Check the request before it is submitted
    pub fn validate(&self) -> Result<()> {
        if self.accelerator_model.trim().is_empty() {
            return Err(OrchestratorError::config("accelerator model must be set"));
        }
        if self.accelerator_count == 0 || self.vcpus == 0 || self.ram_gb == 0 {
            return Err(OrchestratorError::config(
                "accelerator count, vCPUs and RAM must be non-zero",
            ));
        }
        if !self
            .exposures
            .iter()
            .any(|e| e.internal_port == REMOTE_SHELL_PORT)
        {
            return Err(OrchestratorError::config(format!(
                "a port exposure for the remote shell (internal port {}) is required",
                REMOTE_SHELL_PORT
            )));
        }
        Ok(())
    }
}

/// Submits creation requests to the marketplace
pub struct InstanceProvisioner {
    provider: Arc<dyn GpuMarketplace>,
}

impl InstanceProvisioner {
    /// Create a provisioner over a provider
    pub fn new(provider: Arc<dyn GpuMarketplace>) -> Self {
        Self { provider }
    }

    /// Create an instance at `location_id` and return its identifier.
    ///
    /// Any refusal is `ProvisionRejected` and is not retried here: capacity
    /// gone at submission time has to be re-resolved through the catalog.
    pub async fn create(&self, request: &ProvisioningRequest, location_id: &str) -> Result<String> {
        request.validate()?;

        info!(
            name = %request.name,
            location_id = %location_id,
            gpu = %request.accelerator_model,
            gpu_count = request.accelerator_count,
            vcpus = request.vcpus,
            ram_gb = request.ram_gb,
            storage_gb = request.storage_gb,
            "Submitting instance creation request"
        );

        let instance = self
            .provider
            .create_instance(request, location_id)
            .await
            .map_err(|e| match e {
                OrchestratorError::Api { status, message } => OrchestratorError::ProvisionRejected {
                    reason: format!("{} - {}", status, message),
                },
                other => OrchestratorError::ProvisionRejected {
                    reason: other.to_string(),
                },
            })?;

        if instance.id.is_empty() {
            return Err(OrchestratorError::ProvisionRejected {
                reason: "provider accepted the request but returned no instance id".to_string(),
            });
        }

        debug!(instance_id = %instance.id, status = %instance.status, "Creation accepted");
        info!(instance_id = %instance.id, "Instance created");

        Ok(instance.id)
    }
}
