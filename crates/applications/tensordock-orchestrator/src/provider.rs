//! GPU marketplace provider interface
//!
//! Every component (catalog, provisioner, pollers, instance manager) talks to
//! the marketplace through this trait only, never through a concrete client.

use crate::catalog::Location;
use crate::error::Result;
use crate::instance::{Instance, ProvisioningRequest};
use async_trait::async_trait;

/// All marketplace providers must implement this trait.
///
/// Implementations return plain transport/API errors
/// ([`OrchestratorError::Api`](crate::error::OrchestratorError::Api),
/// [`OrchestratorError::Http`](crate::error::OrchestratorError::Http)); the
/// calling component decides which deploy failure class they map to.
#[async_trait]
pub trait GpuMarketplace: Send + Sync {
    /// Locations with their accelerator availability and pricing
    async fn list_locations(&self) -> Result<Vec<Location>>;

    /// Submit a creation request; the returned instance is usually still creating
    async fn create_instance(
        &self,
        request: &ProvisioningRequest,
        location_id: &str,
    ) -> Result<Instance>;

    /// Current status, address, port mappings and resources of one instance
    async fn get_instance(&self, instance_id: &str) -> Result<Instance>;

    /// All instances owned by the account
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Terminate an instance. Errors with `Api` for any status outside 200/204.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    /// Whether [`list_instances`](Self::list_instances) already carries full
    /// per-instance details. When false, callers issue one detail read each.
    fn list_includes_details(&self) -> bool {
        false
    }
}
