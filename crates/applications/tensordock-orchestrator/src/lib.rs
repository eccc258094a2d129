//! # TensorDock Orchestrator
//!
//! Provisions a GPU instance from a marketplace, waits until it can be reached,
//! and drives a long setup payload over SSH to completion, surviving the
//! reboots that driver and kernel upgrades cause along the way.
//!
//! ## Architecture
//!
//! ```text
//! ResourceCatalog ──► InstanceProvisioner ──► ReadinessPoller
//!        │                                          │
//!        │                              ConnectionInfoSnapshot
//!        │                                          │
//! InstanceManager          TransportAvailabilityProbe ◄─┐
//!                                                   │   │ disconnect
//!                                         ResilientExecutor
//! ```
//!
//! The marketplace sits behind [`GpuMarketplace`] and the remote shell behind
//! [`RemoteShell`]; everything above them is provider and transport agnostic.
//!
//! ## Disconnect handling
//!
//! A setup session ends in one of three ways (see [`session`]):
//!
//! 1. **Succeeded**: exit 0 and no reboot announced
//! 2. **ScriptFailed**: any other exit code, never retried
//! 3. **Disconnected**: the channel died or the host announced a reboot; the
//!    executor waits for the host to come back and runs the payload again, up
//!    to `max_retries` times
//!
//! See [`executor`] for the state machine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod instance;
pub mod manager;
pub mod orchestrator;
pub mod payload;
pub mod probe;
pub mod provider;
pub mod readiness;
pub mod remote;
pub mod session;
pub mod snapshot;
pub mod tensordock;

#[cfg(test)]
mod testing;

// Error handling
pub use error::{OrchestratorError, Result};

// Configuration
pub use config::{Credentials, DeployConfig, KnownHostsPolicy, Timeouts};

// Provider interface and client
pub use catalog::{GpuOffer, Location, ResourceCatalog};
pub use provider::GpuMarketplace;
pub use tensordock::TensorDockClient;

// Instances
pub use instance::{
    ConnectionEndpoint, Instance, InstanceProvisioner, InstanceStatus, PortExposure, PortMapping,
    ProvisioningRequest,
};
pub use manager::{AutoApprove, Confirm, InstanceManager, TerminateError, TerminateOutcome};

// Readiness and transport
pub use probe::{TransportAvailabilityProbe, probe_delay};
pub use readiness::ReadinessPoller;
pub use remote::{RemoteExit, RemoteProcess, RemoteShell, SshShell};

// Execution
pub use executor::{ExecutionReport, ExecutorConfig, ResilientExecutor};
pub use payload::SetupPayload;
pub use session::{SessionClassifier, SessionOutcome};
pub use snapshot::ConnectionInfoSnapshot;

// Deploy pipeline
pub use orchestrator::{DeployPhaseTimes, DeployReport, Orchestrator, SetupRunner};
