//! Deploy pipeline
//!
//! ```text
//! catalog → confirm → create → readiness → snapshot → probe → resilient setup
//! ```
//!
//! Stages run strictly in sequence. Every wait has a deadline and every fatal
//! outcome comes back as a classified [`OrchestratorError`].

use crate::catalog::ResourceCatalog;
use crate::config::{Credentials, DeployConfig, Timeouts};
use crate::error::{OrchestratorError, Result};
use crate::executor::{ExecutionReport, ExecutorConfig, ResilientExecutor};
use crate::instance::{ConnectionEndpoint, InstanceProvisioner};
use crate::manager::Confirm;
use crate::payload::SetupPayload;
use crate::probe::TransportAvailabilityProbe;
use crate::provider::GpuMarketplace;
use crate::readiness::ReadinessPoller;
use crate::remote::RemoteShell;
use crate::snapshot::ConnectionInfoSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Result of a completed deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployReport {
    /// Provider instance id
    pub instance_id: String,

    /// Location the instance was placed in
    pub location_id: String,

    /// Human-readable location
    pub location_name: String,

    /// Accelerator model requested
    pub gpu_model: String,

    /// Remote shell endpoint
    pub endpoint: ConnectionEndpoint,

    /// Where the deployed service answers, if its port was mapped
    pub service_url: Option<String>,

    /// Setup attempts used
    pub attempts_used: u32,

    /// Total deploy time in seconds
    pub total_time_secs: f64,

    /// Per-stage timing
    pub phase_times: DeployPhaseTimes,
}

/// Timing breakdown for deploy stages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployPhaseTimes {
    /// Location lookup (seconds)
    pub catalog_secs: f64,

    /// Creation request (seconds)
    pub provision_secs: f64,

    /// Waiting for running + port mapping (seconds)
    pub readiness_secs: f64,

    /// Waiting for the remote shell (seconds)
    pub probe_secs: f64,

    /// Setup payload, including retries (seconds)
    pub setup_secs: f64,
}

/// Probes an endpoint and runs the setup payload on it.
///
/// Needs no provider, so it also serves instances created elsewhere.
pub struct SetupRunner {
    shell: Arc<dyn RemoteShell>,
    timeouts: Timeouts,
    max_retries: u32,
}

impl SetupRunner {
    /// Use the timing policy and retry budget of `config`
    pub fn new(shell: Arc<dyn RemoteShell>, config: &DeployConfig) -> Self {
        Self {
            shell,
            timeouts: config.timeouts,
            max_retries: config.max_retries,
        }
    }

    /// Probe `endpoint`, then run `payload` to completion
    pub async fn run(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &SetupPayload,
    ) -> Result<ExecutionReport> {
        self.await_shell(endpoint).await?;
        self.execute(endpoint, payload).await
    }

    /// Wait for a remote shell session within the probe deadline
    pub async fn await_shell(&self, endpoint: &ConnectionEndpoint) -> Result<()> {
        let probe = TransportAvailabilityProbe::new(self.shell.clone())
            .with_attempt_timeout(self.timeouts.probe_attempt_timeout);

        if probe.await_reachable(endpoint, self.timeouts.probe_deadline).await {
            Ok(())
        } else {
            Err(OrchestratorError::TransportUnreachable {
                instance_id: None,
                endpoint: endpoint.clone(),
                waited: self.timeouts.probe_deadline,
            })
        }
    }

    /// Run `payload` on an endpoint that is already reachable
    pub async fn execute(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &SetupPayload,
    ) -> Result<ExecutionReport> {
        ResilientExecutor::new(
            self.shell.clone(),
            ExecutorConfig::from_timeouts(&self.timeouts, self.max_retries),
        )
        .run(endpoint, payload)
        .await
    }
}

/// Runs the deploy and ssh-setup actions
pub struct Orchestrator {
    provider: Arc<dyn GpuMarketplace>,
    shell: Arc<dyn RemoteShell>,
    confirm: Arc<dyn Confirm>,
    config: DeployConfig,
    credential_reference: String,
    ssh_public_key: Option<String>,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(
        provider: Arc<dyn GpuMarketplace>,
        shell: Arc<dyn RemoteShell>,
        confirm: Arc<dyn Confirm>,
        config: DeployConfig,
    ) -> Self {
        Self {
            provider,
            shell,
            confirm,
            config,
            credential_reference: String::new(),
            ssh_public_key: None,
        }
    }

    /// Use these credentials for new instances and the snapshot
    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.credential_reference = credentials.private_key.display().to_string();
        self.ssh_public_key = credentials.public_key.clone();
        self
    }

    /// Deploy configuration in use
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Provision an instance and run `payload` on it
    pub async fn deploy(&self, payload: &SetupPayload) -> Result<DeployReport> {
        let start = Instant::now();
        let mut phase_times = DeployPhaseTimes::default();
        let timeouts = &self.config.timeouts;

        // Stage 1: where can we get the accelerator
        let phase_start = Instant::now();
        let catalog = ResourceCatalog::new(self.provider.clone());
        let candidates = catalog
            .find_candidates(&self.config.gpu_pattern, self.config.require_port_forwarding)
            .await?;
        phase_times.catalog_secs = phase_start.elapsed().as_secs_f64();

        let (location, offer) = candidates
            .iter()
            .find_map(|l| {
                l.matching_offer(&self.config.gpu_pattern, self.config.require_port_forwarding)
                    .map(|o| (l, o))
            })
            .ok_or_else(|| OrchestratorError::NoCandidates {
                pattern: self.config.gpu_pattern.clone(),
            })?;

        let price = offer
            .price_per_hour
            .map(|p| format!("${:.2}/hr per GPU", p))
            .unwrap_or_else(|| "price unknown".to_string());
        let prompt = format!(
            "Create {}x {} at {} ({}), {} vCPU, {} GB RAM, {} GB storage?",
            self.config.gpu_count,
            offer.display_name.as_deref().unwrap_or(&offer.model),
            location.name,
            price,
            self.config.vcpus,
            self.config.ram_gb,
            self.config.storage_gb
        );
        if !self.confirm.confirm(&prompt) {
            return Err(OrchestratorError::Aborted("instance creation declined".to_string()));
        }

        // Stage 2: create
        let phase_start = Instant::now();
        let request = self
            .config
            .provisioning_request(&offer.model, self.ssh_public_key.as_deref());
        let instance_id = InstanceProvisioner::new(self.provider.clone())
            .create(&request, &location.id)
            .await?;
        phase_times.provision_secs = phase_start.elapsed().as_secs_f64();

        // Everything past here concerns a billable instance
        let attach = |e: OrchestratorError| e.with_instance_id(&instance_id);

        // Stage 3: running with a shell port
        let phase_start = Instant::now();
        let endpoint = ReadinessPoller::new(self.provider.clone())
            .await_running(
                &instance_id,
                timeouts.readiness_poll_interval,
                timeouts.readiness_deadline,
            )
            .await?;
        phase_times.readiness_secs = phase_start.elapsed().as_secs_f64();

        let service_url = self.service_url(&instance_id, &endpoint).await;
        let mut snapshot = ConnectionInfoSnapshot::new(
            &instance_id,
            &endpoint,
            &self.config.remote_user,
            &self.credential_reference,
        );
        if let Some(url) = &service_url {
            snapshot = snapshot.with_service_url(url);
        }
        snapshot.write_atomic(&self.config.snapshot_path).map_err(attach)?;

        // Stage 4 + 5: shell, then setup
        let runner = self.setup_runner();
        let phase_start = Instant::now();
        runner.await_shell(&endpoint).await.map_err(attach)?;
        phase_times.probe_secs = phase_start.elapsed().as_secs_f64();

        let phase_start = Instant::now();
        let execution = runner.execute(&endpoint, payload).await.map_err(attach)?;
        phase_times.setup_secs = phase_start.elapsed().as_secs_f64();

        let report = DeployReport {
            instance_id,
            location_id: location.id.clone(),
            location_name: location.name.clone(),
            gpu_model: offer.model.clone(),
            endpoint,
            service_url,
            attempts_used: execution.attempts_used,
            total_time_secs: start.elapsed().as_secs_f64(),
            phase_times,
        };

        info!(
            instance_id = %report.instance_id,
            endpoint = %report.endpoint,
            attempts = report.attempts_used,
            total_secs = report.total_time_secs,
            "Deploy completed"
        );
        Ok(report)
    }

    /// Probe an existing endpoint and run `payload` on it
    pub async fn ssh_setup(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &SetupPayload,
    ) -> Result<ExecutionReport> {
        self.setup_runner().run(endpoint, payload).await
    }

    fn setup_runner(&self) -> SetupRunner {
        SetupRunner::new(self.shell.clone(), &self.config)
    }

    async fn service_url(&self, instance_id: &str, endpoint: &ConnectionEndpoint) -> Option<String> {
        match self.provider.get_instance(instance_id).await {
            Ok(instance) => instance
                .external_port(self.config.service_port)
                .map(|port| format!("http://{}:{}", endpoint.address, port)),
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Could not read service port mapping");
                None
            }
        }
    }
}
