//! Deployment configuration
//!
//! Everything the orchestrator needs is passed in explicitly at construction:
//! credentials, resource sizing, and the timing policy of every wait.

use crate::error::{OrchestratorError, Result};
use crate::instance::{DEFAULT_SERVICE_PORT, PortExposure, ProvisioningRequest, REMOTE_SHELL_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default provider API base URL
pub const DEFAULT_API_URL: &str = "https://dashboard.tensordock.com/api/v2";

/// How the remote shell client treats unknown host keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KnownHostsPolicy {
    /// Only connect to hosts already in known_hosts
    Strict,
    /// Record new host keys, reject changed ones
    AcceptNew,
    /// Never check or record host keys (fresh marketplace hosts reuse addresses)
    #[default]
    Ignore,
}

impl std::str::FromStr for KnownHostsPolicy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "accept-new" => Ok(Self::AcceptNew),
            "ignore" => Ok(Self::Ignore),
            other => Err(OrchestratorError::config(format!(
                "unknown known-hosts policy '{}' (expected strict, accept-new or ignore)",
                other
            ))),
        }
    }
}

/// Provider and remote shell credentials
#[derive(Clone)]
pub struct Credentials {
    /// Provider API bearer token
    pub token: String,

    /// Private key used for the remote shell
    pub private_key: PathBuf,

    /// Public key installed on new instances
    pub public_key: Option<String>,

    /// Host key checking policy
    pub known_hosts: KnownHostsPolicy,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("private_key", &self.private_key)
            .field("public_key", &self.public_key.as_ref().map(|_| "<set>"))
            .field("known_hosts", &self.known_hosts)
            .finish()
    }
}

impl Credentials {
    /// Create credentials; the public key is read from `<private_key>.pub` if present
    pub fn new(token: impl Into<String>, private_key: impl Into<PathBuf>) -> Result<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(OrchestratorError::config(
                "provider API token is required (set TENSORDOCK_API_TOKEN)",
            ));
        }
        let private_key = private_key.into();
        let public_key = read_public_key(&private_key);

        Ok(Self {
            token,
            private_key,
            public_key,
            known_hosts: KnownHostsPolicy::default(),
        })
    }

    /// Set the host key policy
    pub fn with_known_hosts(mut self, policy: KnownHostsPolicy) -> Self {
        self.known_hosts = policy;
        self
    }

    /// Set the public key explicitly
    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }
}

fn read_public_key(private_key: &Path) -> Option<String> {
    let mut path = private_key.as_os_str().to_owned();
    path.push(".pub");
    std::fs::read_to_string(PathBuf::from(path))
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|s| !s.is_empty())
}

/// Default private key location (`~/.ssh/id_ed25519`)
pub fn default_private_key() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("id_ed25519")
}

/// Timing policy for every wait in a deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Interval between instance status reads
    #[serde(default = "default_readiness_poll_interval")]
    pub readiness_poll_interval: Duration,

    /// Deadline for the instance to become running with a shell port
    #[serde(default = "default_readiness_deadline")]
    pub readiness_deadline: Duration,

    /// Deadline for the first successful shell handshake
    #[serde(default = "default_probe_deadline")]
    pub probe_deadline: Duration,

    /// Timeout of a single handshake attempt
    #[serde(default = "default_probe_attempt_timeout")]
    pub probe_attempt_timeout: Duration,

    /// Deadline for the shell to come back after a disconnect (full reboot)
    #[serde(default = "default_reboot_probe_deadline")]
    pub reboot_probe_deadline: Duration,

    /// Pause after a disconnect before re-probing
    #[serde(default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// How long the process may linger after its output stream ends
    #[serde(default = "default_grace_period")]
    pub grace_period: Duration,

    /// Upper bound for one execution of the setup payload
    #[serde(default = "default_execution_deadline")]
    pub execution_deadline: Duration,

    /// Channel keep-alive probe interval
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: Duration,

    /// Unanswered keep-alive probes before the channel is declared dead
    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: u32,
}

fn default_readiness_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_readiness_deadline() -> Duration {
    Duration::from_secs(300)
}

fn default_probe_deadline() -> Duration {
    Duration::from_secs(180)
}

fn default_probe_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reboot_probe_deadline() -> Duration {
    Duration::from_secs(300)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_execution_deadline() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_keepalive_count_max() -> u32 {
    4
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            readiness_poll_interval: default_readiness_poll_interval(),
            readiness_deadline: default_readiness_deadline(),
            probe_deadline: default_probe_deadline(),
            probe_attempt_timeout: default_probe_attempt_timeout(),
            reboot_probe_deadline: default_reboot_probe_deadline(),
            settle_delay: default_settle_delay(),
            grace_period: default_grace_period(),
            execution_deadline: default_execution_deadline(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count_max(),
        }
    }
}

/// Deploy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Accelerator pattern matched against location offers (e.g. "4090")
    #[serde(default = "default_gpu_pattern")]
    pub gpu_pattern: String,

    /// Number of accelerators
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,

    /// Virtual CPUs
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,

    /// Memory in GB
    #[serde(default = "default_ram_gb")]
    pub ram_gb: u32,

    /// Storage in GB
    #[serde(default = "default_storage_gb")]
    pub storage_gb: u32,

    /// Operating system image
    #[serde(default = "default_image")]
    pub image: String,

    /// Only consider locations that support port forwarding
    #[serde(default = "default_true")]
    pub require_port_forwarding: bool,

    /// Internal port of the served application
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Instance name prefix; a unix timestamp is appended
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Where the connection snapshot is written
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Remote user for the shell
    #[serde(default = "default_remote_user")]
    pub remote_user: String,

    /// Additional attempts after a disconnect
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timing policy
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_gpu_pattern() -> String {
    "4090".to_string()
}

fn default_gpu_count() -> u32 {
    1
}

fn default_vcpus() -> u32 {
    8
}

fn default_ram_gb() -> u32 {
    32
}

fn default_storage_gb() -> u32 {
    200
}

fn default_image() -> String {
    "ubuntu2404".to_string()
}

fn default_true() -> bool {
    true
}

fn default_service_port() -> u16 {
    DEFAULT_SERVICE_PORT
}

fn default_name_prefix() -> String {
    "ComfyUI".to_string()
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("server_info.json")
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_max_retries() -> u32 {
    2
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            gpu_pattern: default_gpu_pattern(),
            gpu_count: default_gpu_count(),
            vcpus: default_vcpus(),
            ram_gb: default_ram_gb(),
            storage_gb: default_storage_gb(),
            image: default_image(),
            require_port_forwarding: default_true(),
            service_port: default_service_port(),
            name_prefix: default_name_prefix(),
            snapshot_path: default_snapshot_path(),
            remote_user: default_remote_user(),
            max_retries: default_max_retries(),
            timeouts: Timeouts::default(),
        }
    }
}

impl DeployConfig {
    /// Set accelerator pattern
    pub fn with_gpu_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.gpu_pattern = pattern.into();
        self
    }

    /// Set accelerator count
    pub fn with_gpu_count(mut self, count: u32) -> Self {
        self.gpu_count = count;
        self
    }

    /// Set vCPUs
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set memory
    pub fn with_ram_gb(mut self, ram_gb: u32) -> Self {
        self.ram_gb = ram_gb;
        self
    }

    /// Set storage
    pub fn with_storage_gb(mut self, storage_gb: u32) -> Self {
        self.storage_gb = storage_gb;
        self
    }

    /// Set OS image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set snapshot path
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = path.into();
        self
    }

    /// Set retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set timing policy
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Port forwards every deploy requests: the remote shell and the service
    pub fn exposures(&self) -> Vec<PortExposure> {
        let mut exposures = vec![PortExposure::new(REMOTE_SHELL_PORT)];
        if self.service_port != REMOTE_SHELL_PORT {
            exposures.push(PortExposure::new(self.service_port));
        }
        exposures
    }

    /// Build the creation request for a concrete accelerator model
    pub fn provisioning_request(
        &self,
        accelerator_model: &str,
        ssh_public_key: Option<&str>,
    ) -> ProvisioningRequest {
        let mut request = ProvisioningRequest::new(accelerator_model)
            .with_name(format!("{}-{}", self.name_prefix, chrono::Utc::now().timestamp()))
            .with_accelerator_count(self.gpu_count)
            .with_vcpus(self.vcpus)
            .with_ram_gb(self.ram_gb)
            .with_storage_gb(self.storage_gb)
            .with_image(&self.image)
            .with_exposures(self.exposures());
        if let Some(key) = ssh_public_key {
            request = request.with_ssh_public_key(key);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_deploy_config_defaults() {
        let config = DeployConfig::default();
        assert_eq!(config.gpu_pattern, "4090");
        assert_eq!(config.gpu_count, 1);
        assert_eq!(config.vcpus, 8);
        assert_eq!(config.ram_gb, 32);
        assert_eq!(config.storage_gb, 200);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.timeouts.readiness_deadline, Duration::from_secs(300));
        assert_eq!(config.timeouts.reboot_probe_deadline, Duration::from_secs(300));
    }

    #[test]
    fn test_deploy_config_from_partial_json() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"gpu_pattern": "a100", "vcpus": 16}"#).unwrap();
        assert_eq!(config.gpu_pattern, "a100");
        assert_eq!(config.vcpus, 16);
        assert_eq!(config.ram_gb, 32);
        assert!(config.require_port_forwarding);
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_provisioning_request_from_config() {
        let config = DeployConfig::default().with_vcpus(16).with_storage_gb(500);
        let request = config.provisioning_request("geforcertx4090-pcie-24gb", Some("ssh-ed25519 AAAA"));

        assert_eq!(request.accelerator_model, "geforcertx4090-pcie-24gb");
        assert_eq!(request.vcpus, 16);
        assert_eq!(request.storage_gb, 500);
        assert!(request.name.starts_with("ComfyUI-"));
        assert_eq!(request.ssh_public_key.as_deref(), Some("ssh-ed25519 AAAA"));
        let internal: Vec<u16> = request.exposures.iter().map(|e| e.internal_port).collect();
        assert_eq!(internal, vec![22, 8188]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_credentials_require_token() {
        assert!(matches!(
            Credentials::new("  ", "/nonexistent/id_ed25519"),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_credentials_read_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, "PRIVATE").unwrap();
        let mut pub_file = std::fs::File::create(dir.path().join("id_ed25519.pub")).unwrap();
        writeln!(pub_file, "ssh-ed25519 AAAAC3Nz operator@laptop").unwrap();

        let creds = Credentials::new("token", &key).unwrap();
        assert_eq!(creds.public_key.as_deref(), Some("ssh-ed25519 AAAAC3Nz operator@laptop"));
        assert_eq!(creds.known_hosts, KnownHostsPolicy::Ignore);
        assert!(!format!("{:?}", creds).contains("token\""));
    }

    #[test]
    fn test_known_hosts_policy_parse() {
        assert_eq!("strict".parse::<KnownHostsPolicy>().unwrap(), KnownHostsPolicy::Strict);
        assert_eq!(
            "accept-new".parse::<KnownHostsPolicy>().unwrap(),
            KnownHostsPolicy::AcceptNew
        );
        assert!("maybe".parse::<KnownHostsPolicy>().is_err());
    }
}
