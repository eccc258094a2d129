//! Connection info snapshot
//!
//! Written once per deploy, right after the instance becomes ready, so the
//! operator can reconnect (or re-run `ssh-setup`) even if a later stage fails.

use crate::error::{OrchestratorError, Result};
use crate::instance::ConnectionEndpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Everything needed to reach a deployed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfoSnapshot {
    /// Provider instance id
    pub instance_id: String,

    /// Public address
    pub address: String,

    /// External remote shell port
    pub port: u16,

    /// Remote shell user
    pub username: String,

    /// Private key path; the key itself is never written here
    pub credential_reference: String,

    /// Where the deployed service will answer
    pub service_url: Option<String>,

    /// RFC 3339 time of writing
    pub created_at: String,
}

impl ConnectionInfoSnapshot {
    /// Snapshot for an endpoint
    pub fn new(
        instance_id: impl Into<String>,
        endpoint: &ConnectionEndpoint,
        username: impl Into<String>,
        credential_reference: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            address: endpoint.address.clone(),
            port: endpoint.port,
            username: username.into(),
            credential_reference: credential_reference.into(),
            service_url: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Set the service URL
    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = Some(url.into());
        self
    }

    /// Remote shell endpoint
    pub fn endpoint(&self) -> ConnectionEndpoint {
        ConnectionEndpoint::new(&self.address, self.port)
    }

    /// Write as pretty JSON, replacing any previous file atomically
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .ok_or_else(|| OrchestratorError::config(format!("invalid snapshot path {}", path.display())))?;

        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(file_name);
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json + "\n")?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(path = %path.display(), instance_id = %self.instance_id, "Connection info saved");
        Ok(())
    }

    /// Read a previously written snapshot
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("cannot read connection info {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ConnectionInfoSnapshot {
        ConnectionInfoSnapshot::new(
            "vm-1",
            &ConnectionEndpoint::new("203.0.113.7", 20022),
            "root",
            "/home/op/.ssh/id_ed25519",
        )
        .with_service_url("http://203.0.113.7:28188")
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_info.json");

        snapshot().write_atomic(&path).unwrap();
        let loaded = ConnectionInfoSnapshot::load(&path).unwrap();

        assert_eq!(loaded, snapshot_with_time(&loaded.created_at));
        assert_eq!(loaded.endpoint(), ConnectionEndpoint::new("203.0.113.7", 20022));
        assert!(!dir.path().join(".server_info.json.tmp").exists());
    }

    fn snapshot_with_time(created_at: &str) -> ConnectionInfoSnapshot {
        ConnectionInfoSnapshot {
            created_at: created_at.to_string(),
            ..snapshot()
        }
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_info.json");
        std::fs::write(&path, "{ not json").unwrap();

        snapshot().write_atomic(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["instance_id"], "vm-1");
        assert_eq!(value["port"], 20022);
        assert_eq!(value["credential_reference"], "/home/op/.ssh/id_ed25519");
    }

    #[test]
    fn test_load_missing_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConnectionInfoSnapshot::load(dir.path().join("nope.json")),
            Err(OrchestratorError::Config(_))
        ));
    }
}
