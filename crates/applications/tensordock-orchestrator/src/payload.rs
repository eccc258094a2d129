//! Setup payload
//!
//! The self-contained script uploaded to a fresh instance. It must be safe to
//! run again from the start after a reboot: every step either re-does its work
//! or skips it.

use crate::error::{OrchestratorError, Result};
use crate::instance::DEFAULT_SERVICE_PORT;
use crate::remote::shell_quote;
use std::path::Path;
use tracing::info;

/// Where the payload is written on the instance
pub const DEFAULT_REMOTE_PATH: &str = "/root/setup.sh";

/// Where the default payload keeps its transcript on the instance
pub const DEFAULT_LOG_PATH: &str = "/var/log/comfyui-setup.log";

/// Repository the default payload deploys
pub const DEFAULT_DEPLOY_REPO: &str = "https://github.com/Smethan/tensordock-deploy.git";

/// Local debug copy of the last generated payload
pub const DEFAULT_LOCAL_COPY: &str = "/tmp/tensordock_setup.sh";

/// Script plus where it runs and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPayload {
    /// Script contents
    pub script: String,

    /// Path on the instance
    pub remote_path: String,

    /// Remote log the operator is pointed at on failure
    pub log_path: String,
}

impl SetupPayload {
    /// Wrap an arbitrary script
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            log_path: DEFAULT_LOG_PATH.to_string(),
        }
    }

    /// The ComfyUI bootstrap script.
    ///
    /// Clones `repo_url`, writes the CivitAI key into `.env` and runs the
    /// repository's `deploy.sh` non-interactively. An empty key is allowed.
    pub fn comfyui(civitai_key: &str, repo_url: &str) -> Self {
        let log = DEFAULT_LOG_PATH;
        let script = format!(
            r#"#!/bin/bash
set -e

exec > >(tee -a {log})
exec 2>&1

echo "=========================================="
echo "ComfyUI TensorDock Setup"
echo "=========================================="
echo "Started: $(date)"

echo "Updating system packages..."
export DEBIAN_FRONTEND=noninteractive
apt-get update
apt-get upgrade -y
apt-get install -y git

echo "Cloning deployment repository..."
cd /root
rm -rf tensordock-deploy
git clone {repo}
cd tensordock-deploy

echo "Setting up environment variables..."
cat > .env << 'ENVEOF'
CIVITAI_API_KEY={key}
COMFYUI_PATH=/workspace/ComfyUI
NVIDIA_VISIBLE_DEVICES=all
NVIDIA_DRIVER_CAPABILITIES=compute,utility
ENVEOF

chmod +x deploy.sh
echo "Running deployment script (CUDA, Docker, ComfyUI image)..."
bash deploy.sh

echo "=========================================="
echo "Setup Complete!"
echo "=========================================="
echo "Finished: $(date)"
echo "Logs: cat {log}"
echo "Status: cd /root/tensordock-deploy && docker compose ps"
echo "Access ComfyUI at: http://$(hostname -I | awk '{{print $1}}'):{port}"
"#,
            log = log,
            repo = shell_quote(repo_url),
            key = shell_quote(civitai_key),
            port = DEFAULT_SERVICE_PORT,
        );

        Self::new(script)
    }

    /// Read a custom script from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let script = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("cannot read setup script {}: {}", path.display(), e))
        })?;
        if script.trim().is_empty() {
            return Err(OrchestratorError::config(format!(
                "setup script {} is empty",
                path.display()
            )));
        }
        Ok(Self::new(script))
    }

    /// Set the path on the instance
    pub fn with_remote_path(mut self, path: impl Into<String>) -> Self {
        self.remote_path = path.into();
        self
    }

    /// Set the remote log path reported on failure
    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Command that runs the uploaded payload
    pub fn command(&self) -> String {
        format!("bash {}", shell_quote(&self.remote_path))
    }

    /// Keep a local copy for debugging
    pub fn save_copy(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, &self.script)?;
        info!(path = %path.display(), "Setup script saved");
        Ok(())
    }
}
