//! Deployment session classification
//!
//! A setup run can end in three ways that the executor treats differently:
//! it finished, it failed for real, or the connection went away (usually a
//! reboot the payload itself triggered). Output lines are scanned as they
//! stream so a reboot is remembered even if the channel dies right after.

use crate::remote::RemoteExit;
use tracing::{debug, info};

/// Default substrings that mean the guest is rebooting
pub const DEFAULT_REBOOT_INDICATORS: &[&str] = &["rebooting", "system is going down"];

/// Classified end of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Payload exited 0 with no sign of a reboot
    Succeeded,
    /// Channel lost, or the guest announced a reboot; retryable
    Disconnected,
    /// Payload exited non-zero; not retryable
    ScriptFailed(i32),
}

impl SessionOutcome {
    /// Whether the executor may re-run the payload
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Maps exit status and observed output onto a [`SessionOutcome`]
#[derive(Debug, Clone)]
pub struct SessionClassifier {
    indicators: Vec<String>,
}

impl Default for SessionClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_REBOOT_INDICATORS.iter().copied())
    }
}

impl SessionClassifier {
    /// Classifier with a custom set of reboot indicators (matched case-insensitively)
    pub fn new<I, S>(indicators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            indicators: indicators
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Whether `line` announces a reboot
    pub fn scan_line(&self, line: &str) -> bool {
        let line = line.to_lowercase();
        self.indicators.iter().any(|i| line.contains(i.as_str()))
    }

    /// Classify a finished attempt.
    ///
    /// `exit` is `None` when no exit status arrived within the grace period.
    /// A seen reboot indicator wins over an exit code of 0.
    pub fn classify(&self, exit: Option<RemoteExit>, reboot_detected: bool) -> SessionOutcome {
        match exit {
            Some(RemoteExit::Exited(0)) if reboot_detected => SessionOutcome::Disconnected,
            Some(RemoteExit::Exited(0)) => SessionOutcome::Succeeded,
            Some(RemoteExit::Exited(code)) if reboot_detected => {
                debug!(code, "Non-zero exit after reboot announcement");
                SessionOutcome::Disconnected
            }
            Some(RemoteExit::Exited(code)) => SessionOutcome::ScriptFailed(code),
            Some(RemoteExit::ConnectionLost) | None => SessionOutcome::Disconnected,
        }
    }
}

/// State of one execution attempt
#[derive(Debug, Clone, Default)]
pub struct DeploymentSession {
    /// Attempt index, 0-based; never exceeds the retry budget
    pub attempt: u32,

    /// Last non-empty output line
    pub last_line: Option<String>,

    /// A reboot indicator has been seen in this attempt
    pub reboot_detected: bool,

    /// Output lines received
    pub lines_seen: u64,
}

impl DeploymentSession {
    /// Start attempt `attempt` (0 is the first run)
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            ..Default::default()
        }
    }

    /// Record one output line
    pub fn observe(&mut self, line: &str, classifier: &SessionClassifier) {
        self.lines_seen += 1;
        if !line.trim().is_empty() {
            self.last_line = Some(line.trim_end().to_string());
        }
        if !self.reboot_detected && classifier.scan_line(line) {
            info!(attempt = self.attempt, line = %line.trim(), "Reboot announced by remote host");
            self.reboot_detected = true;
        }
    }
}
