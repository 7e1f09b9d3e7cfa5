//! Transfer configuration.
//!
//! Loaded from TOML or built in code. Values here replace what would
//! otherwise be process-wide constants (remote command, buffer sizes).

use crate::error::{Result, ScpError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default remote program name
pub const DEFAULT_REMOTE_COMMAND: &str = "scp";

/// Default body chunk size (64KB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default size for control record and ack reads (16KB).
/// Must hold the longest filename a remote can announce.
pub const DEFAULT_RECORD_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpConfig {
    /// Program run on the remote side, e.g. `scp` or `/usr/bin/scp`
    pub remote_command: String,
    /// Max bytes per body chunk, both directions
    pub buffer_size: usize,
    /// Max bytes per control record / ack read
    pub record_buffer_size: usize,
    /// Channel receive timeout in seconds. None blocks indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            remote_command: DEFAULT_REMOTE_COMMAND.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            record_buffer_size: DEFAULT_RECORD_BUFFER_SIZE,
            timeout_secs: None,
        }
    }
}

impl ScpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_command(mut self, command: impl Into<String>) -> Self {
        self.remote_command = command.into();
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Timeouts have whole-second granularity; fractions round up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = Some(secs.max(1));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ScpConfig =
            toml::from_str(s).map_err(|e| ScpError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ScpError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_command.trim().is_empty() {
            return Err(ScpError::Config("remote_command is empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ScpError::Config("buffer_size must be > 0".to_string()));
        }
        if self.record_buffer_size == 0 {
            return Err(ScpError::Config(
                "record_buffer_size must be > 0".to_string(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(ScpError::Config("timeout_secs must be > 0".to_string()));
        }
        Ok(())
    }
}
