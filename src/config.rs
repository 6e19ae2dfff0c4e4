//! Serial link configuration, loaded from an optional TOML file and
//! otherwise defaulting to the values the state machines specify.

use crate::error::{OasisError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud: u32,
    pub enq_retries: u32,
    pub packet_retries: u32,
    pub max_ack_retries: u32,
    pub ack_timeout_ms: u64,
    pub enq_timeout_ms: u64,
    pub pacing_delay_ms: u64,
    pub pcap_path: Option<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud: 19200,
            enq_retries: 20,
            packet_retries: 5,
            max_ack_retries: 5,
            ack_timeout_ms: 500,
            enq_timeout_ms: 30_000,
            pacing_delay_ms: 0,
            pcap_path: None,
        }
    }
}

impl SerialConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| OasisError::format(format!("invalid configuration at {}: {e}", path.display())))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn enq_timeout(&self) -> Duration {
        Duration::from_millis(self.enq_timeout_ms)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}
