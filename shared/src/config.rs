//! Per-connection tuning knobs

use crate::error::{NetError, Result};
use crate::MAX_PACKET_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by every connection created by one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a send queue coalesces a burst before flushing
    pub merge_window_ms: u64,
    /// Front-queue length at which the connection is considered unable to keep up
    pub max_queue_size: usize,
    /// Heartbeat ticks without inbound traffic before a transport counts as lost
    pub max_heartbeat_delay: u32,
    /// Initial datagram ceiling offered for the unreliable transport
    pub udp_max_datagram_size: usize,
    pub udp_alive_score_max: u32,
    pub udp_downgrade_score_max: u32,
    pub udp_death_score_max: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            merge_window_ms: 5,
            max_queue_size: 4096,
            max_heartbeat_delay: 10,
            udp_max_datagram_size: 4 * (1 + MAX_PACKET_SIZE),
            udp_alive_score_max: 20,
            udp_downgrade_score_max: 5,
            udp_death_score_max: 1,
        }
    }
}

impl ConnectionConfig {
    pub fn merge_window(&self) -> Duration {
        Duration::from_millis(self.merge_window_ms)
    }

    /// Rejects settings the connection core cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(NetError::Config("max_queue_size must be positive".into()));
        }
        if self.merge_window_ms == 0 {
            return Err(NetError::Config("merge_window_ms must be positive".into()));
        }
        if self.udp_max_datagram_size < 1 + MAX_PACKET_SIZE {
            return Err(NetError::Config(format!(
                "udp_max_datagram_size must hold at least one packet ({} bytes)",
                1 + MAX_PACKET_SIZE
            )));
        }
        if self.udp_alive_score_max == 0
            || self.udp_downgrade_score_max == 0
            || self.udp_death_score_max == 0
        {
            return Err(NetError::Config("udp score maxima must be positive".into()));
        }
        if self.max_heartbeat_delay == 0 {
            return Err(NetError::Config("max_heartbeat_delay must be positive".into()));
        }
        Ok(())
    }
}
