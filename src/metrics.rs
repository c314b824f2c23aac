use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource report a participant sends with every status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub bandwidth_mbps: f64,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub rtt_ms: u32,
    pub packet_loss_percent: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 0.0,
            cpu_usage_percent: 0.0,
            memory_usage_percent: 0.0,
            rtt_ms: 0,
            packet_loss_percent: 0.0,
            timestamp: Utc::now(),
        }
    }
}

impl NodeMetrics {
    pub fn new(
        bandwidth_mbps: f64,
        cpu_usage_percent: f64,
        memory_usage_percent: f64,
        rtt_ms: u32,
        packet_loss_percent: f64,
    ) -> Self {
        Self {
            bandwidth_mbps,
            cpu_usage_percent,
            memory_usage_percent,
            rtt_ms,
            packet_loss_percent,
            timestamp: Utc::now(),
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.rtt_ms as u64)
    }

    /// `(rtt score + loss score) / 2`, normalised against 200 ms and 10 % loss.
    pub fn network_score(&self) -> f64 {
        let rtt_score = 1.0 - (self.rtt_ms as f64 / 200.0).min(1.0);
        let loss_score = 1.0 - (self.packet_loss_percent / 10.0).min(1.0);
        (rtt_score + loss_score) / 2.0
    }
}
