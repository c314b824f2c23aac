use crate::rtc::options::{IceServer, WebRtcOption, DEFAULT_CODEC, DEFAULT_STREAM_ID};
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub ws_addr: String,
    pub debug_port: u16,
    pub node_id: String,
    pub webrtc: WebRtcOption,
    pub sfu: SfuConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let ice_servers = env::var("ICE_SERVERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::stun)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| WebRtcOption::new(DEFAULT_CODEC).ice_servers);

        Self {
            ws_addr: env::var("WS_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            debug_port: env_or("DEBUG_PORT", 8081),
            node_id: env::var("NODE_ID").unwrap_or_else(|_| "central".to_string()),
            webrtc: WebRtcOption {
                ice_servers,
                stream_id: env::var("STREAM_ID").unwrap_or_else(|_| DEFAULT_STREAM_ID.to_string()),
                ice_timeout: Duration::from_secs(env_or("ICE_TIMEOUT_SECS", 10)),
                codec: env::var("CODEC").unwrap_or_else(|_| DEFAULT_CODEC.to_string()),
            },
            sfu: SfuConfig::from_env(),
        }
    }
}

/// Tuning for the role assigner. Supplied once to the central node and read-only afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct SfuConfig {
    pub max_forwarding_streams: u32,
    pub min_bandwidth_for_forwarding: f64,
    pub max_cpu_for_forwarding: f64,
    pub max_memory_for_forwarding: f64,
    pub status_update_interval: Duration,
    pub health_check_interval: Duration,
    /// Score bonus a sitting forwarder gets when it is re-ranked. Zero disables damping.
    pub incumbent_bonus: f64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_forwarding_streams: 10,
            min_bandwidth_for_forwarding: 2.0,
            max_cpu_for_forwarding: 80.0,
            max_memory_for_forwarding: 85.0,
            status_update_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(15),
            incumbent_bonus: 0.05,
        }
    }
}

impl SfuConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_forwarding_streams: env_or("SFU_MAX_FORWARDING_STREAMS", defaults.max_forwarding_streams),
            min_bandwidth_for_forwarding: env_or(
                "SFU_MIN_BANDWIDTH_MBPS",
                defaults.min_bandwidth_for_forwarding,
            ),
            max_cpu_for_forwarding: env_or("SFU_MAX_CPU_PERCENT", defaults.max_cpu_for_forwarding),
            max_memory_for_forwarding: env_or(
                "SFU_MAX_MEMORY_PERCENT",
                defaults.max_memory_for_forwarding,
            ),
            status_update_interval: Duration::from_secs(env_or(
                "SFU_STATUS_INTERVAL_SECS",
                defaults.status_update_interval.as_secs(),
            )),
            health_check_interval: Duration::from_secs(env_or(
                "SFU_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval.as_secs(),
            )),
            incumbent_bonus: env_or("SFU_INCUMBENT_BONUS", defaults.incumbent_bonus),
        }
    }

    /// Nodes silent for longer than this are evicted by the health monitor.
    pub fn stale_after(&self) -> Duration {
        self.status_update_interval * 3
    }
}
