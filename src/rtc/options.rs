use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STREAM_ID: &str = "selective-relay";
pub const DEFAULT_ICE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CODEC: &str = "opus";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        let credential_type = if self.credential.is_empty() {
            RTCIceCredentialType::Unspecified
        } else {
            RTCIceCredentialType::Password
        };
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            credential_type,
        }
    }
}

/// Options a session transport is built from. Zero values are replaced by
/// defaults in [`WebRtcOption::with_defaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcOption {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default, with = "duration_millis")]
    pub ice_timeout: Duration,
    #[serde(default)]
    pub codec: String,
}

impl WebRtcOption {
    pub fn new(codec: &str) -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }],
            stream_id: DEFAULT_STREAM_ID.to_string(),
            ice_timeout: DEFAULT_ICE_TIMEOUT,
            codec: codec.to_string(),
        }
    }

    pub fn with_defaults(mut self) -> Self {
        if self.stream_id.is_empty() {
            self.stream_id = DEFAULT_STREAM_ID.to_string();
        }
        if self.ice_timeout.is_zero() {
            self.ice_timeout = DEFAULT_ICE_TIMEOUT;
        }
        if self.codec.is_empty() {
            self.codec = DEFAULT_CODEC.to_string();
        }
        self
    }

    pub fn ice_timeout(&self) -> Duration {
        if self.ice_timeout.is_zero() {
            DEFAULT_ICE_TIMEOUT
        } else {
            self.ice_timeout
        }
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(IceServer::to_rtc).collect()
    }
}

impl fmt::Display for WebRtcOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WebRtcOption{{ice_servers: {}, stream_id: {}, ice_timeout: {:?}, codec: {}}}",
            self.ice_servers.len(),
            self.stream_id,
            self.ice_timeout,
            self.codec
        )
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_empty_fields() {
        let opt = WebRtcOption::default().with_defaults();
        assert_eq!(opt.stream_id, DEFAULT_STREAM_ID);
        assert_eq!(opt.ice_timeout, Duration::from_secs(10));
        assert_eq!(opt.codec, "opus");
        assert!(opt.ice_servers.is_empty());
    }

    #[test]
    fn explicit_values_survive_defaults() {
        let opt = WebRtcOption {
            stream_id: "room-a".to_string(),
            ice_timeout: Duration::from_secs(3),
            codec: "pcma".to_string(),
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(opt.stream_id, "room-a");
        assert_eq!(opt.ice_timeout(), Duration::from_secs(3));
        assert_eq!(opt.codec, "pcma");
    }

    #[test]
    fn option_parses_from_json() {
        let json = r#"{"iceServers":[{"urls":["stun:example.org:3478"]}],"iceTimeout":2500}"#;
        let opt: WebRtcOption = serde_json::from_str(json).unwrap();
        assert_eq!(opt.ice_servers.len(), 1);
        assert_eq!(opt.ice_timeout, Duration::from_millis(2500));
        assert_eq!(opt.rtc_ice_servers()[0].urls[0], "stun:example.org:3478");
    }
}
