use crate::metrics::NodeMetrics;
use crate::room::NodeCapabilities;
use crate::rtc::negotiation::LocalDescription;
use crate::types::{MediaType, RoleAssignment};
use crate::utils::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MESSAGE_INIT: &str = "init";
pub const MESSAGE_OFFER: &str = "offer";
pub const MESSAGE_ANSWER: &str = "answer";
pub const MESSAGE_CONNECTED: &str = "connected";
pub const MESSAGE_JOIN: &str = "join";
pub const MESSAGE_PUBLISH: &str = "publish";
pub const MESSAGE_METRICS: &str = "metrics";
pub const MESSAGE_LEAVE: &str = "leave";
pub const MESSAGE_ROLE: &str = "role";
pub const MESSAGE_ERROR: &str = "error";

/// `{ "type": ..., "session_id": ..., "data": ... }` as carried over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdpPayload {
    pub sdp: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinRequest {
    pub room_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishRequest {
    pub stream_id: String,
    #[serde(default = "default_media_type")]
    pub media_type: MediaType,
}

fn default_media_type() -> MediaType {
    MediaType::Audio
}

/// Typed view of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Init,
    Offer(SdpPayload),
    Answer(SdpPayload),
    Connected,
    Join(JoinRequest),
    Publish(PublishRequest),
    Metrics(NodeMetrics),
    Leave,
    Unknown(String),
}

impl SignalMessage {
    pub fn new(message_type: &str, session_id: &str, data: Option<Value>) -> Self {
        Self {
            message_type: message_type.to_string(),
            session_id: Some(session_id.to_string()),
            data,
        }
    }

    pub fn init(session_id: &str) -> Self {
        Self::new(MESSAGE_INIT, session_id, None)
    }

    pub fn offer(session_id: &str, local: &LocalDescription) -> Self {
        Self::new(MESSAGE_OFFER, session_id, Some(sdp_data(local)))
    }

    pub fn answer(session_id: &str, local: &LocalDescription) -> Self {
        Self::new(MESSAGE_ANSWER, session_id, Some(sdp_data(local)))
    }

    pub fn connected(session_id: &str) -> Self {
        Self::new(MESSAGE_CONNECTED, session_id, None)
    }

    pub fn role(session_id: &str, assignment: &RoleAssignment) -> Self {
        Self::new(
            MESSAGE_ROLE,
            session_id,
            Some(json!({ "role": assignment.role, "streams": assignment.streams })),
        )
    }

    pub fn error(session_id: &str, description: &str) -> Self {
        Self::new(MESSAGE_ERROR, session_id, Some(json!({ "description": description })))
    }

    pub fn parse(&self) -> Result<Inbound> {
        Ok(match self.message_type.as_str() {
            MESSAGE_INIT => Inbound::Init,
            MESSAGE_OFFER => Inbound::Offer(self.sdp_payload()?),
            MESSAGE_ANSWER => Inbound::Answer(self.sdp_payload()?),
            MESSAGE_CONNECTED => Inbound::Connected,
            MESSAGE_JOIN => Inbound::Join(self.typed_data()?),
            MESSAGE_PUBLISH => Inbound::Publish(self.typed_data()?),
            MESSAGE_METRICS => Inbound::Metrics(self.typed_data()?),
            MESSAGE_LEAVE => Inbound::Leave,
            other => Inbound::Unknown(other.to_string()),
        })
    }

    fn data_object(&self) -> Result<&serde_json::Map<String, Value>> {
        self.data
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MalformedMessage(format!("{} without data object", self.message_type)))
    }

    fn typed_data<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let data = self.data_object()?;
        serde_json::from_value(Value::Object(data.clone()))
            .map_err(|e| Error::MalformedMessage(format!("{}: {}", self.message_type, e)))
    }

    fn sdp_payload(&self) -> Result<SdpPayload> {
        let data = self.data_object()?;
        let sdp = data
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedMessage(format!("{} missing sdp", self.message_type)))?
            .to_string();

        let candidates = match data.get("candidates") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|c| {
                    c.as_str().map(str::to_string).ok_or_else(|| {
                        Error::MalformedMessage(format!("non-string candidate: {}", c))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::MalformedMessage(format!(
                    "candidates must be an array, got {}",
                    other
                )))
            }
        };

        Ok(SdpPayload { sdp, candidates })
    }
}

fn sdp_data(local: &LocalDescription) -> Value {
    json!({ "sdp": local.sdp, "candidates": local.candidates })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn message(raw: &str) -> SignalMessage {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn offer_wire_shape() {
        let local = LocalDescription {
            sdp: "v=0".to_string(),
            candidates: vec!["candidate:1".to_string()],
        };
        let json = serde_json::to_value(SignalMessage::offer("session_1", &local)).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["session_id"], "session_1");
        assert_eq!(json["data"]["candidates"][0], "candidate:1");
    }

    #[test]
    fn init_omits_data() {
        let json = serde_json::to_string(&SignalMessage::init("session_x")).unwrap();
        assert_eq!(json, r#"{"type":"init","session_id":"session_x"}"#);
    }

    #[test]
    fn parses_offer_with_candidates() {
        let msg = message(r#"{"type":"offer","data":{"sdp":"v=0","candidates":["a","b"]}}"#);
        assert_eq!(
            msg.parse().unwrap(),
            Inbound::Offer(SdpPayload {
                sdp: "v=0".to_string(),
                candidates: vec!["a".to_string(), "b".to_string()],
            })
        );
    }

    #[test]
    fn malformed_sdp_payloads() {
        for raw in [
            r#"{"type":"offer"}"#,
            r#"{"type":"offer","data":{"candidates":[]}}"#,
            r#"{"type":"answer","data":{"sdp":"v=0","candidates":[1]}}"#,
            r#"{"type":"answer","data":{"sdp":"v=0","candidates":"a"}}"#,
        ] {
            assert!(
                matches!(message(raw).parse(), Err(Error::MalformedMessage(_))),
                "{} should be malformed",
                raw
            );
        }
    }

    #[test]
    fn unknown_types_are_not_errors() {
        let msg = message(r#"{"type":"ping","data":42}"#);
        assert_eq!(msg.parse().unwrap(), Inbound::Unknown("ping".to_string()));
    }

    #[test]
    fn control_messages() {
        let join = message(
            r#"{"type":"join","data":{"room_id":"r","capabilities":{"can_forward":true,"min_bandwidth_mbps":5.0,"max_forwarding_streams":3}}}"#,
        );
        match join.parse().unwrap() {
            Inbound::Join(req) => {
                assert_eq!(req.room_id, "r");
                assert!(req.capabilities.can_forward);
                assert!(req.node_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let publish = message(r#"{"type":"publish","data":{"stream_id":"s"}}"#);
        assert_eq!(
            publish.parse().unwrap(),
            Inbound::Publish(PublishRequest {
                stream_id: "s".to_string(),
                media_type: MediaType::Audio,
            })
        );

        let bad_metrics = message(r#"{"type":"metrics","data":{"bandwidth_mbps":"fast"}}"#);
        assert!(matches!(bad_metrics.parse(), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn role_message_shape() {
        let json = serde_json::to_value(SignalMessage::role(
            "s",
            &RoleAssignment {
                role: Role::Hybrid,
                streams: vec![],
            },
        ))
        .unwrap();
        assert_eq!(json["data"]["role"], "HYBRID");
    }
}
