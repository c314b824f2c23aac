use crate::metrics::NodeMetrics;
use crate::rtc::negotiation::LocalDescription;
use crate::rtc::options::WebRtcOption;
use crate::rtc::transport::SessionTransport;
use crate::sfu::{CentralNode, RoleChange};
use crate::signaling::connection_state::{SessionState, SessionStateManager};
use crate::signaling::messages::{Inbound, JoinRequest, PublishRequest, SdpPayload, SignalMessage};
use crate::utils::{Error, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type SignalSender = mpsc::UnboundedSender<SignalMessage>;

/// State shared by every session on this server.
pub struct SignalingContext {
    pub central: Arc<CentralNode>,
    pub states: Arc<SessionStateManager>,
    pub webrtc: WebRtcOption,
    websocket_senders: Arc<RwLock<HashMap<String, (String, SignalSender)>>>,
}

impl SignalingContext {
    pub fn new(central: Arc<CentralNode>, webrtc: WebRtcOption) -> Self {
        Self {
            central,
            states: Arc::new(SessionStateManager::new()),
            webrtc,
            websocket_senders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn register_sender(&self, node_id: &str, session_id: &str, sender: SignalSender) {
        self.websocket_senders
            .write()
            .await
            .insert(node_id.to_string(), (session_id.to_string(), sender));
    }

    /// Drops the entry only if `session_id` registered it; a rejoin from another
    /// session keeps its own sender.
    async fn remove_sender(&self, node_id: &str, session_id: &str) {
        let mut senders = self.websocket_senders.write().await;
        if senders.get(node_id).map_or(false, |(owner, _)| owner == session_id) {
            senders.remove(node_id);
        }
    }

    pub async fn has_sender(&self, node_id: &str) -> bool {
        self.websocket_senders.read().await.contains_key(node_id)
    }

    /// Pushes each changed assignment to the node's session, if it still has one.
    pub async fn push_role_changes(&self, changes: &[RoleChange]) {
        let senders = self.websocket_senders.read().await;
        for (node_id, assignment) in changes {
            match senders.get(node_id) {
                Some((session_id, sender)) => {
                    if sender.send(SignalMessage::role(session_id, assignment)).is_err() {
                        debug!("Session {} for node {} is gone", session_id, node_id);
                    }
                }
                None => debug!("No session registered for node {}", node_id),
            }
        }
    }
}

/// Drives one signaling connection. Messages are handled strictly in arrival order.
pub struct SessionHandler {
    session_id: String,
    ctx: Arc<SignalingContext>,
    outbound: SignalSender,
    transport: Arc<SessionTransport>,
    membership: Option<(String, String)>,
}

impl SessionHandler {
    /// Creates the session's transport and announces the session id with `init`.
    pub async fn start(ctx: Arc<SignalingContext>, outbound: SignalSender) -> Result<Self> {
        let session_id = format!("session_{}", Uuid::new_v4().simple());
        ctx.states.transition(&session_id, SessionState::New).await;

        let transport = Arc::new(SessionTransport::new(ctx.webrtc.clone()));
        if let Err(e) = transport.new_peer_connection().await {
            error!("Failed to create peer connection for {}: {}", session_id, e);
            ctx.states.transition(&session_id, SessionState::Failed).await;
            return Err(e);
        }

        let handler = Self {
            session_id,
            ctx,
            outbound,
            transport,
            membership: None,
        };
        handler.send(SignalMessage::init(&handler.session_id))?;
        handler
            .ctx
            .states
            .transition(&handler.session_id, SessionState::Initialized)
            .await;
        ::metrics::increment_counter!("signaling_sessions_total");
        info!("Session {} initialized", handler.session_id);
        Ok(handler)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    /// Parses a raw frame. Frames that are not valid JSON are logged and dropped.
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        match serde_json::from_str::<SignalMessage>(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!("Dropping unparseable message on {}: {}", self.session_id, e);
                Ok(())
            }
        }
    }

    /// Recoverable failures are reported to the peer and the session continues;
    /// anything else is returned and ends the session.
    pub async fn handle_message(&mut self, message: SignalMessage) -> Result<()> {
        let inbound = match message.parse() {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(
                    "Dropping malformed {} message on {}: {}",
                    message.message_type, self.session_id, e
                );
                return Ok(());
            }
        };

        let result = match inbound {
            Inbound::Offer(payload) => self.handle_offer(payload).await,
            Inbound::Answer(payload) => self.handle_answer(payload).await,
            Inbound::Connected => self.handle_connected().await,
            Inbound::Join(request) => self.handle_join(request).await,
            Inbound::Publish(request) => self.handle_publish(request).await,
            Inbound::Metrics(metrics) => self.handle_metrics(metrics).await,
            Inbound::Leave => self.leave_room().await,
            Inbound::Init => {
                debug!("Ignoring client init on {}", self.session_id);
                Ok(())
            }
            Inbound::Unknown(kind) => {
                warn!("Ignoring unknown message type {} on {}", kind, self.session_id);
                Ok(())
            }
        };

        match result {
            Err(e) if e.is_recoverable() => {
                warn!("Rejected {} on {}: {}", message.message_type, self.session_id, e);
                self.send(SignalMessage::error(&self.session_id, &e.to_string()))
            }
            other => other,
        }
    }

    async fn handle_offer(&mut self, payload: SdpPayload) -> Result<()> {
        self.ctx
            .states
            .transition(&self.session_id, SessionState::Negotiating)
            .await;
        if let Err(e) = self.transport.set_remote_description(&payload.sdp).await {
            return Err(self.negotiation_failed(e).await);
        }

        let local = match self.transport.create_answer(&payload.candidates).await {
            Ok(local) => local,
            Err(e) => return Err(self.negotiation_failed(e).await),
        };
        self.send(SignalMessage::answer(&self.session_id, &local))?;
        info!(
            "Answered offer on {} with {} candidates",
            self.session_id,
            local.candidates.len()
        );
        Ok(())
    }

    async fn handle_answer(&mut self, payload: SdpPayload) -> Result<()> {
        if let Err(e) = self.transport.set_remote_description(&payload.sdp).await {
            return Err(self.negotiation_failed(e).await);
        }
        for candidate in &payload.candidates {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Failed to add ICE candidate on {}: {}", self.session_id, e);
            }
        }
        self.send(SignalMessage::connected(&self.session_id))?;
        self.ctx
            .states
            .transition(&self.session_id, SessionState::Connected)
            .await;
        Ok(())
    }

    async fn handle_connected(&mut self) -> Result<()> {
        if self
            .ctx
            .states
            .transition(&self.session_id, SessionState::Connected)
            .await
        {
            info!("Session {} connected", self.session_id);
        }
        Ok(())
    }

    /// Starts a server-side offer. The peer is expected to reply with `answer`.
    pub async fn initiate_offer(&mut self) -> Result<LocalDescription> {
        self.ctx
            .states
            .transition(&self.session_id, SessionState::Negotiating)
            .await;
        let local = match self.transport.create_offer().await {
            Ok(local) => local,
            Err(e) => return Err(self.negotiation_failed(e).await),
        };
        self.send(SignalMessage::offer(&self.session_id, &local))?;
        Ok(local)
    }

    async fn negotiation_failed(&self, e: Error) -> Error {
        error!("Negotiation failed on {}: {}", self.session_id, e);
        ::metrics::increment_counter!("signaling_negotiation_failures_total");
        self.ctx
            .states
            .transition(&self.session_id, SessionState::Failed)
            .await;
        e
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<()> {
        if self.membership.is_some() {
            self.leave_room().await?;
        }

        let node_id = request.node_id.unwrap_or_else(|| self.session_id.clone());
        let user_id = request.user_id.unwrap_or_else(|| node_id.clone());
        let node = self
            .ctx
            .central
            .join(&request.room_id, &node_id, &user_id, request.capabilities)
            .await?;
        node.set_session(&self.session_id);
        node.attach_transport(self.transport.clone());

        self.ctx
            .register_sender(&node_id, &self.session_id, self.outbound.clone())
            .await;
        self.membership = Some((request.room_id.clone(), node_id.clone()));

        let assignment = self.ctx.central.evaluate_node(&request.room_id, &node_id).await?;
        self.send(SignalMessage::role(&self.session_id, &assignment))
    }

    fn require_membership(&self) -> Result<(String, String)> {
        self.membership
            .clone()
            .ok_or_else(|| Error::MalformedMessage("not joined to a room".to_string()))
    }

    async fn handle_publish(&mut self, request: PublishRequest) -> Result<()> {
        let (room_id, node_id) = self.require_membership()?;
        self.ctx
            .central
            .publish_stream(&room_id, &node_id, &request.stream_id, request.media_type)
            .await?;
        self.rebalance(&room_id).await
    }

    async fn handle_metrics(&mut self, metrics: NodeMetrics) -> Result<()> {
        let (room_id, node_id) = self.require_membership()?;
        let assignment = self
            .ctx
            .central
            .update_metrics(&room_id, &node_id, metrics)
            .await?;
        self.send(SignalMessage::role(&self.session_id, &assignment))?;
        self.rebalance(&room_id).await
    }

    async fn rebalance(&self, room_id: &str) -> Result<()> {
        let changes = self.ctx.central.rebalance_room(room_id).await?;
        self.ctx.push_role_changes(&changes).await;
        Ok(())
    }

    async fn leave_room(&mut self) -> Result<()> {
        let Some((room_id, node_id)) = self.membership.take() else {
            return Ok(());
        };
        self.ctx.remove_sender(&node_id, &self.session_id).await;
        let left = self
            .ctx
            .central
            .leave_session(&room_id, &node_id, &self.session_id)
            .await?;
        if !left {
            debug!("Node {} on {} was already gone or taken over", node_id, self.session_id);
            return Ok(());
        }

        match self.ctx.central.rebalance_room(&room_id).await {
            Ok(changes) => self.ctx.push_role_changes(&changes).await,
            Err(Error::RoomNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Leaves any room, closes the transport and retires the session state.
    pub async fn finish(mut self) {
        if let Err(e) = self.leave_room().await {
            warn!("Error leaving room for {}: {}", self.session_id, e);
        }
        if let Err(e) = self.transport.close().await {
            warn!("Error closing transport for {}: {}", self.session_id, e);
        }
        self.ctx
            .states
            .transition(&self.session_id, SessionState::Closed)
            .await;
        self.ctx.states.remove(&self.session_id).await;
        info!("Session {} closed", self.session_id);
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| Error::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::room::NodeCapabilities;
    use crate::types::Role;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn context() -> Arc<SignalingContext> {
        let central = Arc::new(CentralNode::new("central", SfuConfig::default()));
        Arc::new(SignalingContext::new(central, WebRtcOption::default()))
    }

    async fn session(
        ctx: &Arc<SignalingContext>,
    ) -> (SessionHandler, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::start(ctx.clone(), tx).await.unwrap();
        let init = rx.recv().await.unwrap();
        assert_eq!(init.message_type, "init");
        assert_eq!(init.session_id.as_deref(), Some(handler.session_id()));
        (handler, rx)
    }

    fn msg(kind: &str, data: serde_json::Value) -> SignalMessage {
        SignalMessage {
            message_type: kind.to_string(),
            session_id: None,
            data: Some(data),
        }
    }

    #[tokio::test]
    async fn start_announces_session() {
        let ctx = context();
        let (handler, _rx) = session(&ctx).await;
        assert!(handler.session_id().starts_with("session_"));
        assert_eq!(
            ctx.states.get_state(handler.session_id()).await,
            Some(SessionState::Initialized)
        );
        handler.finish().await;
    }

    #[tokio::test]
    async fn garbage_and_unknown_messages_keep_session_alive() {
        let ctx = context();
        let (mut handler, mut rx) = session(&ctx).await;
        assert_ok!(handler.handle_text("{not json").await);
        assert_ok!(handler.handle_text(r#"{"type":"ping"}"#).await);
        assert_ok!(handler.handle_text(r#"{"type":"offer","data":{"candidates":[1]}}"#).await);
        assert!(rx.try_recv().is_err(), "nothing is sent for dropped messages");
        handler.finish().await;
    }

    #[tokio::test]
    async fn empty_offer_sdp_reports_error() {
        let ctx = context();
        let (mut handler, mut rx) = session(&ctx).await;
        assert_ok!(handler.handle_message(msg("offer", json!({"sdp": ""}))).await);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.message_type, "error");
        assert_eq!(
            ctx.states.get_state(handler.session_id()).await,
            Some(SessionState::Failed)
        );
        handler.finish().await;
    }

    #[tokio::test]
    async fn publish_before_join_is_rejected() {
        let ctx = context();
        let (mut handler, mut rx) = session(&ctx).await;
        assert_ok!(handler.handle_message(msg("publish", json!({"stream_id": "s"}))).await);
        assert_eq!(rx.recv().await.unwrap().message_type, "error");
        handler.finish().await;
    }

    #[tokio::test]
    async fn join_metrics_and_leave_flow() {
        let ctx = context();
        let (mut a, mut rx_a) = session(&ctx).await;
        let (mut b, mut rx_b) = session(&ctx).await;
        let caps = serde_json::to_value(NodeCapabilities {
            can_forward: true,
            min_bandwidth_mbps: 5.0,
            max_forwarding_streams: 3,
        })
        .unwrap();

        assert_ok!(a.handle_message(msg("join", json!({"room_id": "r", "node_id": "a", "capabilities": caps}))).await);
        assert_eq!(rx_a.recv().await.unwrap().message_type, "role");
        assert_ok!(b.handle_message(msg("join", json!({"room_id": "r", "node_id": "b", "capabilities": caps}))).await);
        assert_eq!(rx_b.recv().await.unwrap().message_type, "role");

        assert_ok!(b.handle_message(msg("publish", json!({"stream_id": "sb"}))).await);
        let metrics = serde_json::to_value(NodeMetrics::new(10.0, 20.0, 30.0, 20, 0.0)).unwrap();
        assert_ok!(a.handle_message(msg("metrics", metrics)).await);

        let role = rx_a.recv().await.unwrap();
        assert_eq!(role.message_type, "role");
        let data = role.data.unwrap();
        assert_eq!(data["role"], json!(Role::Hybrid));
        assert_eq!(data["streams"][0]["stream_id"], "sb");

        let room = ctx.central.get_room("r").await.unwrap();
        assert_eq!(room.get_stream("sb").unwrap().target_nodes, vec!["a"]);

        assert_ok!(a.handle_message(msg("leave", json!({}))).await);
        assert!(room.get_stream("sb").unwrap().target_nodes.is_empty());
        assert_ne!(a.transport().connection_state(), crate::types::ConnectionState::Closed);

        a.finish().await;
        b.finish().await;
        assert!(ctx.central.get_room("r").await.is_none());
        assert!(ctx.states.get_all_states().await.is_empty());
    }

    #[tokio::test]
    async fn rejoin_from_new_session_survives_old_session_closing() {
        let ctx = context();
        let (mut a, mut rx_a) = session(&ctx).await;
        let (mut b, mut rx_b) = session(&ctx).await;
        let join = json!({"room_id": "r", "node_id": "x"});

        assert_ok!(a.handle_message(msg("join", join.clone())).await);
        assert_eq!(rx_a.recv().await.unwrap().message_type, "role");
        assert_ok!(b.handle_message(msg("join", join)).await);
        assert_eq!(rx_b.recv().await.unwrap().message_type, "role");

        a.finish().await;

        let room = ctx.central.get_room("r").await.unwrap();
        assert!(room.get_node("x").unwrap().is_owned_by(b.session_id()));
        assert!(ctx.has_sender("x").await);

        let metrics = serde_json::to_value(NodeMetrics::new(10.0, 20.0, 30.0, 20, 0.0)).unwrap();
        assert_ok!(b.handle_message(msg("metrics", metrics)).await);
        assert_eq!(rx_b.recv().await.unwrap().message_type, "role");

        b.finish().await;
        assert!(ctx.central.get_room("r").await.is_none());
        assert!(!ctx.has_sender("x").await);
    }
}
