use crate::metrics::NodeMetrics;
use crate::types::{ConnectionState, Role};
use crate::utils::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_MAX_CPU_PERCENT: f64 = 80.0;
pub const DEFAULT_MAX_MEMORY_PERCENT: f64 = 85.0;

/// What the topology needs from a node's media path, nothing more.
#[async_trait]
pub trait MediaTransportHandle: Send + Sync {
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub can_forward: bool,
    #[serde(default)]
    pub min_bandwidth_mbps: f64,
    #[serde(default)]
    pub max_forwarding_streams: u32,
}

/// Forwarding gate shared by nodes and the role assigner.
pub fn eligible_to_forward(
    capabilities: &NodeCapabilities,
    metrics: &NodeMetrics,
    max_cpu: f64,
    max_memory: f64,
) -> bool {
    capabilities.can_forward
        && metrics.bandwidth_mbps >= capabilities.min_bandwidth_mbps
        && metrics.cpu_usage_percent <= max_cpu
        && metrics.memory_usage_percent <= max_memory
}

/// Point-in-time copy of a node. Mutating it never touches the live node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub user_id: String,
    pub room_id: String,
    pub role: Role,
    pub capabilities: NodeCapabilities,
    pub metrics: NodeMetrics,
    pub forwarding_streams: Vec<String>,
    pub last_update: DateTime<Utc>,
}

impl NodeSnapshot {
    pub fn can_forward_within(&self, max_cpu: f64, max_memory: f64) -> bool {
        eligible_to_forward(&self.capabilities, &self.metrics, max_cpu, max_memory)
    }
}

struct NodeState {
    role: Role,
    capabilities: NodeCapabilities,
    metrics: NodeMetrics,
    forwarding_streams: HashSet<String>,
    last_update: DateTime<Utc>,
}

pub struct Node {
    id: String,
    user_id: String,
    room_id: String,
    state: RwLock<NodeState>,
    session_id: RwLock<Option<String>>,
    transport: RwLock<Option<Arc<dyn MediaTransportHandle>>>,
}

impl Node {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            room_id: room_id.into(),
            state: RwLock::new(NodeState {
                role: Role::Receiver,
                capabilities: NodeCapabilities::default(),
                metrics: NodeMetrics::default(),
                forwarding_streams: HashSet::new(),
                last_update: Utc::now(),
            }),
            session_id: RwLock::new(None),
            transport: RwLock::new(None),
        }
    }

    pub fn with_capabilities(self, capabilities: NodeCapabilities) -> Self {
        self.state.write().capabilities = capabilities;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.state.read().role
    }

    pub fn capabilities(&self) -> NodeCapabilities {
        self.state.read().capabilities.clone()
    }

    pub fn set_capabilities(&self, capabilities: NodeCapabilities) {
        self.state.write().capabilities = capabilities;
    }

    pub fn metrics(&self) -> NodeMetrics {
        self.state.read().metrics.clone()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.state.read().last_update
    }

    /// Stores a status report and refreshes the liveness timestamp.
    pub fn update_metrics(&self, metrics: NodeMetrics) {
        let mut state = self.state.write();
        state.metrics = metrics;
        state.last_update = Utc::now();
    }

    pub fn can_forward(&self) -> bool {
        let state = self.state.read();
        eligible_to_forward(
            &state.capabilities,
            &state.metrics,
            DEFAULT_MAX_CPU_PERCENT,
            DEFAULT_MAX_MEMORY_PERCENT,
        )
    }

    pub fn is_forwarding(&self, stream_id: &str) -> bool {
        self.state.read().forwarding_streams.contains(stream_id)
    }

    pub fn forwarding_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self.state.read().forwarding_streams.iter().cloned().collect();
        streams.sort();
        streams
    }

    pub fn stop_forwarding(&self, stream_id: &str) -> bool {
        self.state.write().forwarding_streams.remove(stream_id)
    }

    /// Replaces role and forwarding set together. Returns whether anything changed.
    pub fn apply_assignment(&self, role: Role, streams: impl IntoIterator<Item = String>) -> bool {
        let streams: HashSet<String> = streams.into_iter().collect();
        let mut state = self.state.write();
        let changed = state.role != role || state.forwarding_streams != streams;
        state.role = role;
        state.forwarding_streams = streams;
        changed
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        let mut forwarding_streams: Vec<String> = state.forwarding_streams.iter().cloned().collect();
        forwarding_streams.sort();
        NodeSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            room_id: self.room_id.clone(),
            role: state.role,
            capabilities: state.capabilities.clone(),
            metrics: state.metrics.clone(),
            forwarding_streams,
            last_update: state.last_update,
        }
    }

    /// Signaling session that currently speaks for this node.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn set_session(&self, session_id: &str) {
        *self.session_id.write() = Some(session_id.to_string());
    }

    pub fn is_owned_by(&self, session_id: &str) -> bool {
        self.session_id.read().as_deref() == Some(session_id)
    }

    pub fn attach_transport(&self, transport: Arc<dyn MediaTransportHandle>) {
        *self.transport.write() = Some(transport);
    }

    pub fn transport(&self) -> Option<Arc<dyn MediaTransportHandle>> {
        self.transport.read().clone()
    }

    pub fn detach_transport(&self) -> Option<Arc<dyn MediaTransportHandle>> {
        self.transport.write().take()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("role", &state.role)
            .field("forwarding_streams", &state.forwarding_streams.len())
            .field("session_id", &*self.session_id.read())
            .field("has_transport", &self.transport.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding_caps() -> NodeCapabilities {
        NodeCapabilities {
            can_forward: true,
            min_bandwidth_mbps: 5.0,
            max_forwarding_streams: 3,
        }
    }

    #[test]
    fn eligibility_gate() {
        let node = Node::new("n1", "u1", "r1").with_capabilities(forwarding_caps());
        assert!(!node.can_forward(), "zero bandwidth is below the node minimum");

        node.update_metrics(NodeMetrics::new(10.0, 30.0, 40.0, 20, 0.0));
        assert!(node.can_forward());

        node.update_metrics(NodeMetrics::new(10.0, 80.5, 40.0, 20, 0.0));
        assert!(!node.can_forward());

        node.update_metrics(NodeMetrics::new(10.0, 80.0, 85.0, 20, 0.0));
        assert!(node.can_forward(), "limits are inclusive");

        node.set_capabilities(NodeCapabilities {
            can_forward: false,
            ..forwarding_caps()
        });
        assert!(!node.can_forward());
    }

    #[test]
    fn snapshot_is_detached() {
        let node = Node::new("n1", "u1", "r1");
        node.apply_assignment(Role::Hybrid, vec!["s2".to_string(), "s1".to_string()]);
        let mut snap = node.snapshot();
        assert_eq!(snap.forwarding_streams, vec!["s1", "s2"]);
        snap.forwarding_streams.clear();
        snap.role = Role::Receiver;
        assert_eq!(node.role(), Role::Hybrid);
        assert_eq!(node.forwarding_streams().len(), 2);
    }

    #[test]
    fn apply_assignment_reports_changes() {
        let node = Node::new("n1", "u1", "r1");
        assert!(!node.apply_assignment(Role::Receiver, Vec::new()));
        assert!(node.apply_assignment(Role::Forwarder, Vec::new()));
        assert!(node.apply_assignment(Role::Hybrid, vec!["s1".to_string()]));
        assert!(!node.apply_assignment(Role::Hybrid, vec!["s1".to_string()]));
        assert!(node.is_forwarding("s1"));
        assert!(node.stop_forwarding("s1"));
        assert!(!node.is_forwarding("s1"));
    }

    #[test]
    fn metrics_refresh_last_update() {
        let node = Node::new("n1", "u1", "r1");
        let before = node.last_update();
        std::thread::sleep(std::time::Duration::from_millis(5));
        node.update_metrics(NodeMetrics::default());
        assert!(node.last_update() > before);
    }

    #[test]
    fn session_ownership() {
        let node = Node::new("n1", "u1", "r1");
        assert!(node.session_id().is_none());
        assert!(!node.is_owned_by("session_a"));
        node.set_session("session_a");
        node.set_session("session_b");
        assert!(node.is_owned_by("session_b"));
        assert!(!node.is_owned_by("session_a"));
    }
}
