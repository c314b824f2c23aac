use super::node::{Node, NodeSnapshot};
use super::stream::{Stream, StreamSnapshot};
use crate::metrics::NodeMetrics;
use crate::types::{MediaType, Role, RoleAssignment};
use crate::utils::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<NodeSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

#[derive(Default)]
struct RoomInner {
    nodes: HashMap<String, Arc<Node>>,
    streams: HashMap<String, Arc<Stream>>,
}

/// Lock order is room, then node, then stream. Nothing here takes them the other way.
pub struct Room {
    id: String,
    created_at: DateTime<Utc>,
    inner: RwLock<RoomInner>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            inner: RwLock::new(RoomInner::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Inserts `node`, returning any node it displaced under the same id.
    pub fn add_node(&self, node: Arc<Node>) -> Option<Arc<Node>> {
        self.inner.write().nodes.insert(node.id().to_string(), node)
    }

    /// Removes the node along with the streams it published, and drops it from
    /// every stream it was forwarding.
    pub fn remove_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.remove_node_if(node_id, |_| true)
    }

    /// Like `remove_node`, but only when `keep_out` accepts the node currently
    /// registered under `node_id`. The check and the removal share one lock.
    pub fn remove_node_if(&self, node_id: &str, keep_out: impl FnOnce(&Node) -> bool) -> Option<Arc<Node>> {
        let mut inner = self.inner.write();
        if !keep_out(inner.nodes.get(node_id)?) {
            return None;
        }
        let node = inner.nodes.remove(node_id)?;

        let owned: Vec<String> = inner
            .streams
            .values()
            .filter(|s| s.source_node_id() == node_id)
            .map(|s| s.id().to_string())
            .collect();
        for stream_id in &owned {
            inner.streams.remove(stream_id);
            for other in inner.nodes.values() {
                other.stop_forwarding(stream_id);
            }
        }
        for stream in inner.streams.values() {
            stream.remove_target_node(node_id);
        }

        debug!(
            "Removed node {} from room {} with {} owned streams",
            node_id,
            self.id,
            owned.len()
        );
        Some(node)
    }

    pub fn get_node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.inner.read().nodes.get(node_id).cloned()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        let inner = self.inner.read();
        let mut nodes: Vec<NodeSnapshot> = inner.nodes.values().map(|n| n.snapshot()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    pub fn update_metrics(&self, node_id: &str, metrics: NodeMetrics) -> Result<()> {
        let node = self
            .get_node(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        node.update_metrics(metrics);
        Ok(())
    }

    /// Publishes a stream owned by `source_node_id`, which must already be in the room.
    pub fn add_stream(
        &self,
        stream_id: &str,
        source_node_id: &str,
        media_type: MediaType,
    ) -> Result<Arc<Stream>> {
        let mut inner = self.inner.write();
        if !inner.nodes.contains_key(source_node_id) {
            return Err(Error::NodeNotFound(source_node_id.to_string()));
        }
        if let Some(existing) = inner.streams.get(stream_id) {
            if existing.source_node_id() != source_node_id {
                warn!(
                    "Stream {} republished by {} (was {})",
                    stream_id,
                    source_node_id,
                    existing.source_node_id()
                );
            } else {
                return Ok(existing.clone());
            }
        }
        let stream = Arc::new(Stream::new(stream_id, source_node_id, media_type));
        inner.streams.insert(stream_id.to_string(), stream.clone());
        Ok(stream)
    }

    pub fn remove_stream(&self, stream_id: &str) -> Option<Arc<Stream>> {
        let mut inner = self.inner.write();
        let stream = inner.streams.remove(stream_id)?;
        for node in inner.nodes.values() {
            node.stop_forwarding(stream_id);
        }
        Some(stream)
    }

    pub fn get_stream(&self, stream_id: &str) -> Option<StreamSnapshot> {
        self.inner.read().streams.get(stream_id).map(|s| s.snapshot())
    }

    /// Live handle, for feeding the stream's packet buffer.
    pub fn stream_handle(&self, stream_id: &str) -> Option<Arc<Stream>> {
        self.inner.read().streams.get(stream_id).cloned()
    }

    pub fn streams(&self) -> Vec<StreamSnapshot> {
        let inner = self.inner.read();
        let mut streams: Vec<StreamSnapshot> = inner.streams.values().map(|s| s.snapshot()).collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        streams
    }

    pub fn stream_count(&self) -> usize {
        self.inner.read().streams.len()
    }

    /// Writes an assignment onto the node and mirrors it into each stream's
    /// forwarder list. Streams that vanished since the assignment was computed
    /// are dropped, and a Hybrid left with none becomes a Forwarder. Returns the
    /// assignment as stored and whether the node's role or stream set changed.
    pub fn apply_assignment(
        &self,
        node_id: &str,
        assignment: &RoleAssignment,
    ) -> Result<(RoleAssignment, bool)> {
        let inner = self.inner.write();
        let node = inner
            .nodes
            .get(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let mut accepted = Vec::with_capacity(assignment.streams.len());
        for info in &assignment.streams {
            match inner.streams.get(&info.stream_id) {
                Some(stream) => match stream.add_target_node(node_id) {
                    Ok(_) => accepted.push(info.clone()),
                    Err(e) => warn!("Skipping assignment in room {}: {}", self.id, e),
                },
                None => warn!(
                    "Skipping assignment of unknown stream {} to {}",
                    info.stream_id, node_id
                ),
            }
        }
        for (stream_id, stream) in inner.streams.iter() {
            if !accepted.iter().any(|info| &info.stream_id == stream_id) {
                stream.remove_target_node(node_id);
            }
        }

        let role = match assignment.role {
            Role::Hybrid if accepted.is_empty() => Role::Forwarder,
            role => role,
        };
        let stored = RoleAssignment {
            role,
            streams: accepted,
        };
        let changed = node.apply_assignment(stored.role, stored.stream_ids());
        Ok((stored, changed))
    }

    /// Nodes and streams are read under the same lock, so every stream's source is listed.
    pub fn snapshot(&self) -> RoomSnapshot {
        let inner = self.inner.read();
        let mut nodes: Vec<NodeSnapshot> = inner.nodes.values().map(|n| n.snapshot()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut streams: Vec<StreamSnapshot> = inner.streams.values().map(|s| s.snapshot()).collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        RoomSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            nodes,
            streams,
        }
    }
}
