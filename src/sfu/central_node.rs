use crate::config::SfuConfig;
use crate::metrics::NodeMetrics;
use crate::room::{Node, NodeCapabilities, Room, RoomSnapshot, Stream};
use crate::sfu::role_assigner::RoleAssigner;
use crate::types::{MediaType, RoleAssignment};
use crate::utils::{Error, Result};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// A node whose role or forwarding set changed during an evaluation.
pub type RoleChange = (String, RoleAssignment);

/// Owns every room and runs role evaluation over them.
pub struct CentralNode {
    id: String,
    config: SfuConfig,
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    role_assigner: RoleAssigner,
}

impl CentralNode {
    pub fn new(id: impl Into<String>, config: SfuConfig) -> Self {
        Self {
            id: id.into(),
            role_assigner: RoleAssigner::new(config.clone()),
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn role_assigner(&self) -> &RoleAssigner {
        &self.role_assigner
    }

    /// Returns the existing room if there is one.
    pub async fn create_room(&self, room_id: &str) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(room_id));
        rooms.insert(room_id.to_string(), room.clone());
        ::metrics::gauge!("sfu_rooms", rooms.len() as f64);
        info!("Room created: {}", room_id);
        room
    }

    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn require_room(&self, room_id: &str) -> Result<Arc<Room>> {
        self.get_room(room_id)
            .await
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))
    }

    pub async fn remove_room(&self, room_id: &str) -> Result<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .remove(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?;
        ::metrics::gauge!("sfu_rooms", rooms.len() as f64);
        info!("Room removed: {}", room_id);
        Ok(room)
    }

    pub async fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn room_snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.get_room(room_id).await.map(|room| room.snapshot())
    }

    pub async fn snapshot(&self) -> Vec<RoomSnapshot> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut snapshots: Vec<RoomSnapshot> = rooms.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Adds a node to the room, creating the room on first join. A node that
    /// rejoins under the same id replaces the old one.
    pub async fn join(
        &self,
        room_id: &str,
        node_id: &str,
        user_id: &str,
        capabilities: NodeCapabilities,
    ) -> Result<Arc<Node>> {
        let room = self.create_room(room_id).await;
        let node = Arc::new(Node::new(node_id, user_id, room_id).with_capabilities(capabilities));
        if let Some(previous) = room.add_node(node.clone()) {
            warn!("Node {} rejoined room {}, replacing previous session", node_id, room_id);
            if let Some(transport) = previous.detach_transport() {
                if let Err(e) = transport.close().await {
                    warn!("Failed to close replaced transport for {}: {}", node_id, e);
                }
            }
        }
        ::metrics::increment_counter!("sfu_node_joins_total");
        info!("Node {} joined room {} ({} nodes)", node_id, room_id, room.node_count());
        Ok(node)
    }

    /// Removes the node, closes its media path and drops the room once empty.
    pub async fn leave(&self, room_id: &str, node_id: &str) -> Result<()> {
        let room = self.require_room(room_id).await?;
        let node = room
            .remove_node(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        if let Some(transport) = node.detach_transport() {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport for {}: {}", node_id, e);
            }
        }
        info!("Node {} left room {}", node_id, room_id);
        self.drop_if_empty(room_id).await;
        Ok(())
    }

    /// Removes the node only while `session_id` still owns it. The transport is
    /// detached but left open, since the session keeps using it. Returns `false`
    /// when the node is gone or another session has rejoined under its id.
    pub async fn leave_session(&self, room_id: &str, node_id: &str, session_id: &str) -> Result<bool> {
        let Some(room) = self.get_room(room_id).await else {
            return Ok(false);
        };
        let Some(node) = room.remove_node_if(node_id, |n| n.is_owned_by(session_id)) else {
            debug!(
                "Session {} no longer owns node {} in room {}",
                session_id, node_id, room_id
            );
            return Ok(false);
        };

        node.detach_transport();
        info!("Node {} left room {}", node_id, room_id);
        self.drop_if_empty(room_id).await;
        Ok(true)
    }

    async fn drop_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        let still_empty = rooms.get(room_id).map_or(false, |r| r.is_empty());
        if still_empty {
            rooms.remove(room_id);
            ::metrics::gauge!("sfu_rooms", rooms.len() as f64);
            info!("Room {} is empty, removed", room_id);
        }
    }

    pub async fn publish_stream(
        &self,
        room_id: &str,
        node_id: &str,
        stream_id: &str,
        media_type: MediaType,
    ) -> Result<Arc<Stream>> {
        let room = self.require_room(room_id).await?;
        let stream = room.add_stream(stream_id, node_id, media_type)?;
        info!("Node {} published {:?} stream {} in room {}", node_id, media_type, stream_id, room_id);
        Ok(stream)
    }

    /// Stores the report first, then re-evaluates the reporting node.
    pub async fn update_metrics(
        &self,
        room_id: &str,
        node_id: &str,
        metrics: NodeMetrics,
    ) -> Result<RoleAssignment> {
        let room = self.require_room(room_id).await?;
        room.update_metrics(node_id, metrics)?;
        let (assignment, _) = self.evaluate_in_room(&room, node_id)?;
        Ok(assignment)
    }

    pub async fn evaluate_node(&self, room_id: &str, node_id: &str) -> Result<RoleAssignment> {
        let room = self.require_room(room_id).await?;
        let (assignment, _) = self.evaluate_in_room(&room, node_id)?;
        Ok(assignment)
    }

    /// Re-evaluates every node in id order against a fresh snapshot each time.
    pub async fn rebalance_room(&self, room_id: &str) -> Result<Vec<RoleChange>> {
        let room = self.require_room(room_id).await?;
        let mut changes = Vec::new();
        for node_id in room.node_ids() {
            match self.evaluate_in_room(&room, &node_id) {
                Ok((assignment, true)) => changes.push((node_id, assignment)),
                Ok(_) => {}
                // left between listing and evaluation
                Err(Error::NodeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !changes.is_empty() {
            debug!("Rebalanced room {}: {} nodes changed", room_id, changes.len());
        }
        Ok(changes)
    }

    fn evaluate_in_room(&self, room: &Room, node_id: &str) -> Result<(RoleAssignment, bool)> {
        let snapshots = room.node_snapshots();
        let node = snapshots
            .iter()
            .find(|n| n.id == node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        let computed = self.role_assigner.assign_role(node, &snapshots, room);
        let (assignment, changed) = room.apply_assignment(node_id, &computed)?;
        if changed {
            ::metrics::increment_counter!("sfu_role_changes_total", "role" => assignment.role.as_str());
            info!(
                "Node {} in room {} assigned {} with {} streams",
                node_id,
                room.id(),
                assignment.role,
                assignment.streams.len()
            );
        }
        Ok((assignment, changed))
    }

    /// Evicts nodes that have not reported within `stale_after`, returning the
    /// rooms they were removed from.
    pub async fn evict_stale_nodes(&self) -> Vec<String> {
        let cutoff = match chrono::Duration::from_std(self.config.stale_after()) {
            Ok(window) => Utc::now() - window,
            Err(_) => return Vec::new(),
        };
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();

        let mut affected = Vec::new();
        for room in rooms {
            let stale: Vec<String> = room
                .node_snapshots()
                .into_iter()
                .filter(|n| n.last_update < cutoff)
                .map(|n| n.id)
                .collect();
            for node_id in &stale {
                warn!("Evicting stale node {} from room {}", node_id, room.id());
                ::metrics::increment_counter!("sfu_stale_evictions_total");
                if let Err(e) = self.leave(room.id(), node_id).await {
                    debug!("Stale node {} already gone: {}", node_id, e);
                }
            }
            if !stale.is_empty() {
                affected.push(room.id().to_string());
            }
        }
        affected
    }

    pub fn spawn_health_monitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.health_check_interval);
            loop {
                ticker.tick().await;
                for room_id in self.evict_stale_nodes().await {
                    if let Err(e) = self.rebalance_room(&room_id).await {
                        debug!("Skipped rebalance of {}: {}", room_id, e);
                    }
                }
            }
        })
    }
}
