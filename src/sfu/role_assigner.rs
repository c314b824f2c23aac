use crate::config::SfuConfig;
use crate::room::{NodeSnapshot, Room, StreamSnapshot};
use crate::types::{Role, RoleAssignment, StreamInfo};
use log::debug;
use std::collections::HashMap;

const BANDWIDTH_WEIGHT: f64 = 0.4;
const CPU_WEIGHT: f64 = 0.3;
const MEMORY_WEIGHT: f64 = 0.2;
const NETWORK_WEIGHT: f64 = 0.1;

/// Roughly one forwarder per five participants, between 1 and 10.
pub fn optimal_forwarders(total_nodes: usize) -> usize {
    (total_nodes / 5).clamp(1, 10)
}

/// Pure function of its inputs: the same snapshots always yield the same assignment.
#[derive(Debug, Clone)]
pub struct RoleAssigner {
    config: SfuConfig,
}

impl RoleAssigner {
    pub fn new(config: SfuConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn is_eligible(&self, node: &NodeSnapshot) -> bool {
        node.can_forward_within(
            self.config.max_cpu_for_forwarding,
            self.config.max_memory_for_forwarding,
        )
    }

    pub fn assign_role(
        &self,
        node: &NodeSnapshot,
        all_nodes: &[NodeSnapshot],
        room: &Room,
    ) -> RoleAssignment {
        self.assign_role_with_streams(node, all_nodes, &room.streams())
    }

    pub fn assign_role_with_streams(
        &self,
        node: &NodeSnapshot,
        all_nodes: &[NodeSnapshot],
        streams: &[StreamSnapshot],
    ) -> RoleAssignment {
        if !self.is_eligible(node) || all_nodes.len() < 2 {
            return RoleAssignment::receiver();
        }

        let optimal = optimal_forwarders(all_nodes.len());
        // The candidate's own current role is not counted, so re-evaluating a
        // sitting forwarder does not crowd itself out.
        let forwarder_count = all_nodes
            .iter()
            .filter(|n| n.id != node.id && n.role.is_forwarding())
            .count();
        if forwarder_count >= optimal {
            return RoleAssignment::receiver();
        }

        let score = self.ranking_score(node);
        let better_nodes = all_nodes
            .iter()
            .filter(|n| n.id != node.id && self.is_eligible(n) && self.ranking_score(n) > score)
            .count();
        if better_nodes >= optimal - forwarder_count {
            return RoleAssignment::receiver();
        }

        let streams = self.assign_streams(node, all_nodes, streams);
        let role = if streams.is_empty() {
            Role::Forwarder
        } else {
            Role::Hybrid
        };
        RoleAssignment { role, streams }
    }

    /// Weighted 0..=1 suitability from the node's latest metrics.
    pub fn forwarding_score(&self, node: &NodeSnapshot) -> f64 {
        let m = &node.metrics;
        let bandwidth = if self.config.min_bandwidth_for_forwarding > 0.0 {
            (m.bandwidth_mbps / self.config.min_bandwidth_for_forwarding).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let cpu = 1.0 - (m.cpu_usage_percent / 100.0).clamp(0.0, 1.0);
        let memory = 1.0 - (m.memory_usage_percent / 100.0).clamp(0.0, 1.0);

        bandwidth * BANDWIDTH_WEIGHT
            + cpu * CPU_WEIGHT
            + memory * MEMORY_WEIGHT
            + m.network_score() * NETWORK_WEIGHT
    }

    fn ranking_score(&self, node: &NodeSnapshot) -> f64 {
        let score = self.forwarding_score(node);
        if node.role.is_forwarding() {
            score + self.config.incumbent_bonus
        } else {
            score
        }
    }

    /// Streams the node should relay, least-covered first, capped by the node's
    /// own limit and the configured ceiling.
    fn assign_streams(
        &self,
        node: &NodeSnapshot,
        all_nodes: &[NodeSnapshot],
        streams: &[StreamSnapshot],
    ) -> Vec<StreamInfo> {
        let mut forwarded: HashMap<&str, i64> = HashMap::new();
        for other in all_nodes {
            if other.id == node.id || !other.role.is_forwarding() {
                continue;
            }
            for stream_id in &other.forwarding_streams {
                *forwarded.entry(stream_id.as_str()).or_default() += 1;
            }
        }

        let mut candidates: Vec<(&StreamSnapshot, i64, i64)> = streams
            .iter()
            .filter(|s| s.source_node_id != node.id)
            .map(|s| {
                let existing = forwarded.get(s.id.as_str()).copied().unwrap_or(0);
                (s, existing, 100 - existing * 10)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        candidates.sort_by(|a, b| b.2.cmp(&a.2));

        let mut limit = node.capabilities.max_forwarding_streams as usize;
        if self.config.max_forwarding_streams > 0 {
            limit = limit.min(self.config.max_forwarding_streams as usize);
        }

        candidates
            .into_iter()
            .take(limit)
            .map(|(stream, existing, priority)| {
                debug!(
                    "Assigning stream {} to forwarder {} (existing forwarders: {}, priority: {})",
                    stream.id, node.id, existing, priority
                );
                StreamInfo {
                    stream_id: stream.id.clone(),
                    source_node_id: stream.source_node_id.clone(),
                    media_type: stream.media_type,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NodeMetrics;
    use crate::room::NodeCapabilities;
    use crate::types::MediaType;
    use chrono::Utc;

    fn node(id: &str, bandwidth: f64, cpu: f64, mem: f64, role: Role) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            user_id: format!("user-{}", id),
            room_id: "r".to_string(),
            role,
            capabilities: NodeCapabilities {
                can_forward: true,
                min_bandwidth_mbps: 5.0,
                max_forwarding_streams: 3,
            },
            metrics: NodeMetrics::new(bandwidth, cpu, mem, 20, 0.5),
            forwarding_streams: Vec::new(),
            last_update: Utc::now(),
        }
    }

    fn stream(id: &str, source: &str) -> StreamSnapshot {
        StreamSnapshot {
            id: id.to_string(),
            source_node_id: source.to_string(),
            media_type: MediaType::Audio,
            forwarding: false,
            target_nodes: Vec::new(),
            buffered_packets: 0,
        }
    }

    fn assigner() -> RoleAssigner {
        RoleAssigner::new(SfuConfig::default())
    }

    #[test]
    fn optimal_forwarder_bounds() {
        assert_eq!(optimal_forwarders(2), 1);
        assert_eq!(optimal_forwarders(9), 1);
        assert_eq!(optimal_forwarders(10), 2);
        assert_eq!(optimal_forwarders(200), 10);
    }

    #[test]
    fn single_node_is_receiver() {
        let a = node("a", 10.0, 10.0, 10.0, Role::Receiver);
        let out = assigner().assign_role_with_streams(&a, &[a.clone()], &[]);
        assert_eq!(out, RoleAssignment::receiver());
    }

    #[test]
    fn overloaded_node_is_receiver() {
        let hot = node("a", 10.0, 85.0, 10.0, Role::Receiver);
        let b = node("b", 1.0, 10.0, 10.0, Role::Receiver);
        let all = [hot.clone(), b];
        assert_eq!(
            assigner().assign_role_with_streams(&hot, &all, &[]).role,
            Role::Receiver
        );
    }

    #[test]
    fn best_scoring_node_becomes_hybrid() {
        let nodes = vec![
            node("a", 10.0, 30.0, 40.0, Role::Receiver),
            node("b", 5.0, 50.0, 60.0, Role::Receiver),
            node("c", 3.0, 70.0, 80.0, Role::Receiver),
        ];
        let streams = vec![stream("sa", "a"), stream("sb", "b"), stream("sc", "c")];
        let assigner = assigner();

        let a = assigner.assign_role_with_streams(&nodes[0], &nodes, &streams);
        assert_eq!(a.role, Role::Hybrid);
        assert_eq!(a.stream_ids(), vec!["sb", "sc"]);

        let b = assigner.assign_role_with_streams(&nodes[1], &nodes, &streams);
        assert_eq!(b.role, Role::Receiver);
    }

    #[test]
    fn forwarder_without_streams() {
        let nodes = vec![
            node("a", 10.0, 10.0, 10.0, Role::Receiver),
            node("b", 1.0, 10.0, 10.0, Role::Receiver),
        ];
        let out = assigner().assign_role_with_streams(&nodes[0], &nodes, &[stream("sa", "a")]);
        assert_eq!(out.role, Role::Forwarder);
        assert!(out.streams.is_empty());
    }

    #[test]
    fn full_forwarder_quota_blocks_promotion() {
        let mut incumbent = node("b", 5.0, 50.0, 60.0, Role::Hybrid);
        incumbent.forwarding_streams = vec!["sa".to_string()];
        let nodes = vec![node("a", 10.0, 10.0, 10.0, Role::Receiver), incumbent];
        let out = assigner().assign_role_with_streams(&nodes[0], &nodes, &[]);
        assert_eq!(out.role, Role::Receiver);
    }

    #[test]
    fn incumbent_keeps_role_against_marginally_better_peer() {
        let incumbent = node("a", 10.0, 30.0, 40.0, Role::Forwarder);
        let challenger = node("b", 10.0, 28.0, 40.0, Role::Receiver);
        let nodes = vec![incumbent.clone(), challenger];
        let out = assigner().assign_role_with_streams(&incumbent, &nodes, &[]);
        assert!(out.role.is_forwarding());

        let strict = RoleAssigner::new(SfuConfig {
            incumbent_bonus: 0.0,
            ..SfuConfig::default()
        });
        assert_eq!(
            strict.assign_role_with_streams(&incumbent, &nodes, &[]).role,
            Role::Receiver
        );
    }

    #[test]
    fn least_covered_streams_first() {
        let mut other = node("z", 1.0, 10.0, 10.0, Role::Hybrid);
        other.forwarding_streams = vec!["s1".to_string()];
        let mut nodes: Vec<NodeSnapshot> = (0..9)
            .map(|i| node(&format!("n{}", i), 1.0, 10.0, 10.0, Role::Receiver))
            .collect();
        nodes.push(other);
        let best = node("a", 50.0, 5.0, 5.0, Role::Receiver);
        nodes.push(best.clone());

        let streams: Vec<StreamSnapshot> = ["s1", "s2", "s3", "s4"]
            .iter()
            .map(|id| stream(id, "n0"))
            .collect();
        let out = assigner().assign_role_with_streams(&best, &nodes, &streams);
        assert_eq!(out.role, Role::Hybrid);
        assert_eq!(out.stream_ids(), vec!["s2", "s3", "s4"]);
    }

    #[test]
    fn configured_ceiling_caps_streams() {
        let nodes = vec![
            node("a", 10.0, 10.0, 10.0, Role::Receiver),
            node("b", 1.0, 10.0, 10.0, Role::Receiver),
        ];
        let streams = vec![stream("s1", "b"), stream("s2", "b"), stream("s3", "b")];
        let capped = RoleAssigner::new(SfuConfig {
            max_forwarding_streams: 1,
            ..SfuConfig::default()
        });
        let out = capped.assign_role_with_streams(&nodes[0], &nodes, &streams);
        assert_eq!(out.stream_ids(), vec!["s1"]);
    }

    #[test]
    fn assignment_is_deterministic() {
        let nodes = vec![
            node("a", 10.0, 30.0, 40.0, Role::Receiver),
            node("b", 5.0, 50.0, 60.0, Role::Receiver),
        ];
        let streams = vec![stream("x", "b"), stream("y", "b")];
        let assigner = assigner();
        let first = assigner.assign_role_with_streams(&nodes[0], &nodes, &streams);
        for _ in 0..10 {
            assert_eq!(assigner.assign_role_with_streams(&nodes[0], &nodes, &streams), first);
        }
    }
}
