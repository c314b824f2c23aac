use crate::types::MediaType;
use crate::utils::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferedPacket {
    #[serde(skip)]
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
    pub sequence: u16,
}

impl BufferedPacket {
    pub fn new(payload: Bytes, sequence: u16) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            sequence,
        }
    }
}

/// Bounded FIFO of recent packets; the oldest entry is evicted once full.
#[derive(Debug)]
pub struct StreamBuffer {
    max_size: usize,
    packets: Mutex<VecDeque<BufferedPacket>>,
}

impl StreamBuffer {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            packets: Mutex::new(VecDeque::with_capacity(max_size)),
        }
    }

    pub fn push(&self, packet: BufferedPacket) {
        let mut packets = self.packets.lock();
        while packets.len() >= self.max_size {
            packets.pop_front();
        }
        packets.push_back(packet);
    }

    pub fn push_rtp(&self, packet: &rtp::packet::Packet) {
        self.push(BufferedPacket::new(
            packet.payload.clone(),
            packet.header.sequence_number,
        ));
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn current_size(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn packets(&self) -> Vec<BufferedPacket> {
        self.packets.lock().iter().cloned().collect()
    }

    /// Everything buffered after `sequence`, tolerating 16-bit wraparound.
    pub fn packets_since(&self, sequence: u16) -> Vec<BufferedPacket> {
        self.packets
            .lock()
            .iter()
            .filter(|p| {
                let delta = p.sequence.wrapping_sub(sequence);
                delta != 0 && delta < u16::MAX / 2
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub id: String,
    pub source_node_id: String,
    pub media_type: MediaType,
    pub forwarding: bool,
    pub target_nodes: Vec<String>,
    pub buffered_packets: usize,
}

#[derive(Debug, Default)]
struct StreamState {
    forwarding: bool,
    target_nodes: Vec<String>,
}

/// A published media stream and the forwarders currently relaying it.
#[derive(Debug)]
pub struct Stream {
    id: String,
    source_node_id: String,
    media_type: MediaType,
    state: RwLock<StreamState>,
    buffer: StreamBuffer,
}

impl Stream {
    pub fn new(id: impl Into<String>, source_node_id: impl Into<String>, media_type: MediaType) -> Self {
        Self::with_buffer_size(id, source_node_id, media_type, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        id: impl Into<String>,
        source_node_id: impl Into<String>,
        media_type: MediaType,
        buffer_size: usize,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source_node_id.into(),
            media_type,
            state: RwLock::new(StreamState::default()),
            buffer: StreamBuffer::new(buffer_size),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_node_id(&self) -> &str {
        &self.source_node_id
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    pub fn is_forwarding(&self) -> bool {
        self.state.read().forwarding
    }

    pub fn set_forwarding(&self, forwarding: bool) {
        self.state.write().forwarding = forwarding;
    }

    pub fn target_nodes(&self) -> Vec<String> {
        self.state.read().target_nodes.clone()
    }

    /// Registers `node_id` as a forwarder of this stream. The source can never
    /// forward its own stream. Returns `false` if it was already registered.
    pub fn add_target_node(&self, node_id: &str) -> Result<bool> {
        if node_id == self.source_node_id {
            return Err(Error::SelfForwarding {
                node_id: node_id.to_string(),
                stream_id: self.id.clone(),
            });
        }
        let mut state = self.state.write();
        if state.target_nodes.iter().any(|n| n == node_id) {
            return Ok(false);
        }
        state.target_nodes.push(node_id.to_string());
        state.forwarding = true;
        Ok(true)
    }

    pub fn remove_target_node(&self, node_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.target_nodes.len();
        state.target_nodes.retain(|n| n != node_id);
        let removed = state.target_nodes.len() != before;
        if state.target_nodes.is_empty() {
            state.forwarding = false;
        }
        removed
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let state = self.state.read();
        StreamSnapshot {
            id: self.id.clone(),
            source_node_id: self.source_node_id.clone(),
            media_type: self.media_type,
            forwarding: state.forwarding,
            target_nodes: state.target_nodes.clone(),
            buffered_packets: self.buffer.current_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16) -> BufferedPacket {
        BufferedPacket::new(Bytes::from(vec![seq as u8]), seq)
    }

    #[test]
    fn buffer_evicts_oldest() {
        let buffer = StreamBuffer::new(3);
        for seq in 1..=5 {
            buffer.push(packet(seq));
        }
        assert_eq!(buffer.current_size(), 3);
        let seqs: Vec<u16> = buffer.packets().iter().map(|p| p.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn buffer_copies_are_independent() {
        let buffer = StreamBuffer::new(4);
        buffer.push(packet(1));
        let mut copy = buffer.packets();
        copy.clear();
        assert_eq!(buffer.current_size(), 1);
    }

    #[test]
    fn packets_since_handles_wraparound() {
        let buffer = StreamBuffer::new(8);
        for seq in [65534u16, 65535, 0, 1] {
            buffer.push(packet(seq));
        }
        let seqs: Vec<u16> = buffer.packets_since(65535).iter().map(|p| p.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn push_rtp_records_sequence() {
        let buffer = StreamBuffer::new(2);
        let mut rtp_packet = rtp::packet::Packet::default();
        rtp_packet.header.sequence_number = 42;
        rtp_packet.payload = Bytes::from_static(b"abc");
        buffer.push_rtp(&rtp_packet);
        let stored = buffer.packets();
        assert_eq!(stored[0].sequence, 42);
        assert_eq!(stored[0].payload.as_ref(), b"abc");
    }

    #[test]
    fn source_cannot_be_target() {
        let stream = Stream::new("s1", "n1", MediaType::Audio);
        assert!(matches!(
            stream.add_target_node("n1"),
            Err(Error::SelfForwarding { .. })
        ));
        assert!(stream.add_target_node("n2").unwrap());
        assert!(!stream.add_target_node("n2").unwrap());
        assert!(stream.is_forwarding());
        assert!(stream.remove_target_node("n2"));
        assert!(!stream.is_forwarding());
        assert!(stream.target_nodes().is_empty());
    }
}
