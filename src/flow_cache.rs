//! Flow tree for building flows from captured packets.
//!
//! Packets are grouped by 5-tuple into flow nodes with active and inactive
//! timeouts. Expired, finished (FIN/RST) and evicted nodes are pushed onto a
//! [`NodeList`] consumed by the flow thread, which serializes them as v3
//! records. IPv4 and IPv6 flows share one table.

use crate::extensions::{EX_IN_PAYLOAD, ExGenericFlow, ExIpv4Flow, ExIpv6Flow};
use crate::ja3;
use crate::record::{self, BlockWriter, DataBlock, RecordError};
use crate::tls;

use log::debug;
use serde::Serialize;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Condvar, Mutex};

/// Force-flush a flow this long after its first packet, default 300 s.
pub const DEFAULT_ACTIVE_TIMEOUT_MS: u64 = 300_000;
/// Flush an idle flow after this long, default 60 s.
pub const DEFAULT_INACTIVE_TIMEOUT_MS: u64 = 60_000;
/// Default node cache size.
pub const DEFAULT_CACHE_SIZE: usize = 524_288;
/// De-duplication window in packets.
const DEDUP_WINDOW: usize = 8;

const TCP_FIN: u8 = 0x01;
const TCP_RST: u8 = 0x04;

/// Canonical 5-tuple key; v4 and v6 flows live in the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowKey {
    pub proto: u8,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
}

/// One classified packet handed over by the packet thread. L2/L3/L4
/// extraction happens at the capture boundary, outside this crate.
#[derive(Debug, Clone)]
pub struct PacketData {
    pub received_ms: u64,
    pub key: FlowKey,
    pub bytes: u64,
    pub tcp_flags: u8,
    /// First payload bytes when payload capture is enabled.
    pub payload: Vec<u8>,
}

/// Aggregated flow, ready for serialization once flushed.
#[derive(Debug, Clone, Serialize)]
pub struct FlowNode {
    pub key: FlowKey,
    pub msec_first: u64,
    pub msec_last: u64,
    pub packets: u64,
    pub bytes: u64,
    pub tcp_flags: u8,
    /// Payload sample of the first payload-carrying packet.
    pub payload: Vec<u8>,
    /// JA3 fingerprint when the payload parses as a TLS client hello.
    pub ja3: Option<String>,
}

impl FlowNode {
    fn from_packet(pkt: &PacketData, capture_payload: bool) -> Self {
        let payload = if capture_payload {
            pkt.payload.clone()
        } else {
            Vec::new()
        };
        let ja3 = tls::parse(&payload).map(|h| ja3::ja3_fingerprint(&h));
        FlowNode {
            key: pkt.key,
            msec_first: pkt.received_ms,
            msec_last: pkt.received_ms,
            packets: 1,
            bytes: pkt.bytes,
            tcp_flags: pkt.tcp_flags,
            payload,
            ja3,
        }
    }

    fn aggregate(&mut self, pkt: &PacketData, capture_payload: bool) {
        self.packets += 1;
        self.bytes += pkt.bytes;
        self.tcp_flags |= pkt.tcp_flags;
        self.msec_last = pkt.received_ms;
        if capture_payload && self.payload.is_empty() && !pkt.payload.is_empty() {
            self.payload = pkt.payload.clone();
            self.ja3 = tls::parse(&self.payload).map(|h| ja3::ja3_fingerprint(&h));
        }
    }

    /// Serializes the flow as one v3 record.
    pub fn emit(
        &self,
        block: &mut DataBlock,
        writer: &mut dyn BlockWriter,
    ) -> Result<u16, RecordError> {
        record::write_record_retry(block, writer, 0, (0, 0), 0, |rec| {
            rec.push(&ExGenericFlow {
                msec_first: self.msec_first,
                msec_last: self.msec_last,
                msec_received: self.msec_last,
                in_packets: self.packets,
                in_bytes: self.bytes,
                src_port: self.key.src_port,
                dst_port: self.key.dst_port,
                proto: self.key.proto,
                tcp_flags: self.tcp_flags,
                fwd_status: 0,
                src_tos: 0,
            })?;
            match (self.key.src_addr, self.key.dst_addr) {
                (IpAddr::V4(src), IpAddr::V4(dst)) => rec.push(&ExIpv4Flow {
                    src_addr: src,
                    dst_addr: dst,
                })?,
                (IpAddr::V6(src), IpAddr::V6(dst)) => rec.push(&ExIpv6Flow {
                    src_addr: src,
                    dst_addr: dst,
                })?,
                // mixed families cannot happen for a captured packet
                _ => {}
            }
            if !self.payload.is_empty() {
                rec.push_var(EX_IN_PAYLOAD, &self.payload)?;
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone)]
pub struct FlowTreeConfig {
    pub active_timeout_ms: u64,
    pub inactive_timeout_ms: u64,
    pub cache_size: usize,
    /// De-duplicate packets within a window of 8.
    pub dedup: bool,
    pub capture_payload: bool,
}

impl Default for FlowTreeConfig {
    fn default() -> Self {
        FlowTreeConfig {
            active_timeout_ms: DEFAULT_ACTIVE_TIMEOUT_MS,
            inactive_timeout_ms: DEFAULT_INACTIVE_TIMEOUT_MS,
            cache_size: DEFAULT_CACHE_SIZE,
            dedup: false,
            capture_payload: false,
        }
    }
}

/// Flow cache of the packet thread. Single-threaded by design; flushed nodes
/// cross threads through the [`NodeList`].
#[derive(Debug)]
pub struct FlowTree {
    nodes: HashMap<FlowKey, FlowNode>,
    config: FlowTreeConfig,
    dedup_ring: [u64; DEDUP_WINDOW],
    dedup_next: usize,
    pub duplicates: u64,
}

impl FlowTree {
    pub fn new(config: FlowTreeConfig) -> Self {
        FlowTree {
            nodes: HashMap::with_capacity(config.cache_size.min(4096)),
            config,
            dedup_ring: [0; DEDUP_WINDOW],
            dedup_next: 0,
            duplicates: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Aggregates one packet, flushing nodes that hit a limit.
    pub fn insert(&mut self, pkt: &PacketData, out: &NodeList) {
        if self.config.dedup {
            let hash = packet_hash(pkt);
            if self.dedup_ring.contains(&hash) {
                self.duplicates += 1;
                return;
            }
            self.dedup_ring[self.dedup_next] = hash;
            self.dedup_next = (self.dedup_next + 1) % DEDUP_WINDOW;
        }

        if let Some(mut node) = self.nodes.remove(&pkt.key) {
            if pkt.received_ms.saturating_sub(node.msec_first) >= self.config.active_timeout_ms {
                // active timeout: flush and start over with this packet
                out.push(node);
            } else {
                node.aggregate(pkt, self.config.capture_payload);
                if pkt.tcp_flags & (TCP_FIN | TCP_RST) != 0 {
                    out.push(node);
                } else {
                    self.nodes.insert(pkt.key, node);
                }
                return;
            }
        }

        if self.nodes.len() >= self.config.cache_size {
            self.evict_oldest(out);
        }

        let node = FlowNode::from_packet(pkt, self.config.capture_payload);
        if pkt.tcp_flags & (TCP_FIN | TCP_RST) != 0 {
            out.push(node);
        } else {
            self.nodes.insert(pkt.key, node);
        }
    }

    /// Flushes nodes idle longer than the inactive timeout.
    pub fn expire(&mut self, now_ms: u64, out: &NodeList) -> usize {
        let limit = self.config.inactive_timeout_ms;
        let expired: Vec<FlowKey> = self
            .nodes
            .iter()
            .filter(|(_, n)| now_ms.saturating_sub(n.msec_last) >= limit)
            .map(|(k, _)| *k)
            .collect();
        let count = expired.len();
        for key in expired {
            if let Some(node) = self.nodes.remove(&key) {
                out.push(node);
            }
        }
        count
    }

    /// Flushes every remaining node, e.g. on shutdown.
    pub fn flush_all(&mut self, out: &NodeList) {
        debug!("flow tree: flushing {} nodes", self.nodes.len());
        for (_, node) in self.nodes.drain() {
            out.push(node);
        }
    }

    fn evict_oldest(&mut self, out: &NodeList) {
        if let Some(key) = self
            .nodes
            .iter()
            .min_by_key(|(_, n)| n.msec_last)
            .map(|(k, _)| *k)
        {
            if let Some(node) = self.nodes.remove(&key) {
                out.push(node);
            }
        }
    }
}

/// FNV-1a over the identifying bytes of a packet; identical frames within
/// the dedup window hash identically.
fn packet_hash(pkt: &PacketData) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    let mut mix = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(PRIME);
        }
    };
    mix(&[pkt.key.proto, pkt.tcp_flags]);
    match pkt.key.src_addr {
        IpAddr::V4(ip) => mix(&ip.octets()),
        IpAddr::V6(ip) => mix(&ip.octets()),
    }
    match pkt.key.dst_addr {
        IpAddr::V4(ip) => mix(&ip.octets()),
        IpAddr::V6(ip) => mix(&ip.octets()),
    }
    mix(&pkt.key.src_port.to_be_bytes());
    mix(&pkt.key.dst_port.to_be_bytes());
    mix(&pkt.bytes.to_be_bytes());
    mix(&pkt.received_ms.to_be_bytes());
    hash
}

/// Queue of flushed flow nodes between the packet thread and the flow
/// thread. Closing wakes all consumers; remaining nodes are still drained.
#[derive(Debug, Default)]
pub struct NodeList {
    state: Mutex<NodeListState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct NodeListState {
    queue: VecDeque<FlowNode>,
    closed: bool,
}

impl NodeList {
    pub fn new() -> Self {
        NodeList::default()
    }

    pub fn push(&self, node: FlowNode) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(node);
        drop(state);
        self.cond.notify_one();
    }

    /// Blocks until a node is available; `None` once closed and drained.
    pub fn pop(&self) -> Option<FlowNode> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(node) = state.queue.pop_front() {
                return Some(node);
            }
            if state.closed {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(src_port: u16) -> FlowKey {
        FlowKey {
            proto: 6,
            src_addr: "10.0.0.1".parse().unwrap(),
            src_port,
            dst_addr: "10.0.0.2".parse().unwrap(),
            dst_port: 443,
        }
    }

    fn packet(src_port: u16, received_ms: u64, flags: u8) -> PacketData {
        PacketData {
            received_ms,
            key: key(src_port),
            bytes: 100,
            tcp_flags: flags,
            payload: Vec::new(),
        }
    }

    #[test]
    fn aggregates_in_arrival_order() {
        let mut tree = FlowTree::new(FlowTreeConfig::default());
        let out = NodeList::new();
        tree.insert(&packet(1000, 10, 0x02), &out);
        tree.insert(&packet(1000, 20, 0x10), &out);
        tree.insert(&packet(1000, 30, 0x10), &out);
        assert_eq!(tree.len(), 1);
        assert!(out.is_empty());

        tree.flush_all(&out);
        let node = out.pop().unwrap();
        assert_eq!(node.packets, 3);
        assert_eq!(node.bytes, 300);
        assert_eq!(node.msec_first, 10);
        assert_eq!(node.msec_last, 30);
        assert_eq!(node.tcp_flags, 0x12);
    }

    #[test]
    fn fin_flushes_eagerly() {
        let mut tree = FlowTree::new(FlowTreeConfig::default());
        let out = NodeList::new();
        tree.insert(&packet(1000, 10, 0x02), &out);
        tree.insert(&packet(1000, 20, 0x01), &out); // FIN
        assert_eq!(tree.len(), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out.pop().unwrap().packets, 2);
    }

    #[test]
    fn active_timeout_starts_a_new_flow() {
        let config = FlowTreeConfig {
            active_timeout_ms: 1000,
            ..Default::default()
        };
        let mut tree = FlowTree::new(config);
        let out = NodeList::new();
        tree.insert(&packet(1000, 0, 0), &out);
        tree.insert(&packet(1000, 500, 0), &out);
        tree.insert(&packet(1000, 1500, 0), &out); // beyond active timeout
        assert_eq!(out.len(), 1);
        assert_eq!(tree.len(), 1);
        let flushed = out.pop().unwrap();
        assert_eq!(flushed.packets, 2);
    }

    #[test]
    fn inactive_timeout_expires_idle_flows() {
        let config = FlowTreeConfig {
            inactive_timeout_ms: 1000,
            ..Default::default()
        };
        let mut tree = FlowTree::new(config);
        let out = NodeList::new();
        tree.insert(&packet(1000, 0, 0), &out);
        tree.insert(&packet(2000, 900, 0), &out);
        assert_eq!(tree.expire(1100, &out), 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn cache_cap_evicts_oldest_last() {
        let config = FlowTreeConfig {
            cache_size: 2,
            ..Default::default()
        };
        let mut tree = FlowTree::new(config);
        let out = NodeList::new();
        tree.insert(&packet(1000, 10, 0), &out);
        tree.insert(&packet(2000, 20, 0), &out);
        tree.insert(&packet(3000, 30, 0), &out);
        assert_eq!(tree.len(), 2);
        let evicted = out.pop().unwrap();
        assert_eq!(evicted.key.src_port, 1000);
    }

    #[test]
    fn dedup_window_suppresses_duplicates() {
        let config = FlowTreeConfig {
            dedup: true,
            ..Default::default()
        };
        let mut tree = FlowTree::new(config);
        let out = NodeList::new();
        let pkt = packet(1000, 10, 0);
        tree.insert(&pkt, &out);
        tree.insert(&pkt, &out);
        assert_eq!(tree.duplicates, 1);
        // a different packet of the same flow still aggregates
        tree.insert(&packet(1000, 20, 0), &out);
        tree.flush_all(&out);
        assert_eq!(out.pop().unwrap().packets, 2);
    }

    #[test]
    fn emitted_flow_record_verifies() {
        let mut tree = FlowTree::new(FlowTreeConfig::default());
        let out = NodeList::new();
        tree.insert(&packet(1000, 10, 0x02), &out);
        tree.flush_all(&out);
        let node = out.pop().unwrap();

        let mut block = DataBlock::default();
        let mut writer = crate::record::MemBlockWriter::default();
        node.emit(&mut block, &mut writer).unwrap();
        let rec = crate::record::records(&block).next().unwrap();
        assert!(crate::record::verify_v3_record(rec));
    }
}
