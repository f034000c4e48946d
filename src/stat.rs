//! Per-protocol flow statistics accumulated while records are emitted.

use crate::extensions::{ExCntFlow, ExGenericFlow};

use serde::Serialize;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

/// Statistics record written into the flow file next to the data blocks.
///
/// Counter updates are commutative: flows, packets and bytes are sums,
/// first/last seen are min/max, so the order records arrive in does not
/// matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatRecord {
    pub numflows: u64,
    pub numbytes: u64,
    pub numpackets: u64,
    pub numflows_icmp: u64,
    pub numflows_tcp: u64,
    pub numflows_udp: u64,
    pub numflows_other: u64,
    pub numbytes_icmp: u64,
    pub numbytes_tcp: u64,
    pub numbytes_udp: u64,
    pub numbytes_other: u64,
    pub numpackets_icmp: u64,
    pub numpackets_tcp: u64,
    pub numpackets_udp: u64,
    pub numpackets_other: u64,
    pub firstseen: u64,
    pub lastseen: u64,
    pub sequence_failures: u64,
}

impl Default for StatRecord {
    fn default() -> Self {
        StatRecord {
            numflows: 0,
            numbytes: 0,
            numpackets: 0,
            numflows_icmp: 0,
            numflows_tcp: 0,
            numflows_udp: 0,
            numflows_other: 0,
            numbytes_icmp: 0,
            numbytes_tcp: 0,
            numbytes_udp: 0,
            numbytes_other: 0,
            numpackets_icmp: 0,
            numpackets_tcp: 0,
            numpackets_udp: 0,
            numpackets_other: 0,
            firstseen: u64::MAX,
            lastseen: 0,
            sequence_failures: 0,
        }
    }
}

impl StatRecord {
    /// Accounts one emitted flow record. Counter sums wrap rather than trap,
    /// the values come straight off the wire.
    pub fn update(&mut self, generic: &ExGenericFlow, cnt: Option<&ExCntFlow>) {
        let (out_packets, out_bytes, flows) = match cnt {
            Some(c) => (c.out_packets, c.out_bytes, c.flows),
            None => (0, 0, 0),
        };
        let flows = if flows != 0 { flows } else { 1 };
        let packets = generic.in_packets.wrapping_add(out_packets);
        let bytes = generic.in_bytes.wrapping_add(out_bytes);

        match generic.proto {
            IPPROTO_ICMP | IPPROTO_ICMPV6 => {
                self.numflows_icmp = self.numflows_icmp.wrapping_add(flows);
                self.numpackets_icmp = self.numpackets_icmp.wrapping_add(packets);
                self.numbytes_icmp = self.numbytes_icmp.wrapping_add(bytes);
            }
            IPPROTO_TCP => {
                self.numflows_tcp = self.numflows_tcp.wrapping_add(flows);
                self.numpackets_tcp = self.numpackets_tcp.wrapping_add(packets);
                self.numbytes_tcp = self.numbytes_tcp.wrapping_add(bytes);
            }
            IPPROTO_UDP => {
                self.numflows_udp = self.numflows_udp.wrapping_add(flows);
                self.numpackets_udp = self.numpackets_udp.wrapping_add(packets);
                self.numbytes_udp = self.numbytes_udp.wrapping_add(bytes);
            }
            _ => {
                self.numflows_other = self.numflows_other.wrapping_add(flows);
                self.numpackets_other = self.numpackets_other.wrapping_add(packets);
                self.numbytes_other = self.numbytes_other.wrapping_add(bytes);
            }
        }
        self.numflows = self.numflows.wrapping_add(flows);
        self.numpackets = self.numpackets.wrapping_add(packets);
        self.numbytes = self.numbytes.wrapping_add(bytes);

        if generic.msec_first < self.firstseen {
            self.firstseen = generic.msec_first;
        }
        if generic.msec_last > self.lastseen {
            self.lastseen = generic.msec_last;
        }
    }
}
