//! Extension registry and packed extension blocks.
//!
//! A v3 record is a sequence of extension blocks behind a shared header. Each
//! extension groups semantically related flow fields and appears at most once
//! per record. The registry below is static: extension id, the tag the block
//! carries on disk, the packed body size (0 for variable-length payloads) and
//! a display name.
//!
//! Packed bodies are little-endian, matching the persisted record layout.

use serde::Serialize;

use std::net::{Ipv4Addr, Ipv6Addr};

pub const EX_NULL: u16 = 0;
pub const EX_GENERIC_FLOW: u16 = 1;
pub const EX_IPV4_FLOW: u16 = 2;
pub const EX_IPV6_FLOW: u16 = 3;
pub const EX_FLOW_MISC: u16 = 4;
pub const EX_CNT_FLOW: u16 = 5;
pub const EX_VLAN: u16 = 6;
pub const EX_AS_ROUTING: u16 = 7;
pub const EX_BGP_NEXT_HOP_V4: u16 = 8;
pub const EX_BGP_NEXT_HOP_V6: u16 = 9;
pub const EX_IP_NEXT_HOP_V4: u16 = 10;
pub const EX_IP_NEXT_HOP_V6: u16 = 11;
pub const EX_IP_RECEIVED_V4: u16 = 12;
pub const EX_IP_RECEIVED_V6: u16 = 13;
pub const EX_SAMPLER_INFO: u16 = 18;
pub const EX_LATENCY: u16 = 19;
pub const EX_IN_PAYLOAD: u16 = 29;

/// Upper bound (exclusive) for valid extension ids.
pub const MAX_EXTENSIONS: u16 = 30;

#[derive(Debug, Clone, Copy)]
pub struct ExtensionDef {
    /// Tag written into the element header. Identical to the registry index.
    pub tag: u16,
    /// Packed body size in bytes; 0 means variable length.
    pub size: u16,
    pub name: &'static str,
}

const UNDEF: ExtensionDef = ExtensionDef {
    tag: 0,
    size: 0,
    name: "undefined",
};

macro_rules! ext {
    ($tag:expr, $size:expr, $name:expr) => {
        ExtensionDef {
            tag: $tag,
            size: $size,
            name: $name,
        }
    };
}

/// Static extension table, indexed by extension id.
pub static EXTENSION_TABLE: [ExtensionDef; MAX_EXTENSIONS as usize] = [
    UNDEF,                                         // 0: EXnull
    ext!(EX_GENERIC_FLOW, 48, "generic flow"),     // 1
    ext!(EX_IPV4_FLOW, 8, "ipv4 flow"),            // 2
    ext!(EX_IPV6_FLOW, 32, "ipv6 flow"),           // 3
    ext!(EX_FLOW_MISC, 16, "flow misc"),           // 4
    ext!(EX_CNT_FLOW, 24, "out counters"),         // 5
    ext!(EX_VLAN, 8, "vlan"),                      // 6
    ext!(EX_AS_ROUTING, 8, "as routing"),          // 7
    ext!(EX_BGP_NEXT_HOP_V4, 4, "bgp next hop v4"), // 8
    ext!(EX_BGP_NEXT_HOP_V6, 16, "bgp next hop v6"), // 9
    ext!(EX_IP_NEXT_HOP_V4, 4, "ip next hop v4"),  // 10
    ext!(EX_IP_NEXT_HOP_V6, 16, "ip next hop v6"), // 11
    ext!(EX_IP_RECEIVED_V4, 4, "ip received v4"),  // 12
    ext!(EX_IP_RECEIVED_V6, 16, "ip received v6"), // 13
    UNDEF,                                         // 14
    UNDEF,                                         // 15
    UNDEF,                                         // 16
    UNDEF,                                         // 17
    ext!(EX_SAMPLER_INFO, 12, "sampler info"),     // 18
    ext!(EX_LATENCY, 24, "latency"),               // 19
    UNDEF,                                         // 20
    UNDEF,                                         // 21
    UNDEF,                                         // 22
    UNDEF,                                         // 23
    UNDEF,                                         // 24
    UNDEF,                                         // 25
    UNDEF,                                         // 26
    UNDEF,                                         // 27
    UNDEF,                                         // 28
    ext!(EX_IN_PAYLOAD, 0, "in payload"),          // 29
];

/// Packed body size for an extension id, 0 for variable or undefined ids.
#[inline]
pub fn extension_size(ext_id: u16) -> u16 {
    EXTENSION_TABLE
        .get(ext_id as usize)
        .map(|d| d.size)
        .unwrap_or(0)
}

/// A fixed-layout extension that can be packed into / unpacked from a record.
pub trait ExtensionValue: Sized {
    const ID: u16;
    const SIZE: u16;

    fn encode(&self, out: &mut [u8]);
    fn decode(body: &[u8]) -> Option<Self>;
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}

fn u128_at(b: &[u8], off: usize) -> u128 {
    let mut v = [0u8; 16];
    v.copy_from_slice(&b[off..off + 16]);
    u128::from_le_bytes(v)
}

/// Protocol, ports, TCP flags, timestamps and input counters of a flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExGenericFlow {
    pub msec_first: u64,
    pub msec_last: u64,
    pub msec_received: u64,
    pub in_packets: u64,
    pub in_bytes: u64,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub tcp_flags: u8,
    pub fwd_status: u8,
    pub src_tos: u8,
}

impl ExGenericFlow {
    pub const OFS_MSEC_FIRST: u16 = 0;
    pub const OFS_MSEC_LAST: u16 = 8;
    pub const OFS_MSEC_RECEIVED: u16 = 16;
    pub const OFS_IN_PACKETS: u16 = 24;
    pub const OFS_IN_BYTES: u16 = 32;
    pub const OFS_SRC_PORT: u16 = 40;
    pub const OFS_DST_PORT: u16 = 42;
    pub const OFS_PROTO: u16 = 44;
    pub const OFS_TCP_FLAGS: u16 = 45;
    pub const OFS_FWD_STATUS: u16 = 46;
    pub const OFS_SRC_TOS: u16 = 47;
}

impl ExtensionValue for ExGenericFlow {
    const ID: u16 = EX_GENERIC_FLOW;
    const SIZE: u16 = 48;

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.msec_first.to_le_bytes());
        out[8..16].copy_from_slice(&self.msec_last.to_le_bytes());
        out[16..24].copy_from_slice(&self.msec_received.to_le_bytes());
        out[24..32].copy_from_slice(&self.in_packets.to_le_bytes());
        out[32..40].copy_from_slice(&self.in_bytes.to_le_bytes());
        out[40..42].copy_from_slice(&self.src_port.to_le_bytes());
        out[42..44].copy_from_slice(&self.dst_port.to_le_bytes());
        out[44] = self.proto;
        out[45] = self.tcp_flags;
        out[46] = self.fwd_status;
        out[47] = self.src_tos;
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExGenericFlow {
            msec_first: u64_at(body, 0),
            msec_last: u64_at(body, 8),
            msec_received: u64_at(body, 16),
            in_packets: u64_at(body, 24),
            in_bytes: u64_at(body, 32),
            src_port: u16_at(body, 40),
            dst_port: u16_at(body, 42),
            proto: body[44],
            tcp_flags: body[45],
            fwd_status: body[46],
            src_tos: body[47],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExIpv4Flow {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl ExIpv4Flow {
    pub const OFS_SRC_ADDR: u16 = 0;
    pub const OFS_DST_ADDR: u16 = 4;
}

impl ExtensionValue for ExIpv4Flow {
    const ID: u16 = EX_IPV4_FLOW;
    const SIZE: u16 = 8;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&u32::from(self.src_addr).to_le_bytes());
        out[4..8].copy_from_slice(&u32::from(self.dst_addr).to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExIpv4Flow {
            src_addr: Ipv4Addr::from(u32_at(body, 0)),
            dst_addr: Ipv4Addr::from(u32_at(body, 4)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExIpv6Flow {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
}

impl ExIpv6Flow {
    pub const OFS_SRC_ADDR: u16 = 0;
    pub const OFS_DST_ADDR: u16 = 16;
}

impl ExtensionValue for ExIpv6Flow {
    const ID: u16 = EX_IPV6_FLOW;
    const SIZE: u16 = 32;

    fn encode(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&u128::from(self.src_addr).to_le_bytes());
        out[16..32].copy_from_slice(&u128::from(self.dst_addr).to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExIpv6Flow {
            src_addr: Ipv6Addr::from(u128_at(body, 0)),
            dst_addr: Ipv6Addr::from(u128_at(body, 16)),
        })
    }
}

/// Interface indices, masks and per-flow direction metadata.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExFlowMisc {
    pub input: u32,
    pub output: u32,
    pub src_mask: u8,
    pub dst_mask: u8,
    pub dir: u8,
    pub dst_tos: u8,
    pub bi_flow_dir: u8,
    pub flow_end_reason: u8,
    pub rev_tcp_flags: u8,
    pub fill: u8,
}

impl ExFlowMisc {
    pub const OFS_INPUT: u16 = 0;
    pub const OFS_OUTPUT: u16 = 4;
    pub const OFS_SRC_MASK: u16 = 8;
    pub const OFS_DST_MASK: u16 = 9;
    pub const OFS_DIR: u16 = 10;
    pub const OFS_DST_TOS: u16 = 11;
    pub const OFS_FLOW_END_REASON: u16 = 13;
}

impl ExtensionValue for ExFlowMisc {
    const ID: u16 = EX_FLOW_MISC;
    const SIZE: u16 = 16;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.input.to_le_bytes());
        out[4..8].copy_from_slice(&self.output.to_le_bytes());
        out[8] = self.src_mask;
        out[9] = self.dst_mask;
        out[10] = self.dir;
        out[11] = self.dst_tos;
        out[12] = self.bi_flow_dir;
        out[13] = self.flow_end_reason;
        out[14] = self.rev_tcp_flags;
        out[15] = self.fill;
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExFlowMisc {
            input: u32_at(body, 0),
            output: u32_at(body, 4),
            src_mask: body[8],
            dst_mask: body[9],
            dir: body[10],
            dst_tos: body[11],
            bi_flow_dir: body[12],
            flow_end_reason: body[13],
            rev_tcp_flags: body[14],
            fill: body[15],
        })
    }
}

/// Output direction counters and the aggregate flow count.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExCntFlow {
    pub flows: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
}

impl ExCntFlow {
    pub const OFS_FLOWS: u16 = 0;
    pub const OFS_OUT_PACKETS: u16 = 8;
    pub const OFS_OUT_BYTES: u16 = 16;
}

impl ExtensionValue for ExCntFlow {
    const ID: u16 = EX_CNT_FLOW;
    const SIZE: u16 = 24;

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.flows.to_le_bytes());
        out[8..16].copy_from_slice(&self.out_packets.to_le_bytes());
        out[16..24].copy_from_slice(&self.out_bytes.to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExCntFlow {
            flows: u64_at(body, 0),
            out_packets: u64_at(body, 8),
            out_bytes: u64_at(body, 16),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExVlan {
    pub src_vlan: u32,
    pub dst_vlan: u32,
}

impl ExVlan {
    pub const OFS_SRC_VLAN: u16 = 0;
    pub const OFS_DST_VLAN: u16 = 4;
}

impl ExtensionValue for ExVlan {
    const ID: u16 = EX_VLAN;
    const SIZE: u16 = 8;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.src_vlan.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst_vlan.to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExVlan {
            src_vlan: u32_at(body, 0),
            dst_vlan: u32_at(body, 4),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExAsRouting {
    pub src_as: u32,
    pub dst_as: u32,
}

impl ExAsRouting {
    pub const OFS_SRC_AS: u16 = 0;
    pub const OFS_DST_AS: u16 = 4;
}

impl ExtensionValue for ExAsRouting {
    const ID: u16 = EX_AS_ROUTING;
    const SIZE: u16 = 8;

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.src_as.to_le_bytes());
        out[4..8].copy_from_slice(&self.dst_as.to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExAsRouting {
            src_as: u32_at(body, 0),
            dst_as: u32_at(body, 4),
        })
    }
}

macro_rules! ipv4_extension {
    ($name:ident, $id:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        pub struct $name {
            pub ip: Ipv4Addr,
        }

        impl ExtensionValue for $name {
            const ID: u16 = $id;
            const SIZE: u16 = 4;

            fn encode(&self, out: &mut [u8]) {
                out[0..4].copy_from_slice(&u32::from(self.ip).to_le_bytes());
            }

            fn decode(body: &[u8]) -> Option<Self> {
                if body.len() < Self::SIZE as usize {
                    return None;
                }
                Some($name {
                    ip: Ipv4Addr::from(u32_at(body, 0)),
                })
            }
        }
    };
}

macro_rules! ipv6_extension {
    ($name:ident, $id:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        pub struct $name {
            pub ip: Ipv6Addr,
        }

        impl ExtensionValue for $name {
            const ID: u16 = $id;
            const SIZE: u16 = 16;

            fn encode(&self, out: &mut [u8]) {
                out[0..16].copy_from_slice(&u128::from(self.ip).to_le_bytes());
            }

            fn decode(body: &[u8]) -> Option<Self> {
                if body.len() < Self::SIZE as usize {
                    return None;
                }
                Some($name {
                    ip: Ipv6Addr::from(u128_at(body, 0)),
                })
            }
        }
    };
}

ipv4_extension!(ExBgpNextHopV4, EX_BGP_NEXT_HOP_V4);
ipv6_extension!(ExBgpNextHopV6, EX_BGP_NEXT_HOP_V6);
ipv4_extension!(ExIpNextHopV4, EX_IP_NEXT_HOP_V4);
ipv6_extension!(ExIpNextHopV6, EX_IP_NEXT_HOP_V6);
ipv4_extension!(ExIpReceivedV4, EX_IP_RECEIVED_V4);
ipv6_extension!(ExIpReceivedV6, EX_IP_RECEIVED_V6);

/// Sampler applied by the exporter to the packets of this flow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExSamplerInfo {
    pub selector_id: u64,
    pub sysid: u16,
    pub align: u16,
}

impl ExtensionValue for ExSamplerInfo {
    const ID: u16 = EX_SAMPLER_INFO;
    const SIZE: u16 = 12;

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.selector_id.to_le_bytes());
        out[8..10].copy_from_slice(&self.sysid.to_le_bytes());
        out[10..12].copy_from_slice(&self.align.to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExSamplerInfo {
            selector_id: u64_at(body, 0),
            sysid: u16_at(body, 8),
            align: u16_at(body, 10),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExLatency {
    pub usec_client_nw_delay: u64,
    pub usec_server_nw_delay: u64,
    pub usec_appl_latency: u64,
}

impl ExtensionValue for ExLatency {
    const ID: u16 = EX_LATENCY;
    const SIZE: u16 = 24;

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.usec_client_nw_delay.to_le_bytes());
        out[8..16].copy_from_slice(&self.usec_server_nw_delay.to_le_bytes());
        out[16..24].copy_from_slice(&self.usec_appl_latency.to_le_bytes());
    }

    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE as usize {
            return None;
        }
        Some(ExLatency {
            usec_client_nw_delay: u64_at(body, 0),
            usec_server_nw_delay: u64_at(body, 8),
            usec_appl_latency: u64_at(body, 16),
        })
    }
}
