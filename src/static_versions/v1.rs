//! # Netflow V1
//!
//! The oldest fixed export format: a 16-byte header followed by up to 24
//! 48-byte records. Flow timestamps are relative to the exporter's sys-uptime
//! and converted here against the boot time derived from the header clock.

use crate::extensions::{
    ExFlowMisc, ExGenericFlow, ExIpNextHopV4, ExIpReceivedV4, ExIpReceivedV6, ExIpv4Flow,
    ExtensionValue,
};
use crate::record::{self, BlockWriter, DataBlock, ELEMENT_HEADER_SIZE, RecordError, V3_HEADER_SIZE};
use crate::static_versions::icmp_port_fixup;
use crate::time::{unix_ms, uptime_to_msec};
use crate::{Collector, DecodeError};

use log::{debug, warn};
use nom::number::complete::be_u32;
use nom_derive::*;
use serde::Serialize;

use std::net::{IpAddr, Ipv4Addr};

const V1_HEADER_LENGTH: usize = 16;
const V1_RECORD_LENGTH: usize = 48;
const V1_MAX_RECORDS: u16 = 24;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct Header {
    /// NetFlow export format version number
    pub version: u16,
    /// Number of flows exported in this packet (1-24)
    pub count: u16,
    /// Current time in milliseconds since the export device booted
    pub sys_up_time: u32,
    /// Current count of seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Residual nanoseconds since 0000 UTC 1970
    pub unix_nsecs: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Nom)]
pub struct Record {
    /// Source IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub src_addr: Ipv4Addr,
    /// Destination IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub dst_addr: Ipv4Addr,
    /// IP address of next hop router
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub next_hop: Ipv4Addr,
    /// SNMP index of input interface
    pub input: u16,
    /// SNMP index of output interface
    pub output: u16,
    /// Packets in the flow
    pub d_pkts: u32,
    /// Total number of Layer 3 bytes in the packets of the flow
    pub d_octets: u32,
    /// SysUptime at start of flow
    pub first: u32,
    /// SysUptime at the time the last packet of the flow was received
    pub last: u32,
    /// TCP/UDP source port number or equivalent
    pub src_port: u16,
    /// TCP/UDP destination port number or equivalent
    pub dst_port: u16,
    /// Unused (zero) bytes
    pub pad1: u16,
    /// IP protocol type (for example, TCP = 6; UDP = 17)
    pub prot: u8,
    /// IP type of service (ToS)
    pub tos: u8,
    /// Cumulative OR of TCP flags
    pub tcp_flags: u8,
    /// Unused (zero) bytes
    #[nom(Map = "|i: &[u8]| i.to_vec()", Take = "7")]
    #[serde(skip_serializing)]
    pad2: Vec<u8>,
}

/// One emitted record: header + generic flow, ipv4 flow, flow misc, next hop.
fn base_record_size() -> usize {
    V3_HEADER_SIZE
        + ELEMENT_HEADER_SIZE
        + ExGenericFlow::SIZE as usize
        + ELEMENT_HEADER_SIZE
        + ExIpv4Flow::SIZE as usize
        + ELEMENT_HEADER_SIZE
        + ExFlowMisc::SIZE as usize
        + ELEMENT_HEADER_SIZE
        + ExIpNextHopV4::SIZE as usize
}

pub(crate) fn process(
    collector: &mut Collector,
    source: IpAddr,
    received_ms: u64,
    data: &[u8],
    block: &mut DataBlock,
    writer: &mut dyn BlockWriter,
) -> Result<u32, DecodeError> {
    let cache_size = collector.template_cache_size;
    let ttl = collector.template_ttl.clone();
    let exporter = collector.exporters.get_or_create(source, 1, 0, cache_size, ttl);
    exporter.packets += 1;
    if exporter.out_record_size == 0 {
        let received = if source.is_ipv6() {
            ELEMENT_HEADER_SIZE + ExIpReceivedV6::SIZE as usize
        } else {
            ELEMENT_HEADER_SIZE + ExIpReceivedV4::SIZE as usize
        };
        exporter.out_record_size = base_record_size() + received;
    }
    let sysid = exporter.sysid;
    let out_record_size = exporter.out_record_size;

    let mut emitted = 0u32;
    let mut remaining = data;
    while remaining.len() >= V1_HEADER_LENGTH {
        let (rest, header) = Header::parse_be(remaining).map_err(|_| DecodeError::Malformed {
            context: "v1 header".to_string(),
        })?;
        if header.count > V1_MAX_RECORDS {
            warn!("v1: unexpected record count {} in header", header.count);
            return Err(DecodeError::Malformed {
                context: format!("v1 record count {}", header.count),
            });
        }
        if rest.len() < header.count as usize * V1_RECORD_LENGTH {
            return Err(DecodeError::Incomplete {
                available: rest.len(),
                context: format!("v1 flow records, expected {}", header.count),
            });
        }

        let boot_ms = unix_ms(header.unix_secs, header.unix_nsecs)
            .saturating_sub(u64::from(header.sys_up_time));

        let mut records = rest;
        for _ in 0..header.count {
            let (r, record) = Record::parse_be(records).map_err(|_| DecodeError::Malformed {
                context: "v1 record".to_string(),
            })?;
            records = r;

            let (msec_first, msec_last) =
                uptime_to_msec(record.first, record.last, header.sys_up_time, boot_ms);
            let mut generic = ExGenericFlow {
                msec_first,
                msec_last,
                msec_received: received_ms,
                in_packets: u64::from(record.d_pkts),
                in_bytes: u64::from(record.d_octets),
                src_port: record.src_port,
                dst_port: record.dst_port,
                proto: record.prot,
                tcp_flags: record.tcp_flags,
                fwd_status: 0,
                src_tos: record.tos,
            };
            icmp_port_fixup(&mut generic);

            let written = record::write_record_retry(block, writer, 1, (0, 0), sysid, |rec| {
                rec.push(&generic)?;
                rec.push(&ExIpv4Flow {
                    src_addr: record.src_addr,
                    dst_addr: record.dst_addr,
                })?;
                if record.input != 0 || record.output != 0 {
                    rec.push(&ExFlowMisc {
                        input: u32::from(record.input),
                        output: u32::from(record.output),
                        ..Default::default()
                    })?;
                }
                if !record.next_hop.is_unspecified() {
                    rec.push(&ExIpNextHopV4 { ip: record.next_hop })?;
                }
                match source {
                    IpAddr::V4(ip) => rec.push(&ExIpReceivedV4 { ip })?,
                    IpAddr::V6(ip) => rec.push(&ExIpReceivedV6 { ip })?,
                }
                Ok(())
            });
            match written {
                Ok(size) => {
                    if size as usize > out_record_size {
                        warn!(
                            "v1: record size check failed, expected at most {}, counted {}",
                            out_record_size, size
                        );
                    }
                    collector.stat.update(&generic, None);
                    exporter.flows += 1;
                    emitted += 1;
                }
                Err(RecordError::BlockFull) => {
                    debug!("v1: record dropped, larger than an empty block");
                }
                Err(e) => {
                    return Err(DecodeError::Malformed {
                        context: format!("v1 record emit: {}", e),
                    });
                }
            }
        }

        remaining = records;
    }

    Ok(emitted)
}
