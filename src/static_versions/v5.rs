//! # Netflow V5
//!
//! 24-byte header, 48-byte records. V5 extends V1 with a flow sequence
//! counter, engine identifiers, AS numbers, prefix masks and the header-level
//! sampling announcement.

use crate::exporter::{Sampler, track_sequence};
use crate::extensions::{
    ExAsRouting, ExFlowMisc, ExGenericFlow, ExIpNextHopV4, ExIpReceivedV4, ExIpReceivedV6,
    ExIpv4Flow,
};
use crate::record::{self, BlockWriter, DataBlock, RecordError};
use crate::static_versions::icmp_port_fixup;
use crate::time::{unix_ms, uptime_to_msec};
use crate::{Collector, DecodeError};

use log::{debug, warn};
use nom::number::complete::be_u32;
use nom_derive::*;
use serde::Serialize;

use std::net::{IpAddr, Ipv4Addr};

const V5_HEADER_LENGTH: usize = 24;
const V5_RECORD_LENGTH: usize = 48;
const V5_MAX_RECORDS: u16 = 30;

/// Sampler id of the legacy header-level sampling announcement.
const LEGACY_SAMPLER_ID: i64 = -1;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct Header {
    /// NetFlow export format version number
    pub version: u16,
    /// Number of flows exported in this packet (1-30)
    pub count: u16,
    /// Current time in milliseconds since the export device booted
    pub sys_up_time: u32,
    /// Current count of seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Residual nanoseconds since 0000 UTC 1970
    pub unix_nsecs: u32,
    /// Sequence counter of total flows seen
    pub flow_sequence: u32,
    /// Type of flow-switching engine
    pub engine_type: u8,
    /// Slot number of the flow-switching engine
    pub engine_id: u8,
    /// First two bits hold the sampling mode; remaining 14 bits hold value of
    /// sampling interval
    pub sampling_interval: u16,
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
    pub pad1: u8,
    /// Cumulative OR of TCP flags
    pub tcp_flags: u8,
    /// IP protocol type (for example, TCP = 6; UDP = 17)
    pub prot: u8,
    /// IP type of service (ToS)
    pub tos: u8,
    /// Autonomous system number of the source, either origin or peer
    pub src_as: u16,
    /// Autonomous system number of the destination, either origin or peer
    pub dst_as: u16,
    /// Source address prefix mask bits
    pub src_mask: u8,
    /// Destination address prefix mask bits
    pub dst_mask: u8,
    /// Unused (zero) bytes
    pub pad2: u16,
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

    let mut emitted = 0u32;
    let mut remaining = data;
    while remaining.len() >= V5_HEADER_LENGTH {
        let (rest, header) = Header::parse_be(remaining).map_err(|_| DecodeError::Malformed {
            context: "v5 header".to_string(),
        })?;
        if header.count > V5_MAX_RECORDS {
            warn!("v5: unexpected record count {} in header", header.count);
            return Err(DecodeError::Malformed {
                context: format!("v5 record count {}", header.count),
            });
        }
        if rest.len() < header.count as usize * V5_RECORD_LENGTH {
            return Err(DecodeError::Incomplete {
                available: rest.len(),
                context: format!("v5 flow records, expected {}", header.count),
            });
        }

        let exporter = collector
            .exporters
            .get_or_create(source, 5, 0, cache_size, ttl.clone());
        exporter.packets += 1;
        let sysid = exporter.sysid;

        // v5 sequence numbers count flows
        let expected = exporter.last_sequence;
        if !track_sequence(exporter, header.flow_sequence, expected) {
            debug!(
                "v5: sequence failure, expected {}, got {}",
                expected, header.flow_sequence
            );
            collector.stat.sequence_failures += 1;
        }

        // legacy header-level sampling announcement
        let interval = u32::from(header.sampling_interval & 0x3FFF);
        if interval > 1 {
            exporter.insert_sampler(Sampler {
                id: LEGACY_SAMPLER_ID,
                algorithm: header.sampling_interval >> 14,
                packet_interval: 1,
                space_interval: interval,
            });
        }

        let boot_ms = unix_ms(header.unix_secs, header.unix_nsecs)
            .saturating_sub(u64::from(header.sys_up_time));

        let mut records = rest;
        for _ in 0..header.count {
            let (r, record) = Record::parse_be(records).map_err(|_| DecodeError::Malformed {
                context: "v5 record".to_string(),
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

            let written = record::write_record_retry(
                block,
                writer,
                5,
                (header.engine_type, header.engine_id),
                sysid,
                |rec| {
                    rec.push(&generic)?;
                    rec.push(&ExIpv4Flow {
                        src_addr: record.src_addr,
                        dst_addr: record.dst_addr,
                    })?;
                    if record.input != 0
                        || record.output != 0
                        || record.src_mask != 0
                        || record.dst_mask != 0
                    {
                        rec.push(&ExFlowMisc {
                            input: u32::from(record.input),
                            output: u32::from(record.output),
                            src_mask: record.src_mask,
                            dst_mask: record.dst_mask,
                            ..Default::default()
                        })?;
                    }
                    if !record.next_hop.is_unspecified() {
                        rec.push(&ExIpNextHopV4 { ip: record.next_hop })?;
                    }
                    if record.src_as != 0 || record.dst_as != 0 {
                        rec.push(&ExAsRouting {
                            src_as: u32::from(record.src_as),
                            dst_as: u32::from(record.dst_as),
                        })?;
                    }
                    match source {
                        IpAddr::V4(ip) => rec.push(&ExIpReceivedV4 { ip })?,
                        IpAddr::V6(ip) => rec.push(&ExIpReceivedV6 { ip })?,
                    }
                    Ok(())
                },
            );
            match written {
                Ok(_) => {
                    collector.stat.update(&generic, None);
                    exporter.flows += 1;
                    emitted += 1;
                }
                Err(RecordError::BlockFull) => {
                    debug!("v5: record dropped, larger than an empty block");
                }
                Err(e) => {
                    return Err(DecodeError::Malformed {
                        context: format!("v5 record emit: {}", e),
                    });
                }
            }
        }

        // next expected sequence value
        exporter.last_sequence = header.flow_sequence.wrapping_add(u32::from(header.count));

        remaining = records;
    }

    Ok(emitted)
}
