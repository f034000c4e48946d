//! # IPFix
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011>
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>
//!
//! IETF successor of V9. Sets with id 2 carry templates, id 3 option
//! templates, ids >= 256 data records. Fields may be enterprise-specific
//! (skipped here, offsets preserved) or variable length, and template 292/293
//! fields nest sub-template records resolved through the exporter's template
//! store.

use crate::exporter::{Exporter, track_sequence};
use crate::fields;
use crate::record::{BlockWriter, DataBlock};
use crate::sequencer::{Sequence, Sequencer, SubTemplates, VAR_LENGTH};
use crate::stat::StatRecord;
use crate::stream::ByteReader;
use crate::template::{DataTemplate, TemplateEntry, TemplateKind, interpret_option_fields};
use crate::variable_versions::{DatagramCtx, process_data_records, process_option_data};
use crate::{Collector, DecodeError};

use log::debug;
use nom_derive::*;
use serde::Serialize;

use std::net::IpAddr;

const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
const SET_MIN_DATA_ID: u16 = 256;
const ENTERPRISE_BIT: u16 = 0x8000;

const HEADER_LENGTH: usize = 16;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct Header {
    /// Version of Flow Record format exported in this message; 0x000a for
    /// the current version
    pub version: u16,
    /// Total length of the IPFIX Message in octets, including Message Header
    /// and Sets
    pub length: u16,
    /// Time, in seconds since the epoch, at which the message leaves the
    /// exporter
    pub export_time: u32,
    /// Incremental sequence counter modulo 2^32 of all IPFIX Data Records
    /// sent from the current Observation Domain
    pub sequence_number: u32,
    /// Identifier of the Observation Domain, locally unique to the exporting
    /// process
    pub observation_domain_id: u32,
}

pub(crate) fn process(
    collector: &mut Collector,
    source: IpAddr,
    received_ms: u64,
    data: &[u8],
    block: &mut DataBlock,
    writer: &mut dyn BlockWriter,
) -> Result<u32, DecodeError> {
    let (rest, header) = Header::parse_be(data).map_err(|_| DecodeError::Incomplete {
        available: data.len(),
        context: "ipfix header".to_string(),
    })?;
    if (header.length as usize) < HEADER_LENGTH {
        return Err(DecodeError::Malformed {
            context: format!("ipfix message length {}", header.length),
        });
    }
    let body_len = (header.length as usize - HEADER_LENGTH).min(rest.len());
    let body = &rest[..body_len];

    let cache_size = collector.template_cache_size;
    let ttl = collector.template_ttl.clone();
    let stat = &mut collector.stat;
    let exporter = collector.exporters.get_or_create(
        source,
        10,
        header.observation_domain_id,
        cache_size,
        ttl,
    );
    exporter.packets += 1;

    // IPFIX sequence numbers count data records sent so far
    let expected = exporter.last_sequence;
    if !track_sequence(exporter, header.sequence_number, expected) {
        debug!(
            "ipfix: sequence failure, expected {}, got {}",
            expected, header.sequence_number
        );
        stat.sequence_failures += 1;
    }

    let export_ms = u64::from(header.export_time) * 1000;
    let ctx = DatagramCtx {
        nf_version: 10,
        sysid: exporter.sysid,
        received_ms,
        // systemInitTimeMilliseconds when announced via options, otherwise
        // the export clock anchors sysuptime-relative stamps
        boot_ms: if exporter.sysuptime != 0 {
            exporter.sysuptime
        } else {
            export_ms
        },
        sys_uptime: u32::MAX,
    };

    // first pass: template sets, so data sets of this message can use them
    let mut data_sets: Vec<(u16, &[u8])> = Vec::new();
    let mut r = ByteReader::new(body);
    while r.available() >= 4 {
        let set_id = r.get_u16();
        let length = r.get_u16() as usize;
        if !r.ok() || length < 4 || length - 4 > r.available() {
            debug!("ipfix: short set, id {}, length {}", set_id, length);
            break;
        }
        let payload = r.get_slice(length - 4);
        match set_id {
            TEMPLATE_SET_ID => parse_templates(exporter, payload),
            OPTIONS_TEMPLATE_SET_ID => parse_option_templates(exporter, payload),
            id if id >= SET_MIN_DATA_ID => data_sets.push((id, payload)),
            _ => debug!("ipfix: reserved set id {} skipped", set_id),
        }
    }

    let mut emitted = 0u32;
    for (set_id, payload) in data_sets {
        emitted += process_data_set(exporter, set_id, payload, &ctx, stat, block, writer);
    }

    // next message announces this value plus the records it carried
    exporter.last_sequence = header.sequence_number.wrapping_add(emitted);

    Ok(emitted)
}

/// Reads one field specifier, folding enterprise-specific fields into skips
/// with their wire width preserved.
fn read_field(r: &mut ByteReader) -> Option<(u16, u16, bool)> {
    let field_type = r.get_u16();
    let field_length = r.get_u16();
    if !r.ok() {
        return None;
    }
    if field_type & ENTERPRISE_BIT != 0 {
        let _enterprise_number = r.get_u32();
        if !r.ok() {
            return None;
        }
        return Some((field_type & !ENTERPRISE_BIT, field_length, true));
    }
    Some((field_type, field_length, false))
}

fn parse_templates(exporter: &mut Exporter, payload: &[u8]) {
    let mut r = ByteReader::new(payload);
    while r.available() >= 4 {
        let template_id = r.get_u16();
        let field_count = r.get_u16() as usize;
        if !r.ok() || template_id == 0 {
            break; // padding
        }
        if template_id >= SET_MIN_DATA_ID && field_count == 0 {
            // template withdrawal
            if exporter.templates.remove(template_id) {
                debug!("ipfix: template {} withdrawn", template_id);
            }
            continue;
        }
        let mut table = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let Some((field_type, field_length, enterprise)) = read_field(&mut r) else {
                return;
            };
            if enterprise {
                table.push(if field_length == VAR_LENGTH {
                    Sequence::skip(VAR_LENGTH)
                } else {
                    Sequence::skip(field_length)
                });
            } else {
                table.push(fields::lookup(field_type, field_length));
            }
        }
        if template_id < SET_MIN_DATA_ID {
            debug!("ipfix: reserved template id {} ignored", template_id);
            continue;
        }
        let sequencer = Sequencer::compile(template_id, &table);
        debug!(
            "ipfix: template {} with {} fields, {} extensions",
            template_id, field_count, sequencer.num_elements
        );
        exporter
            .templates
            .insert(template_id, TemplateKind::Data(DataTemplate { sequencer }));
    }
}

/// Parses an IPFIX option template set: scope fields are the first
/// `scope_field_count` of `field_count` specifiers.
fn parse_option_templates(exporter: &mut Exporter, payload: &[u8]) {
    let mut r = ByteReader::new(payload);
    while r.available() >= 6 {
        let template_id = r.get_u16();
        let field_count = r.get_u16() as usize;
        let scope_field_count = r.get_u16() as usize;
        if !r.ok() || template_id < SET_MIN_DATA_ID || field_count < scope_field_count {
            break; // padding
        }
        let mut scope = Vec::with_capacity(scope_field_count);
        let mut options = Vec::with_capacity(field_count - scope_field_count);
        for i in 0..field_count {
            let Some((field_type, field_length, enterprise)) = read_field(&mut r) else {
                return;
            };
            // enterprise tags keep their width in the record, but match no set
            let tag = if enterprise { 0 } else { field_type };
            if i < scope_field_count {
                scope.push((tag, field_length));
            } else {
                options.push((tag, field_length));
            }
        }
        let tpl = interpret_option_fields(&scope, &options);
        debug!(
            "ipfix: option template {}, flags 0x{:x}, record size {}",
            template_id, tpl.flags, tpl.record_size
        );
        exporter
            .templates
            .insert(template_id, TemplateKind::Options(tpl));
    }
}

fn process_data_set(
    exporter: &mut Exporter,
    set_id: u16,
    payload: &[u8],
    ctx: &DatagramCtx,
    stat: &mut StatRecord,
    block: &mut DataBlock,
    writer: &mut dyn BlockWriter,
) -> u32 {
    if let Some(tpl) = exporter
        .templates
        .lookup(set_id)
        .and_then(TemplateEntry::options)
        .copied()
    {
        process_option_data(exporter, &tpl, payload);
        return 0;
    }

    if exporter.templates.lookup(set_id).is_none() {
        exporter.missed_templates += 1;
        debug!("ipfix: missed template {} for data set", set_id);
        return 0;
    }

    // the store doubles as the sub-template resolver for 292/293 records
    let store = &exporter.templates;
    let Some(sequencer) = store.sub_sequencer(set_id) else {
        return 0;
    };
    let emitted = process_data_records(sequencer, store, payload, ctx, stat, block, writer);
    exporter.flows += u64::from(emitted);
    emitted
}
