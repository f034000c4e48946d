//! # Netflow V9
//!
//! References:
//! - <https://www.ietf.org/rfc/rfc3954.txt>
//!
//! Template-driven export. A datagram carries template flowsets (id 0),
//! option template flowsets (id 1) and data flowsets (id >= 256) keyed by
//! template id. Flow timestamps are sys-uptime relative and resolved against
//! the boot time derived from the header clock.

use crate::exporter::{Exporter, track_sequence};
use crate::fields;
use crate::record::{BlockWriter, DataBlock};
use crate::sequencer::{NoSubTemplates, Sequencer};
use crate::stat::StatRecord;
use crate::stream::ByteReader;
use crate::template::{DataTemplate, TemplateEntry, TemplateKind, interpret_option_fields};
use crate::variable_versions::{DatagramCtx, process_data_records, process_option_data};
use crate::{Collector, DecodeError};

use log::debug;
use nom_derive::*;
use serde::Serialize;

use std::net::IpAddr;

const TEMPLATE_FLOWSET_ID: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET_ID: u16 = 1;
const FLOWSET_MIN_DATA_ID: u16 = 256;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct Header {
    /// The version of NetFlow records exported in this packet; for Version 9,
    /// this value is 9
    pub version: u16,
    /// Number of FlowSet records (both template and data) contained within
    /// this packet
    pub count: u16,
    /// Time in milliseconds since this device was first booted
    pub sys_up_time: u32,
    /// Seconds since 0000 Coordinated Universal Time (UTC) 1970
    pub unix_secs: u32,
    /// Incremental sequence counter of all export packets sent by this export
    /// device; this value is cumulative, and it can be used to identify
    /// whether any export packets have been missed
    pub sequence_number: u32,
    /// A 32-bit value that is used to guarantee uniqueness for all flows
    /// exported from a particular device
    pub source_id: u32,
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
        context: "v9 header".to_string(),
    })?;

    let cache_size = collector.template_cache_size;
    let ttl = collector.template_ttl.clone();
    let stat = &mut collector.stat;
    let exporter = collector
        .exporters
        .get_or_create(source, 9, header.source_id, cache_size, ttl);
    exporter.packets += 1;

    // v9 sequence numbers count export datagrams
    let expected = exporter.last_sequence.wrapping_add(1);
    if !track_sequence(exporter, header.sequence_number, expected) {
        debug!(
            "v9: sequence failure, expected {}, got {}",
            expected, header.sequence_number
        );
        stat.sequence_failures += 1;
    }

    let ctx = DatagramCtx {
        nf_version: 9,
        sysid: exporter.sysid,
        received_ms,
        boot_ms: (u64::from(header.unix_secs) * 1000).saturating_sub(u64::from(header.sys_up_time)),
        sys_uptime: header.sys_up_time,
    };

    // first pass: templates, so data flowsets of this datagram can use them
    let mut data_flowsets: Vec<(u16, &[u8])> = Vec::new();
    let mut r = ByteReader::new(rest);
    while r.available() >= 4 {
        let flowset_id = r.get_u16();
        let length = r.get_u16() as usize;
        if !r.ok() || length < 4 || length - 4 > r.available() {
            debug!("v9: short flowset, id {}, length {}", flowset_id, length);
            break;
        }
        let payload = r.get_slice(length - 4);
        match flowset_id {
            TEMPLATE_FLOWSET_ID => parse_templates(exporter, payload),
            OPTIONS_TEMPLATE_FLOWSET_ID => parse_option_templates(exporter, payload),
            id if id >= FLOWSET_MIN_DATA_ID => data_flowsets.push((id, payload)),
            _ => debug!("v9: reserved flowset id {} skipped", flowset_id),
        }
    }

    let mut emitted = 0u32;
    for (flowset_id, payload) in data_flowsets {
        emitted += process_data_flowset(exporter, flowset_id, payload, &ctx, stat, block, writer);
    }

    Ok(emitted)
}

/// Parses the template records of a template flowset and compiles each into
/// a sequencer.
fn parse_templates(exporter: &mut Exporter, payload: &[u8]) {
    let mut r = ByteReader::new(payload);
    while r.available() >= 4 {
        let template_id = r.get_u16();
        let field_count = r.get_u16() as usize;
        if !r.ok() || field_count == 0 {
            break; // padding
        }
        if r.available() < field_count * 4 {
            exporter.padding_errors += 1;
            break;
        }
        let mut table = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let field_type = r.get_u16();
            let field_length = r.get_u16();
            table.push(fields::lookup(field_type, field_length));
        }
        if template_id < FLOWSET_MIN_DATA_ID {
            debug!("v9: reserved template id {} ignored", template_id);
            continue;
        }
        let sequencer = Sequencer::compile(template_id, &table);
        debug!(
            "v9: template {} with {} fields, {} extensions",
            template_id,
            field_count,
            sequencer.num_elements
        );
        exporter
            .templates
            .insert(template_id, TemplateKind::Data(DataTemplate { sequencer }));
    }
}

/// Parses a v9 option template flowset: scope and option lengths are given
/// in bytes.
fn parse_option_templates(exporter: &mut Exporter, payload: &[u8]) {
    let mut r = ByteReader::new(payload);
    while r.available() >= 6 {
        let template_id = r.get_u16();
        let scope_len = r.get_u16() as usize;
        let option_len = r.get_u16() as usize;
        if !r.ok() || template_id < FLOWSET_MIN_DATA_ID {
            break; // padding
        }
        if scope_len % 4 != 0 || option_len % 4 != 0 {
            exporter.padding_errors += 1;
            break;
        }
        if r.available() < scope_len + option_len {
            exporter.padding_errors += 1;
            break;
        }
        let mut scope = Vec::with_capacity(scope_len / 4);
        for _ in 0..scope_len / 4 {
            scope.push((r.get_u16(), r.get_u16()));
        }
        let mut options = Vec::with_capacity(option_len / 4);
        for _ in 0..option_len / 4 {
            options.push((r.get_u16(), r.get_u16()));
        }
        let tpl = interpret_option_fields(&scope, &options);
        debug!(
            "v9: option template {}, flags 0x{:x}, record size {}",
            template_id, tpl.flags, tpl.record_size
        );
        exporter
            .templates
            .insert(template_id, TemplateKind::Options(tpl));
    }
}

fn process_data_flowset(
    exporter: &mut Exporter,
    flowset_id: u16,
    payload: &[u8],
    ctx: &DatagramCtx,
    stat: &mut StatRecord,
    block: &mut DataBlock,
    writer: &mut dyn BlockWriter,
) -> u32 {
    if let Some(tpl) = exporter
        .templates
        .lookup(flowset_id)
        .and_then(TemplateEntry::options)
        .copied()
    {
        process_option_data(exporter, &tpl, payload);
        return 0;
    }

    if exporter.templates.lookup(flowset_id).is_none() {
        exporter.missed_templates += 1;
        debug!("v9: missed template {} for data flowset", flowset_id);
        return 0;
    }

    let store = &exporter.templates;
    let Some(sequencer) = crate::sequencer::SubTemplates::sub_sequencer(store, flowset_id) else {
        return 0;
    };
    let emitted = process_data_records(
        sequencer,
        &NoSubTemplates,
        payload,
        ctx,
        stat,
        block,
        writer,
    );
    exporter.flows += u64::from(emitted);
    emitted
}
