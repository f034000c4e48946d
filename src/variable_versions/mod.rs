//! Template-driven protocols (V9 and IPFIX).
//!
//! Both dialects announce templates that bind field identities to byte
//! offsets in subsequent data flowsets. The decoders here walk flowset
//! framing, keep the per-exporter template store current and hand data
//! records to the compiled sequencers. Template flowsets of a datagram are
//! processed before its data flowsets, so a template announced alongside its
//! first data records decodes them immediately.

pub mod ipfix;
pub mod v9;

use crate::exporter::{Exporter, NbarApp, Sampler};
use crate::extensions::{
    EX_CNT_FLOW, EX_GENERIC_FLOW, ExCntFlow, ExGenericFlow, ExSamplerInfo, ExtensionValue,
};
use crate::fields::stack;
use crate::record::{BlockWriter, DataBlock, RecordError, RecordWriter};
use crate::sequencer::{STACK_SIZE, SeqError, Sequencer, SubTemplates};
use crate::stat::StatRecord;
use crate::template::{OptionsTemplate, opt_flags};
use crate::time::uptime_to_msec;

use log::debug;

/// Per-datagram context threaded into record emission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DatagramCtx {
    pub nf_version: u8,
    pub sysid: u16,
    pub received_ms: u64,
    /// Exporter boot time in epoch milliseconds, for sysuptime-relative
    /// timestamps.
    pub boot_ms: u64,
    /// Header sys-uptime for wrap detection; `u32::MAX` disables the
    /// late-export wrap shift when the dialect has no uptime clock.
    pub sys_uptime: u32,
}

/// Decodes every data record of a flowset through the sequencer, emitting one
/// v3 record each. Returns the number of records emitted.
///
/// A full block is flushed and the record re-emitted once; a record larger
/// than an empty block is dropped. Malformed input stops the flowset.
pub(crate) fn process_data_records(
    seq: &Sequencer,
    subs: &dyn SubTemplates,
    payload: &[u8],
    ctx: &DatagramCtx,
    stat: &mut StatRecord,
    block: &mut DataBlock,
    writer: &mut dyn BlockWriter,
) -> u32 {
    let mut emitted = 0u32;
    let mut remaining = payload;

    loop {
        if remaining.is_empty() {
            break;
        }
        // leftover bytes shorter than a record are flowset padding
        if seq.in_length > 0 && remaining.len() < seq.in_length {
            break;
        }
        if seq.in_length == 0 && remaining.len() < 4 {
            break;
        }

        let mut flushed = false;
        let consumed = loop {
            let mut rec = match RecordWriter::new(block, ctx.nf_version, 0, 0, ctx.sysid) {
                Ok(rec) => rec,
                Err(_) if !flushed => {
                    writer.flush(block);
                    flushed = true;
                    continue;
                }
                Err(_) => return emitted,
            };
            let mut stack = [0u64; STACK_SIZE];
            match seq.run(subs, remaining, &mut rec, &mut stack) {
                Ok(outcome) => {
                    if outcome.consumed == 0 {
                        rec.abort();
                        return emitted;
                    }
                    if post_process(&mut rec, &outcome, &stack, ctx).is_err() {
                        rec.abort();
                        if !flushed {
                            writer.flush(block);
                            flushed = true;
                            continue;
                        }
                        return emitted;
                    }
                    let generic = outcome
                        .body_offset(EX_GENERIC_FLOW)
                        .and_then(|off| {
                            ExGenericFlow::decode(
                                rec.bytes_at(off, ExGenericFlow::SIZE as usize),
                            )
                        })
                        .unwrap_or_default();
                    let cnt = outcome.body_offset(EX_CNT_FLOW).and_then(|off| {
                        ExCntFlow::decode(rec.bytes_at(off, ExCntFlow::SIZE as usize))
                    });
                    stat.update(&generic, cnt.as_ref());
                    rec.finish();
                    emitted += 1;
                    break outcome.consumed;
                }
                Err(SeqError::BufferFull) => {
                    rec.abort();
                    if !flushed {
                        writer.flush(block);
                        flushed = true;
                        continue;
                    }
                    return emitted;
                }
                Err(SeqError::Malformed) => {
                    rec.abort();
                    debug!("template {}: malformed data record, flowset skipped", seq.template_id);
                    return emitted;
                }
            }
        };
        remaining = &remaining[consumed..];
    }

    emitted
}

/// Resolves stacked values into the freshly sequenced record: received time,
/// second- and sysuptime-relative timestamps, engine ids and the sampler
/// reference.
fn post_process(
    rec: &mut RecordWriter,
    outcome: &crate::sequencer::RunOutcome,
    stack: &[u64; STACK_SIZE],
    ctx: &DatagramCtx,
) -> Result<(), RecordError> {
    if let Some(off) = outcome.body_offset(EX_GENERIC_FLOW) {
        rec.write_at(
            off + ExGenericFlow::OFS_MSEC_RECEIVED as usize,
            &ctx.received_ms.to_le_bytes(),
        );

        let sec_first = stack[stack::SEC_FIRST as usize];
        let sec_last = stack[stack::SEC_LAST as usize];
        if sec_first != 0 {
            rec.write_at(
                off + ExGenericFlow::OFS_MSEC_FIRST as usize,
                &sec_first.saturating_mul(1000).to_le_bytes(),
            );
        }
        if sec_last != 0 {
            rec.write_at(
                off + ExGenericFlow::OFS_MSEC_LAST as usize,
                &sec_last.saturating_mul(1000).to_le_bytes(),
            );
        }

        let sysup_first = stack[stack::SYSUP_FIRST as usize];
        let sysup_last = stack[stack::SYSUP_LAST as usize];
        if sysup_first != 0 || sysup_last != 0 {
            let (msec_first, msec_last) = uptime_to_msec(
                sysup_first as u32,
                sysup_last as u32,
                ctx.sys_uptime,
                ctx.boot_ms,
            );
            rec.write_at(
                off + ExGenericFlow::OFS_MSEC_FIRST as usize,
                &msec_first.to_le_bytes(),
            );
            rec.write_at(
                off + ExGenericFlow::OFS_MSEC_LAST as usize,
                &msec_last.to_le_bytes(),
            );
        }
    }

    let engine_type = stack[stack::ENGINE_TYPE as usize];
    let engine_id = stack[stack::ENGINE_ID as usize];
    if engine_type != 0 || engine_id != 0 {
        rec.set_engine(engine_type as u8, engine_id as u8);
    }

    let sampler_id = stack[stack::SAMPLER_ID as usize];
    if sampler_id != 0 {
        rec.push(&ExSamplerInfo {
            selector_id: sampler_id,
            sysid: ctx.sysid,
            align: 0,
        })?;
    }

    Ok(())
}

/// Applies one option-data flowset to the exporter: samplers, NBAR
/// application descriptions, interface and VRF names, system init time.
pub(crate) fn process_option_data(exporter: &mut Exporter, tpl: &OptionsTemplate, payload: &[u8]) {
    if tpl.record_size == 0 {
        return;
    }
    for record in payload.chunks(tpl.record_size as usize) {
        if record.len() < tpl.record_size as usize {
            break; // padding tail
        }

        if tpl.flags & opt_flags::SAMPLERMASK != 0 {
            let id = tpl.sampler.id.read(record).unwrap_or(0) as i64;
            let algorithm = tpl.sampler.algorithm.read(record).unwrap_or(0) as u16;
            let packet_interval = tpl.sampler.packet_interval.read(record).unwrap_or(1) as u32;
            let space_interval = tpl.sampler.space_interval.read(record).unwrap_or(0) as u32;
            exporter.insert_sampler(Sampler {
                id,
                algorithm,
                packet_interval,
                space_interval,
            });
        } else if tpl.flags & opt_flags::STDMASK == opt_flags::STDMASK {
            // legacy tags 34/35: one unnamed sampler per exporter
            let algorithm = tpl.sampler.algorithm.read(record).unwrap_or(0) as u16;
            let space_interval = tpl.sampler.space_interval.read(record).unwrap_or(0) as u32;
            if space_interval > 1 {
                exporter.insert_sampler(Sampler {
                    id: -1,
                    algorithm,
                    packet_interval: 1,
                    space_interval,
                });
            }
        }

        if tpl.flags & opt_flags::NBAR != 0 {
            let id_end = tpl.nbar.id.offset as usize + tpl.nbar.id.length as usize;
            if id_end <= record.len() {
                let id = record[tpl.nbar.id.offset as usize..id_end].to_vec();
                let name = tpl.nbar.name.read_string(record).unwrap_or_default();
                let desc = tpl.nbar.desc.read_string(record).unwrap_or_default();
                match exporter.nbar_apps.iter_mut().find(|a| a.id == id) {
                    Some(app) => {
                        app.name = name;
                        app.desc = desc;
                    }
                    None => exporter.nbar_apps.push(NbarApp { id, name, desc }),
                }
            }
        }

        if tpl.flags & opt_flags::IFNAME != 0 {
            if let (Some(index), Some(name)) = (
                tpl.ifname.ingress.read(record),
                tpl.ifname.name.read_string(record),
            ) {
                exporter.if_names.insert(index as u32, name);
            }
        }

        if tpl.flags & opt_flags::VRFNAME != 0 {
            if let (Some(index), Some(name)) = (
                tpl.vrfname.ingress.read(record),
                tpl.vrfname.name.read_string(record),
            ) {
                exporter.vrf_names.insert(index as u32, name);
            }
        }

        if tpl.flags & opt_flags::SYSUPTIME != 0 {
            if let Some(sysup) = tpl.sysup.read(record) {
                exporter.sysuptime = sysup;
            }
        }
    }
}
