//! Exporter table: per-source state for every observed exporting device.
//!
//! Exporters are created lazily on the first datagram from a
//! `(source address, protocol version, observation domain)` triple and never
//! removed. Each carries its template store, sampler set, announced interface
//! and VRF names, and the error counters of §7.

use crate::template::{TemplateStore, TtlConfig};

use log::info;
use serde::Serialize;

use std::collections::HashMap;
use std::net::IpAddr;

/// Packet sampler announced by an exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sampler {
    /// Selector id; -1 for the legacy standard-sampling announcement.
    pub id: i64,
    pub algorithm: u16,
    pub packet_interval: u32,
    pub space_interval: u32,
}

/// NBAR application description announced via option data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NbarApp {
    pub id: Vec<u8>,
    pub name: String,
    pub desc: String,
}

#[derive(Debug)]
pub struct Exporter {
    pub ip: IpAddr,
    pub version: u16,
    /// Observation domain (IPFIX) or source id (v9); 0 for the fixed
    /// protocols.
    pub obs_id: u32,
    /// Locally assigned exporter id, written into every v3 record header.
    pub sysid: u16,

    pub samplers: Vec<Sampler>,
    pub if_names: HashMap<u32, String>,
    pub vrf_names: HashMap<u32, String>,
    pub nbar_apps: Vec<NbarApp>,
    /// systemInitTimeMilliseconds from option data, when announced.
    pub sysuptime: u64,

    pub packets: u64,
    pub flows: u64,
    pub sequence_failures: u64,
    pub missed_templates: u64,
    pub padding_errors: u64,

    pub(crate) last_sequence: u32,
    pub(crate) seen_sequence: bool,

    /// Upper bound of one emitted record for the fixed-layout decoders.
    pub out_record_size: usize,

    pub templates: TemplateStore,
}

impl Exporter {
    /// Adds or refreshes a sampler by selector id.
    pub fn insert_sampler(&mut self, sampler: Sampler) {
        match self.samplers.iter_mut().find(|s| s.id == sampler.id) {
            Some(existing) => *existing = sampler,
            None => {
                info!(
                    "exporter {}: new sampler id {}, algorithm {}, interval 1:{}",
                    self.ip, sampler.id, sampler.algorithm, sampler.space_interval
                );
                self.samplers.push(sampler);
            }
        }
    }

    pub fn sampler(&self, id: i64) -> Option<&Sampler> {
        self.samplers.iter().find(|s| s.id == id)
    }
}

/// All exporters observed by this collector, keyed by source identity.
#[derive(Debug, Default)]
pub struct ExporterTable {
    exporters: HashMap<(IpAddr, u16, u32), Exporter>,
    next_sysid: u16,
}

impl ExporterTable {
    pub fn new() -> Self {
        ExporterTable::default()
    }

    pub fn get_or_create(
        &mut self,
        ip: IpAddr,
        version: u16,
        obs_id: u32,
        template_cache_size: usize,
        ttl: Option<TtlConfig>,
    ) -> &mut Exporter {
        let next_sysid = &mut self.next_sysid;
        self.exporters
            .entry((ip, version, obs_id))
            .or_insert_with(|| {
                *next_sysid += 1;
                info!(
                    "new exporter: ip {}, version {}, domain {}, sysid {}",
                    ip, version, obs_id, *next_sysid
                );
                Exporter {
                    ip,
                    version,
                    obs_id,
                    sysid: *next_sysid,
                    samplers: Vec::new(),
                    if_names: HashMap::new(),
                    vrf_names: HashMap::new(),
                    nbar_apps: Vec::new(),
                    sysuptime: 0,
                    packets: 0,
                    flows: 0,
                    sequence_failures: 0,
                    missed_templates: 0,
                    padding_errors: 0,
                    last_sequence: 0,
                    seen_sequence: false,
                    out_record_size: 0,
                    templates: TemplateStore::new(template_cache_size, ttl),
                }
            })
    }

    pub fn get(&self, ip: IpAddr, version: u16, obs_id: u32) -> Option<&Exporter> {
        self.exporters.get(&(ip, version, obs_id))
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exporter> {
        self.exporters.values()
    }
}

/// Sequence-number accounting shared by the decoders: checks the observed
/// value against the expectation, counts a failure on mismatch and resyncs.
pub(crate) fn track_sequence(exporter: &mut Exporter, observed: u32, expected: u32) -> bool {
    let in_order = !exporter.seen_sequence || observed == expected;
    if !in_order {
        exporter.sequence_failures += 1;
    }
    exporter.seen_sequence = true;
    exporter.last_sequence = observed;
    in_order
}
