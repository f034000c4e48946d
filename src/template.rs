//! Per-exporter template store and option-template interpretation.
//!
//! Templates live in a capacity-bounded LRU cache keyed by template id. A
//! re-announced template replaces its predecessor and refreshes its update
//! time; [`TemplateStore::age`] drops templates that have not been refreshed
//! within the configured TTL.

use crate::sequencer::{Sequencer, SubTemplates};
use crate::stream::ByteReader;

use log::debug;
use lru::LruCache;

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Default number of templates kept per exporter.
pub const DEFAULT_TEMPLATE_CACHE_SIZE: usize = 1000;

/// How long an unrefreshed template stays decodable.
#[derive(Debug, Clone)]
pub struct TtlConfig {
    pub duration: Duration,
}

impl TtlConfig {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Default for TtlConfig {
    /// Default TTL: 2 hours.
    fn default() -> Self {
        Self::new(Duration::from_secs(2 * 60 * 60))
    }
}

/// Option template flag bits, one per recognized tag set.
pub mod opt_flags {
    pub const STDSAMPLING34: u32 = 1;
    pub const STDSAMPLING35: u32 = 2;
    pub const STDMASK: u32 = 0x3;
    pub const SAMPLER302: u32 = 4;
    pub const SAMPLER304: u32 = 8;
    pub const SAMPLER305: u32 = 16;
    pub const SAMPLER306: u32 = 32;
    pub const SAMPLERMASK: u32 = 0x3C;
    pub const NBAR: u32 = 64;
    pub const IFNAME: u32 = 128;
    pub const VRFNAME: u32 = 256;
    pub const SYSUPTIME: u32 = 512;
}

/// Where inside a raw option-data record a tagged value sits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionTag {
    pub offset: u16,
    pub length: u16,
}

impl OptionTag {
    #[inline]
    pub fn is_set(&self) -> bool {
        self.length > 0
    }

    /// Big-endian integer value of the tag within an option-data record.
    pub fn read(&self, record: &[u8]) -> Option<u64> {
        if !self.is_set() || self.length > 8 {
            return None;
        }
        let end = self.offset as usize + self.length as usize;
        if end > record.len() {
            return None;
        }
        let mut r = ByteReader::new(&record[self.offset as usize..end]);
        let v = r.get_uint(self.length as usize);
        r.ok().then_some(v)
    }

    /// NUL-trimmed string value of the tag within an option-data record.
    pub fn read_string(&self, record: &[u8]) -> Option<String> {
        if !self.is_set() {
            return None;
        }
        let end = self.offset as usize + self.length as usize;
        if end > record.len() {
            return None;
        }
        let raw = &record[self.offset as usize..end];
        let trimmed = raw.split(|&b| b == 0).next().unwrap_or(raw);
        Some(String::from_utf8_lossy(trimmed).to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerOption {
    pub id: OptionTag,
    pub algorithm: OptionTag,
    pub packet_interval: OptionTag,
    pub space_interval: OptionTag,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NbarOption {
    pub scope_size: u16,
    pub id: OptionTag,
    pub name: OptionTag,
    pub desc: OptionTag,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NameOption {
    pub scope_size: u16,
    pub ingress: OptionTag,
    pub name: OptionTag,
}

/// Interpreted option template: which metadata sets the exporter announces
/// and where their values sit inside each option-data record.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionsTemplate {
    pub flags: u32,
    /// Bytes of one option-data record (scope and data fields).
    pub record_size: u16,
    pub sampler: SamplerOption,
    pub nbar: NbarOption,
    pub ifname: NameOption,
    pub vrfname: NameOption,
    pub sysup: OptionTag,
}

/// Walks the scope and data fields of an announced option template and
/// records the tag offsets of the sets this collector understands.
pub fn interpret_option_fields(
    scope_fields: &[(u16, u16)],
    option_fields: &[(u16, u16)],
) -> OptionsTemplate {
    let mut tpl = OptionsTemplate::default();
    let scope_size: u32 = scope_fields.iter().map(|&(_, l)| u32::from(l)).sum();
    tpl.nbar.scope_size = scope_size as u16;
    tpl.ifname.scope_size = scope_size as u16;
    tpl.vrfname.scope_size = scope_size as u16;

    let mut offset: u32 = 0;
    for &(tag, length) in scope_fields.iter().chain(option_fields.iter()) {
        let t = OptionTag {
            offset: offset as u16,
            length,
        };
        match tag {
            // sampler, current and legacy tag numbers
            48 | 302 => {
                tpl.sampler.id = t;
                tpl.flags |= opt_flags::SAMPLER302;
            }
            49 | 304 => {
                tpl.sampler.algorithm = t;
                tpl.flags |= opt_flags::SAMPLER304;
            }
            35 => {
                tpl.sampler.algorithm = t;
                tpl.flags |= opt_flags::STDSAMPLING35;
            }
            305 => {
                tpl.sampler.packet_interval = t;
                tpl.flags |= opt_flags::SAMPLER305;
            }
            50 | 306 => {
                tpl.sampler.space_interval = t;
                tpl.flags |= opt_flags::SAMPLER306;
            }
            34 => {
                tpl.sampler.space_interval = t;
                tpl.flags |= opt_flags::STDSAMPLING34;
            }
            // NBAR application descriptions
            95 => tpl.nbar.id = t,
            96 => tpl.nbar.name = t,
            94 => tpl.nbar.desc = t,
            // interface and VRF names
            10 => tpl.ifname.ingress = t,
            82 => tpl.ifname.name = t,
            234 => tpl.vrfname.ingress = t,
            236 => tpl.vrfname.name = t,
            // system init time
            160 => {
                tpl.sysup = t;
                tpl.flags |= opt_flags::SYSUPTIME;
            }
            _ => {}
        }
        offset += u32::from(length);
    }
    tpl.record_size = offset as u16;

    if tpl.nbar.id.is_set() && tpl.nbar.name.is_set() && tpl.nbar.desc.is_set() {
        tpl.flags |= opt_flags::NBAR;
    }
    if tpl.ifname.ingress.is_set() && tpl.ifname.name.is_set() {
        tpl.flags |= opt_flags::IFNAME;
    }
    if tpl.vrfname.ingress.is_set() && tpl.vrfname.name.is_set() {
        tpl.flags |= opt_flags::VRFNAME;
    }

    tpl
}

#[derive(Debug, Clone)]
pub enum TemplateKind {
    Data(DataTemplate),
    Options(OptionsTemplate),
}

#[derive(Debug, Clone)]
pub struct DataTemplate {
    pub sequencer: Sequencer,
}

#[derive(Debug, Clone)]
pub struct TemplateEntry {
    pub kind: TemplateKind,
    pub updated: Instant,
}

impl TemplateEntry {
    pub fn data(&self) -> Option<&DataTemplate> {
        match &self.kind {
            TemplateKind::Data(t) => Some(t),
            TemplateKind::Options(_) => None,
        }
    }

    pub fn options(&self) -> Option<&OptionsTemplate> {
        match &self.kind {
            TemplateKind::Data(_) => None,
            TemplateKind::Options(t) => Some(t),
        }
    }
}

/// Per-exporter template set.
#[derive(Debug)]
pub struct TemplateStore {
    cache: LruCache<u16, TemplateEntry>,
    ttl: Option<TtlConfig>,
}

impl TemplateStore {
    pub fn new(capacity: usize, ttl: Option<TtlConfig>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        TemplateStore {
            cache: LruCache::new(capacity),
            ttl,
        }
    }

    /// Creates or replaces a template, refreshing its update time.
    pub fn insert(&mut self, id: u16, kind: TemplateKind) {
        if self.cache.contains(&id) {
            debug!("template {} refreshed", id);
        }
        self.cache.put(
            id,
            TemplateEntry {
                kind,
                updated: Instant::now(),
            },
        );
    }

    pub fn lookup(&mut self, id: u16) -> Option<&TemplateEntry> {
        if let Some(ttl) = &self.ttl {
            if self
                .cache
                .peek(&id)
                .is_some_and(|e| e.updated.elapsed() >= ttl.duration)
            {
                self.cache.pop(&id);
                debug!("template {} expired", id);
                return None;
            }
        }
        self.cache.get(&id)
    }

    /// Drops every template that outlived the TTL. Returns how many were
    /// removed.
    pub fn age(&mut self) -> usize {
        let Some(ttl) = self.ttl.clone() else {
            return 0;
        };
        let expired: Vec<u16> = self
            .cache
            .iter()
            .filter(|(_, e)| e.updated.elapsed() >= ttl.duration)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.cache.pop(id);
        }
        expired.len()
    }

    pub fn remove(&mut self, id: u16) -> bool {
        self.cache.pop(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.cache.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }
}

impl SubTemplates for TemplateStore {
    /// Sibling lookup for sub-template records; does not touch LRU order.
    fn sub_sequencer(&self, template_id: u16) -> Option<&Sequencer> {
        match self.cache.peek(&template_id)?.kind {
            TemplateKind::Data(ref t) => Some(&t.sequencer),
            TemplateKind::Options(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;
    use crate::sequencer::Sequence;

    fn data_template(id: u16, table: &[Sequence]) -> TemplateKind {
        TemplateKind::Data(DataTemplate {
            sequencer: Sequencer::compile(id, table),
        })
    }

    #[test]
    fn insert_replaces_and_refreshes() {
        let mut store = TemplateStore::new(10, None);
        store.insert(256, data_template(256, &[fields::lookup(8, 4)]));
        let first_updated = store.lookup(256).unwrap().updated;
        store.insert(256, data_template(256, &[fields::lookup(12, 4)]));
        let entry = store.lookup(256).unwrap();
        assert!(entry.updated >= first_updated);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ttl_expiry_removes_templates() {
        let mut store = TemplateStore::new(10, Some(TtlConfig::new(Duration::from_millis(0))));
        store.insert(256, data_template(256, &[fields::lookup(8, 4)]));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.lookup(256).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn age_sweeps_stale_templates() {
        let mut store = TemplateStore::new(10, Some(TtlConfig::new(Duration::from_millis(0))));
        store.insert(256, data_template(256, &[fields::lookup(8, 4)]));
        store.insert(257, data_template(257, &[fields::lookup(12, 4)]));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.age(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn lru_capacity_evicts_oldest() {
        let mut store = TemplateStore::new(2, None);
        store.insert(256, data_template(256, &[fields::lookup(8, 4)]));
        store.insert(257, data_template(257, &[fields::lookup(8, 4)]));
        store.insert(258, data_template(258, &[fields::lookup(8, 4)]));
        assert_eq!(store.len(), 2);
        assert!(store.lookup(256).is_none());
    }

    #[test]
    fn sampler_option_tags() {
        // scope: system(1:4); data: 302(id:4) 304(algorithm:2) 305(packet:4) 306(space:4)
        let tpl = interpret_option_fields(&[(1, 4)], &[(302, 4), (304, 2), (305, 4), (306, 4)]);
        assert_eq!(
            tpl.flags & opt_flags::SAMPLERMASK,
            opt_flags::SAMPLER302 | opt_flags::SAMPLER304 | opt_flags::SAMPLER305 | opt_flags::SAMPLER306
        );
        assert_eq!(tpl.sampler.id, OptionTag { offset: 4, length: 4 });
        assert_eq!(tpl.sampler.space_interval, OptionTag { offset: 14, length: 4 });
        assert_eq!(tpl.record_size, 18);

        let mut record = vec![0u8; 18];
        record[4..8].copy_from_slice(&7u32.to_be_bytes());
        record[14..18].copy_from_slice(&1000u32.to_be_bytes());
        assert_eq!(tpl.sampler.id.read(&record), Some(7));
        assert_eq!(tpl.sampler.space_interval.read(&record), Some(1000));
    }

    #[test]
    fn legacy_sampling_tags_set_std_flags() {
        let tpl = interpret_option_fields(&[], &[(34, 4), (35, 1)]);
        assert_eq!(tpl.flags & opt_flags::STDMASK, opt_flags::STDMASK);
        assert_eq!(tpl.flags & opt_flags::SAMPLERMASK, 0);
    }

    #[test]
    fn ifname_option_requires_both_tags() {
        let partial = interpret_option_fields(&[(10, 4)], &[]);
        assert_eq!(partial.flags & opt_flags::IFNAME, 0);

        let full = interpret_option_fields(&[(10, 4)], &[(82, 32)]);
        assert_ne!(full.flags & opt_flags::IFNAME, 0);
        assert_eq!(full.ifname.scope_size, 4);

        let mut record = vec![0u8; 36];
        record[0..4].copy_from_slice(&9u32.to_be_bytes());
        record[4..8].copy_from_slice(b"eth0");
        assert_eq!(full.ifname.ingress.read(&record), Some(9));
        assert_eq!(full.ifname.name.read_string(&record).unwrap(), "eth0");
    }
}
