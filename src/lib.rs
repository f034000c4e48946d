#![doc = include_str!("../README.md")]

pub mod exporter;
pub mod extensions;
pub mod fields;
pub mod flow_cache;
pub mod ja3;
pub mod pipeline;
pub mod record;
pub mod sequencer;
pub mod stat;
pub mod static_versions;
pub mod stream;
pub mod template;
mod time;
pub mod tls;
pub mod variable_versions;

use exporter::ExporterTable;
use stat::StatRecord;
use template::{DEFAULT_TEMPLATE_CACHE_SIZE, TtlConfig};

use serde::Serialize;

use std::collections::HashSet;
use std::net::IpAddr;

pub use record::{BlockWriter, DataBlock, MemBlockWriter, RecordView, verify_v3_record};

/// Decode failure of a whole datagram. Failures inside a datagram (bad
/// records, unknown templates) are converted to exporter counters instead.
#[derive(Debug, Clone, Serialize)]
pub enum DecodeError {
    /// Not enough bytes for the protocol header or announced records.
    Incomplete {
        /// Number of bytes that were available
        available: usize,
        /// Description of what was being parsed
        context: String,
    },
    /// The version field matches no supported NetFlow version.
    UnsupportedVersion { version: u16 },
    /// Version is valid but excluded by the `allowed_versions` configuration.
    FilteredVersion { version: u16 },
    /// Structurally invalid datagram.
    Malformed { context: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete { available, context } => {
                write!(f, "incomplete data: {} ({} bytes available)", context, available)
            }
            DecodeError::UnsupportedVersion { version } => {
                write!(f, "unsupported NetFlow version {}", version)
            }
            DecodeError::FilteredVersion { version } => {
                write!(f, "NetFlow version {} filtered by configuration", version)
            }
            DecodeError::Malformed { context } => write!(f, "malformed datagram: {}", context),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Outcome of one decoded datagram.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DecodeSummary {
    pub version: u16,
    /// Flow records emitted into the block.
    pub records: u32,
}

/// Flow-record decoding and normalization engine.
///
/// One collector serves any number of exporters: state is keyed by source
/// identity, so datagrams from different routers never share templates. Use
/// [`Collector::builder`] to configure cache sizes, template TTL and version
/// filtering.
///
/// # Examples
///
/// ```rust
/// use netflow_collector::{Collector, DataBlock, MemBlockWriter};
/// use netflow_collector::template::TtlConfig;
/// use std::time::Duration;
///
/// let mut collector = Collector::builder()
///     .with_cache_size(2000)
///     .with_template_ttl(TtlConfig::new(Duration::from_secs(7200)))
///     .build()
///     .expect("collector config");
///
/// let mut block = DataBlock::default();
/// let mut writer = MemBlockWriter::default();
/// let source = "192.0.2.1".parse().unwrap();
/// let result = collector.process_datagram(source, 0, &[], &mut block, &mut writer);
/// assert!(result.is_err()); // an empty datagram has no version header
/// ```
#[derive(Debug)]
pub struct Collector {
    pub exporters: ExporterTable,
    pub stat: StatRecord,
    pub allowed_versions: HashSet<u16>,
    pub template_cache_size: usize,
    pub template_ttl: Option<TtlConfig>,
}

impl Default for Collector {
    fn default() -> Self {
        Collector {
            exporters: ExporterTable::new(),
            stat: StatRecord::default(),
            allowed_versions: [1, 5, 7, 9, 10].into(),
            template_cache_size: DEFAULT_TEMPLATE_CACHE_SIZE,
            template_ttl: None,
        }
    }
}

impl Collector {
    pub fn builder() -> CollectorBuilder {
        CollectorBuilder::default()
    }

    /// Decodes one datagram from `source`, appending v3 records to `block`.
    ///
    /// `received_ms` is the arrival time in epoch milliseconds, stamped into
    /// every emitted record. When the block fills up it is handed to
    /// `writer` and the pending record re-emitted into the fresh buffer.
    pub fn process_datagram(
        &mut self,
        source: IpAddr,
        received_ms: u64,
        datagram: &[u8],
        block: &mut DataBlock,
        writer: &mut dyn BlockWriter,
    ) -> Result<DecodeSummary, DecodeError> {
        if datagram.len() < 2 {
            return Err(DecodeError::Incomplete {
                available: datagram.len(),
                context: "netflow version header".to_string(),
            });
        }
        let version = u16::from_be_bytes([datagram[0], datagram[1]]);
        if !self.allowed_versions.contains(&version) {
            return Err(if matches!(version, 1 | 5 | 7 | 9 | 10) {
                DecodeError::FilteredVersion { version }
            } else {
                DecodeError::UnsupportedVersion { version }
            });
        }

        let records = match version {
            1 => static_versions::v1::process(self, source, received_ms, datagram, block, writer),
            5 => static_versions::v5::process(self, source, received_ms, datagram, block, writer),
            7 => static_versions::v7::process(self, source, received_ms, datagram, block, writer),
            9 => variable_versions::v9::process(self, source, received_ms, datagram, block, writer),
            10 => {
                variable_versions::ipfix::process(self, source, received_ms, datagram, block, writer)
            }
            _ => Err(DecodeError::UnsupportedVersion { version }),
        }?;

        Ok(DecodeSummary { version, records })
    }

    /// Sweeps expired templates from every exporter. Returns how many
    /// templates were dropped.
    pub fn age_templates(&mut self) -> usize {
        // per-exporter stores own the TTL configuration
        let mut removed = 0;
        let keys: Vec<(IpAddr, u16, u32)> = self
            .exporters
            .iter()
            .map(|e| (e.ip, e.version, e.obs_id))
            .collect();
        for (ip, version, obs_id) in keys {
            let e = self.exporters.get_or_create(
                ip,
                version,
                obs_id,
                self.template_cache_size,
                self.template_ttl.clone(),
            );
            removed += e.templates.age();
        }
        removed
    }
}

/// Builder for configuring and constructing a [`Collector`].
#[derive(Debug, Clone)]
pub struct CollectorBuilder {
    allowed_versions: HashSet<u16>,
    template_cache_size: usize,
    template_ttl: Option<TtlConfig>,
}

impl Default for CollectorBuilder {
    fn default() -> Self {
        CollectorBuilder {
            allowed_versions: [1, 5, 7, 9, 10].into(),
            template_cache_size: DEFAULT_TEMPLATE_CACHE_SIZE,
            template_ttl: None,
        }
    }
}

impl CollectorBuilder {
    /// Sets the per-exporter template cache capacity (must be > 0).
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.template_cache_size = size;
        self
    }

    /// Sets the template refresh TTL; unrefreshed templates expire.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_template_ttl(mut self, ttl: TtlConfig) -> Self {
        self.template_ttl = Some(ttl);
        self
    }

    /// Restricts which NetFlow versions are decoded.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_allowed_versions(mut self, versions: HashSet<u16>) -> Self {
        self.allowed_versions = versions;
        self
    }

    pub fn build(self) -> Result<Collector, String> {
        if self.template_cache_size == 0 {
            return Err("template cache size must be greater than 0".to_string());
        }
        Ok(Collector {
            exporters: ExporterTable::new(),
            stat: StatRecord::default(),
            allowed_versions: self.allowed_versions,
            template_cache_size: self.template_cache_size,
            template_ttl: self.template_ttl,
        })
    }
}
