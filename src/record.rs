//! V3 record assembly and verification.
//!
//! Records are assembled in place at the tail of a [`DataBlock`]. A
//! [`RecordWriter`] appends the shared header, then element blocks one
//! extension at a time, patching the header's size and element count as it
//! goes. When the block cannot hold the next element the writer reports
//! [`RecordError::BlockFull`]; the caller flushes the block and re-emits the
//! record into a fresh one.
//!
//! On-disk layout (little-endian):
//!
//! ```text
//! record-header : type(u16)=11 size(u16) num-elements(u16) flags(u16)
//!                 nf-version(u8) engine-type(u8) engine-id(u8) reserved(u8)
//!                 exporter-id(u16)
//! element[*]    : type(u16) length(u16) payload[length-4]
//! ```

use crate::extensions::{self, ExtensionValue, MAX_EXTENSIONS};

use serde::Serialize;

/// Record type tag of a v3 flow record.
pub const V3_RECORD: u16 = 11;

/// Byte size of the shared record header.
pub const V3_HEADER_SIZE: usize = 14;

/// Byte size of an element header.
pub const ELEMENT_HEADER_SIZE: usize = 4;

/// Default block buffer capacity handed to the file writer.
pub const BLOCK_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordError {
    /// The block buffer cannot hold the element; flush and retry.
    BlockFull,
    /// Extension id outside the registry.
    BadExtension(u16),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::BlockFull => write!(f, "data block full"),
            RecordError::BadExtension(id) => write!(f, "invalid extension id {}", id),
        }
    }
}

impl std::error::Error for RecordError {}

/// Buffer of serialized v3 records exchanged with the file writer.
#[derive(Debug)]
pub struct DataBlock {
    buf: Vec<u8>,
    capacity: usize,
    pub num_records: u32,
}

impl DataBlock {
    pub fn new(capacity: usize) -> Self {
        DataBlock {
            buf: Vec::with_capacity(capacity.min(4096)),
            capacity,
            num_records: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Drops all records, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.num_records = 0;
    }

    /// Moves the contents out, leaving an empty block of the same capacity.
    pub fn take(&mut self) -> DataBlock {
        let taken = DataBlock {
            buf: std::mem::take(&mut self.buf),
            capacity: self.capacity,
            num_records: self.num_records,
        };
        self.num_records = 0;
        taken
    }
}

impl Default for DataBlock {
    fn default() -> Self {
        DataBlock::new(BLOCK_CAPACITY)
    }
}

/// Receives completed blocks. The file writer (compression, block headers,
/// on-disk framing) lives outside this crate.
pub trait BlockWriter {
    /// Takes the block's contents and leaves it empty for reuse.
    fn flush(&mut self, block: &mut DataBlock);
}

/// Collects flushed blocks in memory. Used by tests and the worker pool glue.
#[derive(Debug, Default)]
pub struct MemBlockWriter {
    pub blocks: Vec<DataBlock>,
}

impl BlockWriter for MemBlockWriter {
    fn flush(&mut self, block: &mut DataBlock) {
        if !block.is_empty() {
            self.blocks.push(block.take());
        }
    }
}

/// Appends one v3 record to a block.
#[derive(Debug)]
pub struct RecordWriter<'a> {
    block: &'a mut DataBlock,
    start: usize,
}

impl<'a> RecordWriter<'a> {
    /// Appends a zeroed record header; fails if even the header does not fit.
    pub fn new(
        block: &'a mut DataBlock,
        nf_version: u8,
        engine_type: u8,
        engine_id: u8,
        exporter_id: u16,
    ) -> Result<Self, RecordError> {
        if block.remaining() < V3_HEADER_SIZE {
            return Err(RecordError::BlockFull);
        }
        let start = block.buf.len();
        block.buf.extend_from_slice(&[0u8; V3_HEADER_SIZE]);
        let h = &mut block.buf[start..];
        h[0..2].copy_from_slice(&V3_RECORD.to_le_bytes());
        h[2..4].copy_from_slice(&(V3_HEADER_SIZE as u16).to_le_bytes());
        h[8] = nf_version;
        h[9] = engine_type;
        h[10] = engine_id;
        h[12..14].copy_from_slice(&exporter_id.to_le_bytes());
        Ok(RecordWriter { block, start })
    }

    /// Current record size, header included.
    #[inline]
    pub fn size(&self) -> u16 {
        u16::from_le_bytes([
            self.block.buf[self.start + 2],
            self.block.buf[self.start + 3],
        ])
    }

    #[inline]
    pub fn num_elements(&self) -> u16 {
        u16::from_le_bytes([
            self.block.buf[self.start + 4],
            self.block.buf[self.start + 5],
        ])
    }

    /// Offset of the record's first byte within the block buffer.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn set_engine(&mut self, engine_type: u8, engine_id: u8) {
        self.block.buf[self.start + 9] = engine_type;
        self.block.buf[self.start + 10] = engine_id;
    }

    fn bump_header(&mut self, element_size: usize) {
        let size = self.size() + element_size as u16;
        let count = self.num_elements() + 1;
        self.block.buf[self.start + 2..self.start + 4].copy_from_slice(&size.to_le_bytes());
        self.block.buf[self.start + 4..self.start + 6].copy_from_slice(&count.to_le_bytes());
    }

    /// Appends a zeroed element block and returns the absolute offset of its
    /// body within the block buffer.
    pub fn push_zeroed(&mut self, ext_id: u16, body_size: usize) -> Result<usize, RecordError> {
        if ext_id == 0 || ext_id >= MAX_EXTENSIONS {
            return Err(RecordError::BadExtension(ext_id));
        }
        let element_size = ELEMENT_HEADER_SIZE + body_size;
        if self.block.remaining() < element_size {
            return Err(RecordError::BlockFull);
        }
        let at = self.block.buf.len();
        self.block.buf.resize(at + element_size, 0);
        let tag = extensions::EXTENSION_TABLE[ext_id as usize].tag;
        self.block.buf[at..at + 2].copy_from_slice(&tag.to_le_bytes());
        self.block.buf[at + 2..at + 4].copy_from_slice(&(element_size as u16).to_le_bytes());
        self.bump_header(element_size);
        Ok(at + ELEMENT_HEADER_SIZE)
    }

    /// Appends a fixed-layout extension.
    pub fn push<E: ExtensionValue>(&mut self, value: &E) -> Result<(), RecordError> {
        let body = self.push_zeroed(E::ID, E::SIZE as usize)?;
        value.encode(&mut self.block.buf[body..body + E::SIZE as usize]);
        Ok(())
    }

    /// Appends a variable-length extension with the given payload.
    pub fn push_var(&mut self, ext_id: u16, payload: &[u8]) -> Result<(), RecordError> {
        let base = extensions::extension_size(ext_id) as usize;
        let body = self.push_zeroed(ext_id, base + payload.len())?;
        self.block.buf[body + base..body + base + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Overwrites bytes inside the record, used for post-processing stacked
    /// values after a sequencer run.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.block.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads bytes back out of the record under construction.
    pub fn bytes_at(&self, offset: usize, len: usize) -> &[u8] {
        &self.block.buf[offset..offset + len]
    }

    /// Completed record as a slice (header included).
    pub fn record_bytes(&self) -> &[u8] {
        &self.block.buf[self.start..]
    }

    /// Commits the record to the block and returns its size.
    pub fn finish(self) -> u16 {
        let size = self.size();
        self.block.num_records += 1;
        size
    }

    /// Discards the record, truncating the block back to where it started.
    pub fn abort(self) {
        self.block.buf.truncate(self.start);
    }
}

/// Builds one record, aborting cleanly if the closure fails.
pub fn write_record<F>(
    block: &mut DataBlock,
    nf_version: u8,
    engine: (u8, u8),
    exporter_id: u16,
    f: F,
) -> Result<u16, RecordError>
where
    F: FnOnce(&mut RecordWriter) -> Result<(), RecordError>,
{
    let mut rec = RecordWriter::new(block, nf_version, engine.0, engine.1, exporter_id)?;
    match f(&mut rec) {
        Ok(()) => Ok(rec.finish()),
        Err(e) => {
            rec.abort();
            Err(e)
        }
    }
}

/// Builds one record; on a full block the block is flushed to the writer and
/// the record re-emitted into the fresh buffer.
pub fn write_record_retry<F>(
    block: &mut DataBlock,
    writer: &mut dyn BlockWriter,
    nf_version: u8,
    engine: (u8, u8),
    exporter_id: u16,
    mut f: F,
) -> Result<u16, RecordError>
where
    F: FnMut(&mut RecordWriter) -> Result<(), RecordError>,
{
    match write_record(block, nf_version, engine, exporter_id, &mut f) {
        Err(RecordError::BlockFull) => {
            writer.flush(block);
            write_record(block, nf_version, engine, exporter_id, &mut f)
        }
        r => r,
    }
}

/// Walks a serialized v3 record and checks its structural invariants: the
/// type tag, the header size bound, per-element length and type bounds, and
/// that the element walk consumes the record exactly.
pub fn verify_v3_record(record: &[u8]) -> bool {
    if record.len() < V3_HEADER_SIZE {
        return false;
    }
    let rtype = u16::from_le_bytes([record[0], record[1]]);
    if rtype != V3_RECORD {
        return false;
    }
    let size = u16::from_le_bytes([record[2], record[3]]) as usize;
    if size < V3_HEADER_SIZE || size > record.len() {
        return false;
    }
    let num_elements = u16::from_le_bytes([record[4], record[5]]);

    let mut rlen = size - V3_HEADER_SIZE;
    let mut at = V3_HEADER_SIZE;
    let mut cnt = 0u16;
    for _ in 0..num_elements {
        if rlen < ELEMENT_HEADER_SIZE {
            return false;
        }
        let etype = u16::from_le_bytes([record[at], record[at + 1]]);
        let elen = u16::from_le_bytes([record[at + 2], record[at + 3]]) as usize;
        if elen == 0 || elen > rlen {
            return false;
        }
        if etype >= MAX_EXTENSIONS {
            return false;
        }
        if elen < ELEMENT_HEADER_SIZE + extensions::extension_size(etype) as usize {
            return false;
        }
        rlen -= elen;
        at += elen;
        cnt += 1;
    }

    rlen == 0 && cnt == num_elements
}

/// Read-side view of a serialized v3 record: element offsets by extension id.
#[derive(Debug)]
pub struct RecordView<'a> {
    record: &'a [u8],
    pub nf_version: u8,
    pub engine_type: u8,
    pub engine_id: u8,
    pub exporter_id: u16,
    bodies: [Option<(usize, usize)>; MAX_EXTENSIONS as usize],
}

impl<'a> RecordView<'a> {
    /// Parses a record previously accepted by [`verify_v3_record`]; returns
    /// `None` for anything malformed.
    pub fn parse(record: &'a [u8]) -> Option<Self> {
        if !verify_v3_record(record) {
            return None;
        }
        let size = u16::from_le_bytes([record[2], record[3]]) as usize;
        let num_elements = u16::from_le_bytes([record[4], record[5]]);
        let mut view = RecordView {
            record,
            nf_version: record[8],
            engine_type: record[9],
            engine_id: record[10],
            exporter_id: u16::from_le_bytes([record[12], record[13]]),
            bodies: [None; MAX_EXTENSIONS as usize],
        };
        let mut at = V3_HEADER_SIZE;
        for _ in 0..num_elements {
            let etype = u16::from_le_bytes([record[at], record[at + 1]]);
            let elen = u16::from_le_bytes([record[at + 2], record[at + 3]]) as usize;
            view.bodies[etype as usize] =
                Some((at + ELEMENT_HEADER_SIZE, elen - ELEMENT_HEADER_SIZE));
            at += elen;
        }
        debug_assert_eq!(at, size);
        Some(view)
    }

    /// Raw body bytes of an extension, if present.
    pub fn raw(&self, ext_id: u16) -> Option<&'a [u8]> {
        let (at, len) = self.bodies[ext_id as usize]?;
        Some(&self.record[at..at + len])
    }

    /// Decoded fixed-layout extension, if present.
    pub fn get<E: ExtensionValue>(&self) -> Option<E> {
        E::decode(self.raw(E::ID)?)
    }

    pub fn has(&self, ext_id: u16) -> bool {
        self.bodies[ext_id as usize].is_some()
    }

    pub fn record_size(&self) -> usize {
        u16::from_le_bytes([self.record[2], self.record[3]]) as usize
    }
}

/// Iterates the records of a block buffer.
pub fn records(block: &DataBlock) -> RecordIter<'_> {
    RecordIter {
        buf: block.as_bytes(),
        at: 0,
    }
}

pub struct RecordIter<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.at + V3_HEADER_SIZE > self.buf.len() {
            return None;
        }
        let size = u16::from_le_bytes([self.buf[self.at + 2], self.buf[self.at + 3]]) as usize;
        if size < V3_HEADER_SIZE || self.at + size > self.buf.len() {
            return None;
        }
        let rec = &self.buf[self.at..self.at + size];
        self.at += size;
        Some(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{ExGenericFlow, ExIpv4Flow};

    fn sample_record(block: &mut DataBlock) -> usize {
        let mut rec = RecordWriter::new(block, 5, 0, 1, 7).unwrap();
        rec.push(&ExGenericFlow {
            proto: 6,
            src_port: 80,
            dst_port: 1234,
            in_packets: 2,
            in_bytes: 120,
            ..Default::default()
        })
        .unwrap();
        rec.push(&ExIpv4Flow {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
        })
        .unwrap();
        let start = rec.start();
        rec.finish();
        start
    }

    #[test]
    fn writer_emits_verifiable_record() {
        let mut block = DataBlock::default();
        let start = sample_record(&mut block);
        let rec = &block.as_bytes()[start..];
        assert!(verify_v3_record(rec));
        assert_eq!(block.num_records, 1);

        let view = RecordView::parse(rec).unwrap();
        assert_eq!(view.nf_version, 5);
        assert_eq!(view.exporter_id, 7);
        let generic: ExGenericFlow = view.get().unwrap();
        assert_eq!(generic.proto, 6);
        assert_eq!(generic.in_bytes, 120);
        let ipv4: ExIpv4Flow = view.get().unwrap();
        assert_eq!(ipv4.dst_addr.octets(), [10, 0, 0, 2]);
    }

    #[test]
    fn record_size_is_exact_sum() {
        let mut block = DataBlock::default();
        let start = sample_record(&mut block);
        let rec = &block.as_bytes()[start..];
        let size = u16::from_le_bytes([rec[2], rec[3]]) as usize;
        assert_eq!(
            size,
            V3_HEADER_SIZE + (4 + 48) + (4 + 8),
            "header.size must be the byte-exact sum of header and elements"
        );
    }

    #[test]
    fn verifier_rejects_truncated_and_corrupt_records() {
        let mut block = DataBlock::default();
        let start = sample_record(&mut block);
        let rec = block.as_bytes()[start..].to_vec();

        assert!(!verify_v3_record(&rec[..V3_HEADER_SIZE - 1]));

        let mut wrong_type = rec.clone();
        wrong_type[0] = 99;
        assert!(!verify_v3_record(&wrong_type));

        let mut bad_count = rec.clone();
        bad_count[4] = 3; // announces one element too many
        assert!(!verify_v3_record(&bad_count));

        let mut bad_elem_type = rec.clone();
        bad_elem_type[V3_HEADER_SIZE] = 0xFF;
        assert!(!verify_v3_record(&bad_elem_type));

        let mut bad_elem_len = rec;
        bad_elem_len[V3_HEADER_SIZE + 2] = 0;
        bad_elem_len[V3_HEADER_SIZE + 3] = 0;
        assert!(!verify_v3_record(&bad_elem_len));
    }

    #[test]
    fn block_full_reported_and_record_retried() {
        let mut block = DataBlock::new(V3_HEADER_SIZE + 20);
        let rec = RecordWriter::new(&mut block, 5, 0, 0, 1);
        let mut rec = rec.unwrap();
        let err = rec.push(&ExGenericFlow::default()).unwrap_err();
        assert_eq!(err, RecordError::BlockFull);
        rec.abort();
        assert!(block.is_empty());
    }

    #[test]
    fn var_extension_length() {
        let mut block = DataBlock::default();
        let mut rec = RecordWriter::new(&mut block, 10, 0, 0, 1).unwrap();
        rec.push_var(crate::extensions::EX_IN_PAYLOAD, b"hello").unwrap();
        let size = rec.finish();
        assert_eq!(size as usize, V3_HEADER_SIZE + 4 + 5);
        let rec = records(&block).next().unwrap();
        assert!(verify_v3_record(rec));
        let view = RecordView::parse(rec).unwrap();
        assert_eq!(view.raw(crate::extensions::EX_IN_PAYLOAD), Some(&b"hello"[..]));
    }
}
