//! Template-driven transcoding of wire records into v3 records.
//!
//! A template compiles into a [`Sequencer`]: an ordered plan where each step
//! either skips wire bytes, recurses into a sub-template, or moves one wire
//! field into an extension block of the output record. Compilation merges
//! adjacent fixed skips, resolves output sizes and publishes the extension
//! list; execution walks the plan over one wire record, carving extension
//! blocks on first touch and converting field endianness and width on the fly.
//!
//! A value stack carries cross-sequence integers (sampler ids, engine ids,
//! sysuptime-relative timestamps) from the wire into the decoder's
//! post-processing.

use crate::extensions::{MAX_EXTENSIONS, extension_size};
use crate::record::{RecordError, RecordWriter};
use crate::stream;

use log::debug;

/// Marks a variable-length wire field or packed element.
pub const VAR_LENGTH: u16 = 0xFFFF;

/// IPFIX subTemplateList structured data type.
pub const SUB_TEMPLATE_LIST: u16 = 292;
/// IPFIX subTemplateMultiList structured data type.
pub const SUB_TEMPLATE_MULTI_LIST: u16 = 293;

/// Sub-template recursion bound.
pub const MAX_NESTING: u32 = 16;

/// Number of value-stack slots.
pub const STACK_SIZE: usize = 16;

pub type ValueStack = [u64; STACK_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Big-endian integer read, width conversion on store.
    Int,
    /// Raw byte copy.
    Bytes,
}

/// One transcoding step of a template, as built by the field mapping.
#[derive(Debug, Clone, Copy)]
pub struct Sequence {
    /// Wire element id; informational except for 292/293.
    pub input_type: u16,
    /// Wire field width, or [`VAR_LENGTH`].
    pub input_length: u16,
    /// Destination extension id; 0 skips the wire bytes.
    pub extension: u16,
    /// Packed width, or [`VAR_LENGTH`]; 0 stacks the value without storing.
    pub output_length: u16,
    /// Byte offset within the extension body.
    pub offset: u16,
    /// Value-stack slot to copy the integer into; 0 for none.
    pub stack_slot: u16,
    pub copy_mode: CopyMode,
}

impl Sequence {
    /// A step that discards `input_length` wire bytes.
    pub fn skip(input_length: u16) -> Self {
        Sequence {
            input_type: 0,
            input_length,
            extension: 0,
            output_length: 0,
            offset: 0,
            stack_slot: 0,
            copy_mode: CopyMode::Bytes,
        }
    }

    /// A step that recurses into an IPFIX structured-data field.
    pub fn sub_template(kind: u16, input_length: u16) -> Self {
        Sequence {
            input_type: kind,
            input_length,
            extension: 0,
            output_length: 0,
            offset: 0,
            stack_slot: 0,
            copy_mode: CopyMode::Bytes,
        }
    }
}

#[derive(Debug, Clone)]
enum SeqOp {
    Skip { input_length: u16 },
    SubTemplate { kind: u16, input_length: u16 },
    Copy(Sequence),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqError {
    /// Malformed input: truncated record, bad sub-template framing or
    /// nesting beyond [`MAX_NESTING`].
    Malformed,
    /// Output block exhausted; flush the block and re-emit the record.
    BufferFull,
}

impl std::fmt::Display for SeqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeqError::Malformed => write!(f, "malformed wire record"),
            SeqError::BufferFull => write!(f, "output block full"),
        }
    }
}

impl std::error::Error for SeqError {}

/// Resolves sibling sequencers for sub-template records. Implemented by the
/// per-exporter template store.
pub trait SubTemplates {
    fn sub_sequencer(&self, template_id: u16) -> Option<&Sequencer>;
}

/// Resolver for decoders without sub-template support (v9, tests).
pub struct NoSubTemplates;

impl SubTemplates for NoSubTemplates {
    fn sub_sequencer(&self, _template_id: u16) -> Option<&Sequencer> {
        None
    }
}

/// Result of one sequencer run over one wire record.
#[derive(Debug)]
pub struct RunOutcome {
    /// Wire bytes consumed, including variable-length prefixes.
    pub consumed: usize,
    /// Absolute block offset and body size of each extension carved during
    /// this run (sub-template runs track their own).
    pub ext_offsets: [Option<(usize, usize)>; MAX_EXTENSIONS as usize],
}

impl RunOutcome {
    fn new() -> Self {
        RunOutcome {
            consumed: 0,
            ext_offsets: [None; MAX_EXTENSIONS as usize],
        }
    }

    /// Block offset of an extension body touched by this run.
    pub fn body_offset(&self, ext_id: u16) -> Option<usize> {
        self.ext_offsets[ext_id as usize].map(|(at, _)| at)
    }
}

/// A compiled template.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    pub template_id: u16,
    ops: Vec<SeqOp>,
    ext_size: [u16; MAX_EXTENSIONS as usize],
    /// Extension ids this template emits, ascending.
    pub extensions: Vec<u16>,
    /// Sum of fixed input widths; 0 when any input field is variable.
    pub in_length: usize,
    /// Element bytes (headers included) of a fully fixed template; 0 when any
    /// output is variable.
    pub out_length: usize,
    pub num_elements: u16,
}

impl Sequencer {
    /// Compiles a sequence table. Adjacent fixed skips are merged, output
    /// widths of variable elements with fixed inputs are pinned, and the
    /// published extension list is computed in ascending id order.
    pub fn compile(template_id: u16, table: &[Sequence]) -> Sequencer {
        let mut ops: Vec<SeqOp> = Vec::with_capacity(table.len());
        for s in table {
            if s.extension == 0 && s.stack_slot == 0 {
                if s.input_type == SUB_TEMPLATE_LIST || s.input_type == SUB_TEMPLATE_MULTI_LIST {
                    ops.push(SeqOp::SubTemplate {
                        kind: s.input_type,
                        input_length: s.input_length,
                    });
                } else if s.input_type == 0 && s.input_length != VAR_LENGTH {
                    // merge runs of anonymous fixed skips into one wide skip
                    if let Some(SeqOp::Skip { input_length }) = ops.last_mut() {
                        if *input_length != VAR_LENGTH {
                            *input_length += s.input_length;
                            continue;
                        }
                    }
                    ops.push(SeqOp::Skip {
                        input_length: s.input_length,
                    });
                } else {
                    ops.push(SeqOp::Skip {
                        input_length: s.input_length,
                    });
                }
            } else {
                ops.push(SeqOp::Copy(*s));
            }
        }

        let mut ext_size = [0u16; MAX_EXTENSIONS as usize];
        let mut present = [false; MAX_EXTENSIONS as usize];
        let mut in_length = 0usize;
        let mut has_var_in = false;
        let mut has_var_out = false;

        for op in &mut ops {
            let input_length = match op {
                SeqOp::Skip { input_length } => *input_length,
                SeqOp::SubTemplate { input_length, .. } => *input_length,
                SeqOp::Copy(s) => s.input_length,
            };
            if input_length == VAR_LENGTH {
                has_var_in = true;
            } else {
                in_length += input_length as usize;
            }

            if let SeqOp::Copy(s) = op {
                let ext = s.extension;
                if ext == 0 || ext >= MAX_EXTENSIONS {
                    continue;
                }
                present[ext as usize] = true;
                if s.output_length == VAR_LENGTH {
                    if s.input_length != VAR_LENGTH {
                        // fixed input pins the packed width
                        s.output_length = s.input_length;
                        ext_size[ext as usize] = extension_size(ext) + s.output_length;
                    } else {
                        ext_size[ext as usize] = extension_size(ext);
                        has_var_out = true;
                    }
                } else {
                    ext_size[ext as usize] = extension_size(ext);
                }
            }
        }

        let mut extensions = Vec::new();
        let mut out_length = 0usize;
        for i in 1..MAX_EXTENSIONS as usize {
            if present[i] {
                extensions.push(i as u16);
                out_length += crate::record::ELEMENT_HEADER_SIZE + ext_size[i] as usize;
            }
        }
        let num_elements = extensions.len() as u16;

        if has_var_in {
            in_length = 0;
            debug!(
                "sequencer {}: variable input fields, {} elements in {} ops",
                template_id,
                num_elements,
                ops.len()
            );
        }
        if has_var_out {
            out_length = 0;
        }

        Sequencer {
            template_id,
            ops,
            ext_size,
            extensions,
            in_length,
            out_length,
            num_elements,
        }
    }

    /// Transcodes one wire record into the record under construction.
    ///
    /// The writer must already hold the v3 header. On success the outcome
    /// reports the wire bytes consumed, which callers use to iterate the
    /// records of a flowset when the template has variable-length fields.
    pub fn run(
        &self,
        subs: &dyn SubTemplates,
        input: &[u8],
        rec: &mut RecordWriter,
        stack: &mut ValueStack,
    ) -> Result<RunOutcome, SeqError> {
        self.run_nested(subs, input, rec, stack, 1)
    }

    fn run_nested(
        &self,
        subs: &dyn SubTemplates,
        input: &[u8],
        rec: &mut RecordWriter,
        stack: &mut ValueStack,
        depth: u32,
    ) -> Result<RunOutcome, SeqError> {
        let mut outcome = RunOutcome::new();
        if input.is_empty() {
            return Ok(outcome);
        }
        if depth > MAX_NESTING {
            debug!("sequencer {}: sub template nested too deeply", self.template_id);
            return Err(SeqError::Malformed);
        }

        let mut cursor = 0usize;
        for op in &self.ops {
            match op {
                SeqOp::Skip { input_length } => {
                    let len = resolve_length(input, &mut cursor, *input_length)?;
                    if cursor + len > input.len() {
                        return Err(SeqError::Malformed);
                    }
                    cursor += len;
                }
                SeqOp::SubTemplate { kind, input_length } => {
                    let len = resolve_length(input, &mut cursor, *input_length)?;
                    if cursor + len > input.len() {
                        return Err(SeqError::Malformed);
                    }
                    self.process_sub_template(
                        subs,
                        *kind,
                        &input[cursor..cursor + len],
                        rec,
                        stack,
                        depth,
                    )?;
                    cursor += len;
                }
                SeqOp::Copy(s) => {
                    let var_length = s.input_length == VAR_LENGTH;
                    let in_len = resolve_length(input, &mut cursor, s.input_length)?;
                    if cursor + in_len > input.len() {
                        debug!(
                            "sequencer {}: read beyond input, cursor {} + {} > {}",
                            self.template_id,
                            cursor,
                            in_len,
                            input.len()
                        );
                        return Err(SeqError::Malformed);
                    }

                    let ext = s.extension;
                    let out_len = if s.output_length == VAR_LENGTH {
                        in_len
                    } else {
                        s.output_length as usize
                    };

                    // carve the element on first touch within this run
                    if ext != 0 && outcome.ext_offsets[ext as usize].is_none() {
                        let body_size = if s.output_length == VAR_LENGTH {
                            self.ext_size[ext as usize] as usize + in_len
                        } else {
                            self.ext_size[ext as usize] as usize
                        };
                        let body = rec.push_zeroed(ext, body_size).map_err(|e| match e {
                            RecordError::BlockFull => SeqError::BufferFull,
                            RecordError::BadExtension(_) => SeqError::Malformed,
                        })?;
                        outcome.ext_offsets[ext as usize] = Some((body, body_size));
                    }

                    // zero-width field: placeholder element only
                    if in_len == 0 {
                        continue;
                    }

                    let src = &input[cursor..cursor + in_len];
                    let int_width = matches!(in_len, 1..=8 | 16);
                    if var_length || s.copy_mode == CopyMode::Bytes || !int_width {
                        if let Some((body, size)) = outcome.ext_offsets[ext as usize] {
                            let at = s.offset as usize;
                            let n = in_len.min(out_len).min(size.saturating_sub(at));
                            rec.write_at(body + at, &src[..n]);
                        }
                    } else {
                        let value: u128 = if in_len == 16 {
                            let mut b = [0u8; 16];
                            b.copy_from_slice(src);
                            u128::from_be_bytes(b)
                        } else {
                            u128::from(stream::be_uint(src))
                        };
                        if s.stack_slot != 0 && (s.stack_slot as usize) < STACK_SIZE {
                            stack[s.stack_slot as usize] = value as u64;
                        }
                        // out_len 0 stacks the value without storing it
                        if out_len > 0 {
                            if let Some((body, size)) = outcome.ext_offsets[ext as usize] {
                                let bytes = value.to_le_bytes();
                                let at = s.offset as usize;
                                let n = out_len.min(16).min(size.saturating_sub(at));
                                rec.write_at(body + at, &bytes[..n]);
                            }
                        }
                    }
                    cursor += in_len;
                }
            }
        }

        outcome.consumed = cursor;
        Ok(outcome)
    }

    fn process_sub_template(
        &self,
        subs: &dyn SubTemplates,
        kind: u16,
        data: &[u8],
        rec: &mut RecordWriter,
        stack: &mut ValueStack,
        depth: u32,
    ) -> Result<(), SeqError> {
        if data.is_empty() {
            return Err(SeqError::Malformed);
        }
        // one semantic byte precedes the list content
        let mut buf = &data[1..];

        if kind == SUB_TEMPLATE_MULTI_LIST {
            while buf.len() > 4 {
                let sub_id = u16::from_be_bytes([buf[0], buf[1]]);
                let sub_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                // sub_len covers its 4-byte header plus the payload
                if sub_len < 4 || sub_len > buf.len() {
                    return Err(SeqError::Malformed);
                }
                match subs.sub_sequencer(sub_id) {
                    Some(sub) => {
                        run_sub_records(sub, subs, &buf[4..sub_len], rec, stack, depth)?;
                    }
                    None => debug!("no sub sequencer for id {}", sub_id),
                }
                buf = &buf[sub_len..];
            }
        } else if kind == SUB_TEMPLATE_LIST {
            if buf.len() < 2 {
                return Err(SeqError::Malformed);
            }
            let sub_id = u16::from_be_bytes([buf[0], buf[1]]);
            match subs.sub_sequencer(sub_id) {
                Some(sub) => run_sub_records(sub, subs, &buf[2..], rec, stack, depth)?,
                None => debug!("no sub sequencer for id {}", sub_id),
            }
        } else {
            debug!("skipped unknown sub template type {}", kind);
        }

        Ok(())
    }
}

/// Runs a sub-template sequencer over each record packed into `data`.
fn run_sub_records(
    sub: &Sequencer,
    subs: &dyn SubTemplates,
    data: &[u8],
    rec: &mut RecordWriter,
    stack: &mut ValueStack,
    depth: u32,
) -> Result<(), SeqError> {
    let mut remaining = data;
    while !remaining.is_empty() {
        let outcome = sub.run_nested(subs, remaining, rec, stack, depth + 1)?;
        if outcome.consumed == 0 {
            break;
        }
        remaining = &remaining[outcome.consumed..];
    }
    Ok(())
}

/// Resolves a field length, consuming the 1- or 3-byte prefix of a
/// variable-length field.
fn resolve_length(input: &[u8], cursor: &mut usize, declared: u16) -> Result<usize, SeqError> {
    if declared != VAR_LENGTH {
        return Ok(declared as usize);
    }
    if *cursor >= input.len() {
        return Err(SeqError::Malformed);
    }
    let first = input[*cursor];
    if first < 255 {
        *cursor += 1;
        Ok(first as usize)
    } else {
        if *cursor + 3 > input.len() {
            return Err(SeqError::Malformed);
        }
        let len = u16::from_be_bytes([input[*cursor + 1], input[*cursor + 2]]) as usize;
        *cursor += 3;
        Ok(len)
    }
}
