//! Streaming, transactional encoder.
//!
//! Every public operation is a transaction: it either completes, returns
//! [EncodeError::Overflow] without committing (retry the same operation with
//! the same sink later), or fails hard. Bytes accepted by the sink during a
//! failed attempt are remembered and skipped on the retry, so the emitted
//! stream never contains duplicates regardless of overflow history.

use crate::codec::class::{ClassCollection, ClassId, ClassRef};
use crate::codec::encoding::*;
use crate::codec::enums::{ContextId, FrameKind};
use crate::codec::error::EncodeError;
use crate::codec::sink::Sink;

/// Maximum number of nested containers.
pub const STACK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    ctxid: ContextId,
    /// Children still expected before close, for sized containers; -1 when
    /// the container is variable-sized (or for the top level).
    missing: i64,
    /// Map parity: true when the next child is a key.
    even: bool,
    /// Class being instantiated, for object frames.
    classid: ClassId,
}

impl Frame {
    fn top() -> Frame {
        Frame {
            kind: FrameKind::Top,
            ctxid: ContextId::Global,
            missing: -1,
            even: false,
            classid: 0,
        }
    }
}

/// The streaming serializer, bound to a byte sink.
pub struct Serializer<S> {
    sink: S,
    written: usize,
    acknowledged: usize,
    skipped: usize,
    broken: bool,
    classes: ClassCollection,
    stack: Vec<Frame>,
    acknowledged_len: usize,
}

impl<S: Sink> Serializer<S> {
    pub fn new(sink: S) -> Self {
        let mut s = Serializer {
            sink,
            written: 0,
            acknowledged: 0,
            skipped: 0,
            broken: false,
            classes: ClassCollection::new(),
            stack: Vec::with_capacity(STACK_SIZE),
            acknowledged_len: 1,
        };
        s.reset();
        s
    }

    /// Resets the stream state and drops every registered class.
    pub fn reset(&mut self) {
        self.classes.reset();
        self.written = 0;
        self.acknowledged = 0;
        self.skipped = 0;
        self.broken = false;
        self.stack.clear();
        self.stack.push(Frame::top());
        self.acknowledged_len = 1;
    }

    /// Number of open containers.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// True once a non-retryable error corrupted the stream.
    pub fn broken(&self) -> bool {
        self.broken
    }

    /// Total bytes accepted by the sink.
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Classes known to this stream.
    pub fn classes(&self) -> &ClassCollection {
        &self.classes
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    // ---- transaction machinery ----

    fn top(&self) -> &Frame {
        self.stack.last().expect("stack always holds the top frame")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("stack always holds the top frame")
    }

    /// The context governing the next value: map keys force
    /// UNSIGNED_OR_STRING, object frames walk their class schema.
    fn current_ctx(&self) -> Result<ContextId, EncodeError> {
        let f = self.top();
        if matches!(f.kind, FrameKind::Map | FrameKind::ZMap) && f.even {
            return Ok(ContextId::UnsignedOrString);
        }
        if f.kind == FrameKind::Object {
            let class = self.classes.get(f.classid).ok_or(EncodeError::Internal)?;
            let index = class
                .nfields()
                .checked_sub(f.missing as usize)
                .ok_or(EncodeError::SizeMismatch)?;
            return class
                .fields
                .get(index)
                .map(|field| field.ctxid)
                .ok_or(EncodeError::SizeMismatch);
        }
        Ok(f.ctxid)
    }

    /// Opens a transaction: rolls the stack back to the last commit point,
    /// refuses broken streams and full fixed containers.
    fn start(&mut self) -> Result<(), EncodeError> {
        self.stack.truncate(self.acknowledged_len);
        if self.broken {
            return Err(EncodeError::Broken);
        }
        let f = self.top();
        if matches!(f.kind, FrameKind::List | FrameKind::Map | FrameKind::Object)
            && f.missing == 0
        {
            return Err(EncodeError::SizeMismatch);
        }
        self.skipped = 0;
        Ok(())
    }

    /// Commits: accounts the written value as one child of the top frame.
    fn commit(&mut self) -> Result<(), EncodeError> {
        let f = self.top_mut();
        match f.kind {
            FrameKind::ZMap => {
                f.even = !f.even;
            }
            FrameKind::Map => {
                f.even = !f.even;
                if f.missing == 0 {
                    return Err(EncodeError::SizeMismatch);
                }
                f.missing -= 1;
            }
            FrameKind::List | FrameKind::Object => {
                if f.missing == 0 {
                    return Err(EncodeError::SizeMismatch);
                }
                f.missing -= 1;
            }
            FrameKind::ZList | FrameKind::Chunked | FrameKind::Top => {}
            FrameKind::ClassDef => return Err(EncodeError::Internal),
        }
        self.acknowledged = self.written;
        self.acknowledged_len = self.stack.len();
        Ok(())
    }

    /// Wraps an operation body: commit on success, pass overflow through,
    /// and poison the stream on any other error after partial output.
    fn finish(&mut self, r: Result<(), EncodeError>) -> Result<(), EncodeError> {
        match r {
            Ok(()) => self.commit(),
            Err(EncodeError::Overflow) => Err(EncodeError::Overflow),
            Err(e) => {
                if self.written != self.acknowledged {
                    self.broken = true;
                }
                Err(e)
            }
        }
    }

    // ---- low-level emission ----

    /// Sends bytes to the sink, dropping any prefix that a previous attempt
    /// of the current transaction already delivered.
    fn write_data(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        let mut bytes = bytes;
        let to_skip = self.written - self.acknowledged - self.skipped;
        if to_skip > 0 {
            if to_skip >= bytes.len() {
                self.skipped += bytes.len();
                return Ok(());
            }
            self.skipped += to_skip;
            bytes = &bytes[to_skip..];
        }
        let n = self.sink.write(bytes)?.min(bytes.len());
        self.written += n;
        self.skipped += n;
        if n == bytes.len() {
            Ok(())
        } else {
            Err(EncodeError::Overflow)
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), EncodeError> {
        self.write_data(&[byte])
    }

    /// Writes the low `nbytes` bytes of `x`, most significant first.
    fn write_be(&mut self, x: i64, nbytes: usize) -> Result<(), EncodeError> {
        let mut shift = (nbytes - 1) * 8;
        loop {
            self.write_byte((x >> shift) as u8)?;
            if shift == 0 {
                return Ok(());
            }
            shift -= 8;
        }
    }

    fn encode_integer(&mut self, x: i64, enc: &IntegerEncoding) -> Result<(), EncodeError> {
        // Offset of x beyond the previous (smaller) band.
        fn offset(x: i64, prev_min: i64, prev_max: i64) -> i64 {
            if x < 0 {
                (-x) - (-prev_min + 1)
            } else {
                x - (prev_max + 1)
            }
        }

        if enc.tiny_min <= x && x <= enc.tiny_max {
            self.write_byte((enc.tiny_zero_opcode as i64 + x) as u8)
        } else if enc.small_min <= x && x <= enc.small_max {
            let off = offset(x, enc.tiny_min, enc.tiny_max);
            let base = if x < 0 {
                enc.small_neg_opcode
            } else {
                enc.small_pos_opcode
            };
            self.write_byte(base + (off >> 8) as u8)?;
            self.write_byte(off as u8)
        } else if enc.medium_min <= x && x <= enc.medium_max {
            let off = offset(x, enc.small_min, enc.small_max);
            let base = if x < 0 {
                enc.medium_neg_opcode
            } else {
                enc.medium_pos_opcode
            };
            self.write_byte(base + (off >> 16) as u8)?;
            self.write_byte((off >> 8) as u8)?;
            self.write_byte(off as u8)
        } else if enc.large_min <= x && x <= enc.large_max {
            let off = offset(x, enc.medium_min, enc.medium_max);
            let base = if x < 0 {
                enc.large_neg_opcode
            } else {
                enc.large_pos_opcode
            };
            self.write_byte(base + (off >> 24) as u8)?;
            self.write_byte((off >> 16) as u8)?;
            self.write_byte((off >> 8) as u8)?;
            self.write_byte(off as u8)
        } else if x as i32 as i64 == x {
            self.write_byte(enc.int32_opcode)?;
            self.write_be(x, 4)
        } else {
            self.write_byte(enc.int64_opcode)?;
            self.write_be(x, 8)
        }
    }

    fn encode_unsigned(&mut self, x: u32) -> Result<(), EncodeError> {
        let x = x as i64;
        if x <= UIS_TINY_MAX {
            self.write_byte((x + UIS_TINY_OPCODE as i64) as u8)
        } else if x <= UIS_SMALL_MAX {
            let off = x - (UIS_TINY_MAX + 1);
            self.write_byte(UIS_SMALL_OPCODE + (off >> 8) as u8)?;
            self.write_byte(off as u8)
        } else if x <= UIS_MEDIUM_MAX {
            let off = x - (UIS_SMALL_MAX + 1);
            self.write_byte(UIS_MEDIUM_OPCODE + (off >> 16) as u8)?;
            self.write_byte((off >> 8) as u8)?;
            self.write_byte(off as u8)
        } else if x <= UIS_LARGE_MAX {
            let off = x - (UIS_MEDIUM_MAX + 1);
            self.write_byte(UIS_LARGE_OPCODE + (off >> 24) as u8)?;
            self.write_byte((off >> 16) as u8)?;
            self.write_byte((off >> 8) as u8)?;
            self.write_byte(off as u8)
        } else {
            self.write_byte(UIS_XLARGE_OPCODE)?;
            self.write_be(x, 4)
        }
    }

    fn encode_f32(&mut self, x: f32) -> Result<(), EncodeError> {
        self.write_data(&x.to_be_bytes())
    }

    fn encode_f64(&mut self, x: f64) -> Result<(), EncodeError> {
        self.write_data(&x.to_be_bytes())
    }

    fn encode_chunks(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let mut data = data;
        while data.len() > 0xFFFF {
            self.write_data(&[0xFF, 0xFF])?;
            self.write_data(&data[..0xFFFF])?;
            data = &data[0xFFFF..];
        }
        if !data.is_empty() {
            let len = data.len();
            self.write_data(&[(len >> 8) as u8, len as u8])?;
            self.write_data(data)?;
        }
        Ok(())
    }

    fn encode_string(&mut self, data: &[u8], enc: &StringEncoding) -> Result<(), EncodeError> {
        let len = data.len();
        if len <= enc.small_limit {
            self.write_byte(enc.small_opcode + len as u8)?;
        } else if len <= enc.medium_limit {
            let sent = len - (enc.small_limit + 1);
            self.write_byte(enc.medium_opcode + (sent >> 8) as u8)?;
            self.write_byte(sent as u8)?;
        } else if len <= enc.large_limit {
            let sent = len - (enc.medium_limit + 1);
            self.write_byte(enc.large_opcode)?;
            self.write_byte((sent >> 8) as u8)?;
            self.write_byte(sent as u8)?;
        } else {
            // Longer strings degrade to a chunked sequence; done inline so it
            // stays one transaction.
            self.write_byte(enc.chunked_opcode)?;
            self.encode_chunks(data)?;
            return self.write_data(&[0x00, 0x00]);
        }
        self.write_data(data)
    }

    /// Pushes a frame and emits its prefix opcode, if any.
    fn open_frame(
        &mut self,
        kind: FrameKind,
        ctxid: ContextId,
        prefix: Option<u8>,
    ) -> Result<(), EncodeError> {
        if self.stack.len() == STACK_SIZE {
            return Err(EncodeError::TooDeep);
        }
        self.stack.push(Frame {
            kind,
            ctxid,
            missing: -1,
            even: false,
            classid: 0,
        });
        match prefix {
            Some(op) => self.write_byte(op),
            None => Ok(()),
        }
    }

    fn open_collection(
        &mut self,
        len: Option<usize>,
        ctxid: ContextId,
        enc: &CollectionEncoding,
    ) -> Result<(), EncodeError> {
        let has_type = ctxid != ContextId::Global;
        match len {
            None => {
                let op = if has_type {
                    enc.variable_typed_opcode
                } else {
                    enc.variable_untyped_opcode
                };
                self.open_frame(enc.variable_kind, ctxid, Some(op))?;
            }
            Some(0) => {
                self.open_frame(enc.fixed_kind, ctxid, Some(enc.empty_opcode))?;
            }
            Some(n) if n <= enc.small_limit => {
                let op = if has_type {
                    enc.small_typed_opcode
                } else {
                    enc.small_untyped_opcode
                };
                self.open_frame(enc.fixed_kind, ctxid, Some(op + n as u8 - 1))?;
            }
            Some(n) => {
                let op = if has_type {
                    enc.long_typed_opcode
                } else {
                    enc.long_untyped_opcode
                };
                self.open_frame(enc.fixed_kind, ctxid, Some(op))?;
                self.encode_unsigned((n - (enc.small_limit + 1)) as u32)?;
            }
        }
        if len != Some(0) && has_type {
            self.write_byte(u8::from(ctxid))?;
        }
        Ok(())
    }

    // ---- public operations ----

    /// Serializes an integer in the current context.
    pub fn write_int(&mut self, x: i64) -> Result<(), EncodeError> {
        let enc = match self.current_ctx()? {
            ContextId::Global => &GLOBAL_INTEGER,
            ContextId::Number => &NUMBER_INTEGER,
            ContextId::UnsignedOrString => {
                if x < 0 {
                    return Err(EncodeError::BadContext);
                }
                if x > u32::MAX as i64 {
                    return Err(EncodeError::OutOfBounds);
                }
                self.start()?;
                let r = self.encode_unsigned(x as u32);
                return self.finish(r);
            }
            ContextId::Int32 => {
                let y = x as i32;
                if y as i64 != x {
                    return Err(EncodeError::OutOfBounds);
                }
                self.start()?;
                let r = (|| {
                    self.write_be(y as i64, 4)?;
                    if y == i32::MIN {
                        // Escape the reserved null pattern.
                        self.write_byte(0x01)?;
                    }
                    Ok(())
                })();
                return self.finish(r);
            }
            _ => return Err(EncodeError::BadContext),
        };
        self.start()?;
        let r = self.encode_integer(x, enc);
        self.finish(r)
    }

    /// Serializes a boolean. Only valid in GLOBAL context.
    pub fn write_bool(&mut self, x: bool) -> Result<(), EncodeError> {
        if self.current_ctx()? != ContextId::Global {
            return Err(EncodeError::BadContext);
        }
        self.start()?;
        let r = self.write_byte(if x { GLOBAL_TRUE } else { GLOBAL_FALSE });
        self.finish(r)
    }

    /// Serializes a floating point number.
    ///
    /// In FLOAT/DOUBLE contexts the raw representation is written (with the
    /// escape byte when the value collides with the null pattern). In every
    /// other context, a value exactly representable as an integer downgrades
    /// to [Serializer::write_int] first; only then is the context checked
    /// for float support.
    pub fn write_double(&mut self, x: f64) -> Result<(), EncodeError> {
        match self.current_ctx()? {
            ContextId::Float => {
                let f = x as f32;
                self.start()?;
                let r = (|| {
                    self.encode_f32(f)?;
                    if f.to_bits() == u32::MAX {
                        self.write_byte(0x01)?;
                    }
                    Ok(())
                })();
                return self.finish(r);
            }
            ContextId::Double => {
                self.start()?;
                let r = (|| {
                    self.encode_f64(x)?;
                    if x.to_bits() == u64::MAX {
                        self.write_byte(0x01)?;
                    }
                    Ok(())
                })();
                return self.finish(r);
            }
            _ => {}
        }

        // Exact integers are sent through the (usually denser) integer
        // encodings of the current context.
        if x >= -9_223_372_036_854_775_808.0 && x < 9_223_372_036_854_775_808.0 {
            let y = x as i64;
            if y as f64 == x {
                return self.write_int(y);
            }
        }

        let enc = match self.current_ctx()? {
            ContextId::Global => &GLOBAL_FLOAT,
            ContextId::Number => &NUMBER_FLOAT,
            _ => return Err(EncodeError::BadContext),
        };
        self.start()?;
        let r = (|| {
            if (x as f32) as f64 == x {
                self.write_byte(enc.float32_opcode)?;
                self.encode_f32(x as f32)
            } else {
                self.write_byte(enc.float64_opcode)?;
                self.encode_f64(x)
            }
        })();
        self.finish(r)
    }

    /// Serializes a string (or binary) of arbitrary length. Strings beyond
    /// the large limit are emitted as a chunked sequence.
    pub fn write_string(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let enc = match self.current_ctx()? {
            ContextId::Global => &GLOBAL_STRING,
            ContextId::UnsignedOrString => &UIS_STRING,
            _ => return Err(EncodeError::BadContext),
        };
        self.start()?;
        let r = self.encode_string(data, enc);
        self.finish(r)
    }

    /// Serializes the context-specific null token. Not allowed as a map key
    /// or inside a variable-size list.
    pub fn write_null(&mut self) -> Result<(), EncodeError> {
        let top = self.top();
        if top.kind == FrameKind::ZList {
            return Err(EncodeError::Invalid);
        }
        if matches!(top.kind, FrameKind::Map | FrameKind::ZMap) && top.even {
            return Err(EncodeError::Invalid);
        }
        let token = null_token(self.current_ctx()?);
        self.start()?;
        let r = self.write_data(token);
        self.finish(r)
    }

    /// Injects pre-serialized bytes as one value of the stream.
    ///
    /// The caller is responsible for the bytes forming exactly one value
    /// valid in the current context.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        self.start()?;
        let r = self.write_data(data);
        self.finish(r)
    }

    /// Opens a list of `len` elements (`None` when the count is not known in
    /// advance), whose elements are encoded in context `ctxid`.
    pub fn open_list(&mut self, len: Option<usize>, ctxid: ContextId) -> Result<(), EncodeError> {
        let enc = match self.current_ctx()? {
            ContextId::Global => &GLOBAL_LIST,
            ContextId::ListOrMap => &LISTMAP_LIST,
            _ => return Err(EncodeError::BadContext),
        };
        if !ctxid.is_wire() {
            return Err(EncodeError::BadCtxId);
        }
        self.start()?;
        let r = (|| {
            self.open_collection(len, ctxid, enc)?;
            if let Some(n) = len {
                // One extra: the commit below consumes it.
                self.top_mut().missing = n as i64 + 1;
            }
            Ok(())
        })();
        self.finish(r)
    }

    /// Opens a map of `len` entries (`None` for unknown). Keys are always
    /// encoded in UNSIGNED_OR_STRING context; values in `ctxid`.
    pub fn open_map(&mut self, len: Option<usize>, ctxid: ContextId) -> Result<(), EncodeError> {
        let enc = match self.current_ctx()? {
            ContextId::Global => &GLOBAL_MAP,
            ContextId::ListOrMap => &LISTMAP_MAP,
            _ => return Err(EncodeError::BadContext),
        };
        if !ctxid.is_wire() {
            return Err(EncodeError::BadCtxId);
        }
        self.start()?;
        let r = (|| {
            self.open_collection(len, ctxid, enc)?;
            let f = self.top_mut();
            if let Some(n) = len {
                // Keys and values both count; one extra for the commit.
                f.missing = n as i64 * 2 + 1;
            }
            f.even = false; // flipped to "key expected" by the commit
            Ok(())
        })();
        self.finish(r)
    }

    /// Opens an object of a registered class. GLOBAL context only.
    pub fn open_object(&mut self, classid: ClassId) -> Result<(), EncodeError> {
        if self.current_ctx()? != ContextId::Global {
            return Err(EncodeError::BadContext);
        }
        let nfields = self.classes.get(classid).ok_or(EncodeError::BadClassId)?.nfields();
        let direct = (classid as u32) < OBJECT_SHORT_LIMIT;
        self.start()?;
        let r = (|| {
            let prefix = if direct {
                OBJECT_SHORT_BASE + classid as u8
            } else {
                OBJECT_LONG_OPCODE
            };
            self.open_frame(FrameKind::Object, ContextId::Object, Some(prefix))?;
            if !direct {
                self.encode_unsigned(classid as u32 - OBJECT_SHORT_LIMIT)?;
            }
            let f = self.top_mut();
            f.missing = nfields as i64 + 1; // one extra for the commit
            f.classid = classid;
            Ok(())
        })();
        self.finish(r)
    }

    /// Declares a class.
    ///
    /// When `internal` is false the definition is emitted on the stream
    /// (opcode 0x71 named / 0x72 unnamed) so peers learn it; an internal
    /// class is only registered locally and must be known to the
    /// deserializer by other means. In either case the registry keeps its
    /// own copy, so the caller retains `class` (and can retry on overflow).
    ///
    /// Class definitions do not count as children of the enclosing
    /// container.
    pub fn define_class(&mut self, class: &ClassRef, internal: bool) -> Result<(), EncodeError> {
        let named = class.is_named();
        for field in &class.fields {
            if named && field.name.is_none() {
                return Err(EncodeError::BadField);
            }
            if !field.ctxid.is_wire() {
                return Err(EncodeError::BadField);
            }
        }

        if internal {
            self.classes.set(class.clone());
            return Ok(());
        }

        if self.current_ctx()? != ContextId::Global {
            return Err(EncodeError::BadContext);
        }
        self.start()?;
        let r = (|| {
            self.write_byte(if named {
                CLASSDEF_NAMED_OPCODE
            } else {
                CLASSDEF_UNNAMED_OPCODE
            })?;
            self.encode_unsigned(class.classid as u32)?;
            if let Some(name) = &class.name {
                self.encode_string(name.as_bytes(), &UIS_STRING)?;
            }
            self.encode_unsigned(class.nfields() as u32)?;
            for field in &class.fields {
                if let Some(name) = &field.name {
                    self.encode_string(name.as_bytes(), &UIS_STRING)?;
                }
                self.write_byte(u8::from(field.ctxid))?;
            }
            Ok(())
        })();
        if r.is_ok() {
            self.classes.set(class.clone());
            // The definition must not count as a child: pre-compensate the
            // decrement (or parity flip) the commit is about to apply.
            let f = self.top_mut();
            match f.kind {
                FrameKind::ZMap => f.even = !f.even,
                FrameKind::Map => {
                    f.even = !f.even;
                    f.missing += 1;
                }
                FrameKind::List | FrameKind::Object => f.missing += 1,
                _ => {}
            }
        }
        self.finish(r)
    }

    /// Starts a chunked string; feed it with [Serializer::write_chunk] and
    /// terminate with [Serializer::close].
    pub fn open_chunked(&mut self) -> Result<(), EncodeError> {
        let opcode = match self.current_ctx()? {
            ContextId::Global => GLOBAL_STRING.chunked_opcode,
            ContextId::UnsignedOrString => UIS_STRING.chunked_opcode,
            _ => return Err(EncodeError::BadContext),
        };
        self.start()?;
        let r = self.open_frame(FrameKind::Chunked, ContextId::Chunked, Some(opcode));
        self.finish(r)
    }

    /// Adds data to an open chunked string. Pieces longer than 65535 bytes
    /// are split into multiple wire chunks.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        if self.top().ctxid != ContextId::Chunked {
            return Err(EncodeError::BadContext);
        }
        if data.is_empty() {
            return Err(EncodeError::Invalid);
        }
        self.start()?;
        let r = self.encode_chunks(data);
        self.finish(r)
    }

    /// Closes the innermost open container.
    pub fn close(&mut self) -> Result<(), EncodeError> {
        let frame = *self.top();
        match frame.kind {
            // Sentinel-terminated containers.
            FrameKind::ZMap => {
                self.start()?;
                if !frame.even {
                    return Err(EncodeError::BadMap);
                }
                let token = null_token(ContextId::UnsignedOrString);
                let r = self.write_data(token);
                if let Err(e) = r {
                    return self.finish(Err(e));
                }
            }
            FrameKind::ZList => {
                self.start()?;
                let token = null_token(frame.ctxid);
                let r = self.write_data(token);
                if let Err(e) = r {
                    return self.finish(Err(e));
                }
            }
            // Sized containers carry no terminator.
            FrameKind::Object | FrameKind::List | FrameKind::Map => {
                if frame.missing != 0 {
                    return Err(EncodeError::SizeMismatch);
                }
            }
            FrameKind::Chunked => {
                self.start()?;
                let r = self.write_data(&[0x00, 0x00]);
                if let Err(e) = r {
                    return self.finish(Err(e));
                }
            }
            FrameKind::Top => return Err(EncodeError::NoContainer),
            FrameKind::ClassDef => return Err(EncodeError::Internal),
        }
        self.stack.pop();
        // The closed container counts as one child of its parent.
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::class::{ClassDef, ClassField};
    use crate::codec::sink::{ChokeSink, VecSink};
    use rstest::rstest;

    fn serializer() -> Serializer<VecSink> {
        Serializer::new(VecSink::new())
    }

    fn unnamed_class(id: ClassId, ctxs: &[ContextId]) -> ClassRef {
        ClassRef::Owned(Box::new(ClassDef {
            classid: id,
            name: None,
            fields: ctxs.iter().map(|&c| ClassField::new(None, c)).collect(),
        }))
    }

    #[rstest]
    #[case::zero(0, &[0x9F][..])]
    #[case::tiny_min(-31, &[0x80][..])]
    #[case::tiny_max(64, &[0xDF][..])]
    #[case::small_first(65, &[0xE0, 0x00][..])]
    #[case::small_max(2112, &[0xE7, 0xFF][..])]
    #[case::small_neg(-32, &[0xE8, 0x00][..])]
    #[case::small_neg_min(-2079, &[0xEF, 0xFF][..])]
    #[case::medium_first(2113, &[0xF0, 0x00, 0x00][..])]
    #[case::large_first(264_257, &[0xF8, 0x00, 0x00, 0x00][..])]
    #[case::int32(0x0400_0000, &[0xFC, 0x04, 0x00, 0x00, 0x00][..])]
    #[case::int64(0x1_0000_0000, &[0xFD, 0, 0, 0, 1, 0, 0, 0, 0][..])]
    fn global_integers(#[case] x: i64, #[case] expected: &[u8]) {
        let mut s = serializer();
        s.write_int(x).unwrap();
        assert_eq!(s.sink().bytes(), expected);
    }

    #[rstest]
    #[case::true_(true, 0x01)]
    #[case::false_(false, 0x02)]
    fn global_bools(#[case] x: bool, #[case] expected: u8) {
        let mut s = serializer();
        s.write_bool(x).unwrap();
        assert_eq!(s.sink().bytes(), &[expected]);
    }

    #[test]
    fn global_null() {
        let mut s = serializer();
        s.write_null().unwrap();
        assert_eq!(s.sink().bytes(), &[0x00]);
    }

    #[rstest]
    #[case::empty(b"".as_slice(), &[0x03][..])]
    #[case::one(b"A".as_slice(), &[0x04, 0x41][..])]
    fn global_strings(#[case] data: &[u8], #[case] expected: &[u8]) {
        let mut s = serializer();
        s.write_string(data).unwrap();
        assert_eq!(s.sink().bytes(), expected);
    }

    #[test]
    fn medium_string_header() {
        let mut s = serializer();
        let data = vec![b'x'; 33];
        s.write_string(&data).unwrap();
        // 33 is one past the small limit: opcode 0x24, offset 0.
        assert_eq!(&s.sink().bytes()[..2], &[0x24, 0x00]);
        assert_eq!(s.sink().bytes().len(), 2 + 33);
    }

    #[test]
    fn oversized_string_goes_chunked() {
        let mut s = serializer();
        let data = vec![b'x'; GLOBAL_STRING.large_limit + 1];
        s.write_string(&data).unwrap();
        let out = s.sink().bytes();
        assert_eq!(out[0], 0x29);
        // 64KiB-1 chunk, remainder chunk, then the empty terminator.
        assert_eq!(&out[1..3], &[0xFF, 0xFF]);
        assert_eq!(&out[out.len() - 2..], &[0x00, 0x00]);
    }

    #[test]
    fn empty_and_small_lists() {
        let mut s = serializer();
        s.open_list(Some(0), ContextId::Global).unwrap();
        s.close().unwrap();
        assert_eq!(s.sink().bytes(), &[0x2A]);

        let mut s = serializer();
        s.open_list(Some(3), ContextId::Global).unwrap();
        for x in [1, 2, 3] {
            s.write_int(x).unwrap();
        }
        s.close().unwrap();
        assert_eq!(s.sink().bytes(), &[0x2D, 0xA0, 0xA1, 0xA2]);
    }

    #[test]
    fn typed_list_carries_context_byte() {
        let mut s = serializer();
        s.open_list(Some(2), ContextId::Number).unwrap();
        s.write_int(0).unwrap();
        s.write_int(1).unwrap();
        s.close().unwrap();
        // small typed opcode 0x36+1, context byte, then NUMBER tiny ints.
        assert_eq!(s.sink().bytes(), &[0x37, 0x02, 0x62, 0x63]);
    }

    #[test]
    fn variable_list_closes_with_context_null() {
        let mut s = serializer();
        s.open_list(None, ContextId::Int32).unwrap();
        s.write_int(1).unwrap();
        s.close().unwrap();
        assert_eq!(
            s.sink().bytes(),
            // var typed opcode, ctx byte, raw int32, 5-byte INT32 null.
            &[0x40, 0x03, 0, 0, 0, 1, 0x80, 0, 0, 0, 0]
        );
    }

    #[test]
    fn fixed_list_size_is_enforced() {
        let mut s = serializer();
        s.open_list(Some(1), ContextId::Global).unwrap();
        assert_eq!(s.close(), Err(EncodeError::SizeMismatch));
        s.write_int(1).unwrap();
        assert_eq!(s.write_int(2), Err(EncodeError::SizeMismatch));
        s.close().unwrap();
        assert_eq!(s.close(), Err(EncodeError::NoContainer));
    }

    #[test]
    fn map_keys_use_uis_and_odd_close_is_rejected() {
        let mut s = serializer();
        s.open_map(None, ContextId::Global).unwrap();
        s.write_string(b"k").unwrap();
        assert_eq!(s.close(), Err(EncodeError::BadMap));
        s.write_int(1).unwrap();
        s.close().unwrap();
        // var untyped map, UIS 1-char string "k", tiny int 1, UIS null.
        assert_eq!(s.sink().bytes(), &[0x4C, 0x02, b'k', 0xA0, 0x00]);
    }

    #[test]
    fn null_forbidden_as_map_key_and_in_zlist() {
        let mut s = serializer();
        s.open_map(None, ContextId::Global).unwrap();
        assert_eq!(s.write_null(), Err(EncodeError::Invalid));

        let mut s = serializer();
        s.open_list(None, ContextId::Global).unwrap();
        assert_eq!(s.write_null(), Err(EncodeError::Invalid));
    }

    #[test]
    fn object_short_form_and_field_contexts() {
        let mut s = serializer();
        s.define_class(
            &unnamed_class(5, &[ContextId::Global, ContextId::Global]),
            false,
        )
        .unwrap();
        // Named opcode 0x72, unsigned(5), unsigned(2), two GLOBAL fields.
        assert_eq!(s.sink().bytes(), &[0x72, 0x40, 0x3D, 0x00, 0x00]);

        s.open_object(5).unwrap();
        s.write_int(1).unwrap();
        s.write_int(2).unwrap();
        s.close().unwrap();
        assert_eq!(&s.sink().bytes()[5..], &[0x65, 0xA1, 0xA2]);
    }

    #[test]
    fn object_long_form() {
        let mut s = serializer();
        s.define_class(&unnamed_class(0x20, &[]), true).unwrap();
        s.open_object(0x20).unwrap();
        s.close().unwrap();
        // 0x70, then unsigned(0x20 - 0x10) = tiny 0x3B + 16.
        assert_eq!(s.sink().bytes(), &[0x70, 0x4B]);
    }

    #[test]
    fn object_requires_registered_class() {
        let mut s = serializer();
        assert_eq!(s.open_object(9), Err(EncodeError::BadClassId));
    }

    #[test]
    fn class_definition_does_not_count_as_child() {
        let mut s = serializer();
        s.open_list(Some(1), ContextId::Global).unwrap();
        s.define_class(&unnamed_class(5, &[]), false).unwrap();
        s.write_int(7).unwrap();
        s.close().unwrap();
        assert!(!s.broken());
    }

    #[test]
    fn chunked_string_roundtrip_bytes() {
        let mut s = serializer();
        s.open_chunked().unwrap();
        s.write_chunk(b"ab").unwrap();
        assert_eq!(s.write_chunk(b""), Err(EncodeError::Invalid));
        s.close().unwrap();
        assert_eq!(s.sink().bytes(), &[0x29, 0x00, 0x02, b'a', b'b', 0x00, 0x00]);
    }

    #[test]
    fn double_downgrades_to_int() {
        let mut s = serializer();
        s.write_double(3.0).unwrap();
        assert_eq!(s.sink().bytes(), &[0xA2]);
    }

    #[test]
    fn double_f32_and_f64_forms() {
        let mut s = serializer();
        s.write_double(1.5).unwrap();
        assert_eq!(s.sink().bytes(), &[0xFE, 0x3F, 0xC0, 0x00, 0x00]);

        let mut s = serializer();
        s.write_double(0.1).unwrap();
        let mut expected = vec![0xFF];
        expected.extend_from_slice(&0.1f64.to_be_bytes());
        assert_eq!(s.sink().bytes(), expected.as_slice());
    }

    #[test]
    fn double_downgrade_applies_before_context_check() {
        // In UNSIGNED_OR_STRING context (a map key slot), an exact integer
        // double is accepted through the integer path; a fractional one is
        // rejected only afterwards.
        let mut s = serializer();
        s.open_map(None, ContextId::Global).unwrap();
        s.write_double(2.0).unwrap();
        assert_eq!(*s.sink().bytes().last().unwrap(), 0x3B + 2);
        s.write_int(1).unwrap();
        // Back on a key slot: the fractional value has no integer downgrade
        // and UNSIGNED_OR_STRING has no float encoding.
        assert_eq!(s.write_double(2.5), Err(EncodeError::BadContext));
    }

    #[test]
    fn int32_context_escapes_min_value() {
        let mut s = serializer();
        s.open_list(Some(2), ContextId::Int32).unwrap();
        s.write_int(i32::MIN as i64).unwrap();
        s.write_int(1).unwrap();
        s.close().unwrap();
        assert_eq!(
            &s.sink().bytes()[2..],
            &[0x80, 0, 0, 0, 0x01, 0, 0, 0, 1]
        );
        let mut s = serializer();
        s.open_list(Some(1), ContextId::Int32).unwrap();
        assert_eq!(s.write_int(1 << 40), Err(EncodeError::OutOfBounds));
    }

    #[test]
    fn stack_depth_is_bounded() {
        let mut s = serializer();
        for _ in 0..STACK_SIZE - 1 {
            s.open_list(None, ContextId::Global).unwrap();
        }
        assert_eq!(s.open_list(None, ContextId::Global), Err(EncodeError::TooDeep));
    }

    /// Replaying an overflowed operation against a throttled sink must yield
    /// exactly the bytes a single call against an unbounded sink yields.
    #[rstest]
    #[case::first_byte(0)]
    #[case::mid_opcode(1)]
    #[case::mid_payload(3)]
    fn overflow_replay_is_idempotent(#[case] budget: usize) {
        let mut reference = serializer();
        reference.open_list(Some(2), ContextId::Global).unwrap();
        reference.write_string(b"hello").unwrap();
        reference.write_int(1000).unwrap();
        reference.close().unwrap();
        let expected = reference.sink().bytes().to_vec();

        // Retry each operation until it goes through, refilling one byte of
        // budget per overflow.
        let mut ops: Vec<Box<dyn FnMut(&mut Serializer<ChokeSink>) -> Result<(), EncodeError>>> = vec![
            Box::new(|s| s.open_list(Some(2), ContextId::Global)),
            Box::new(|s| s.write_string(b"hello")),
            Box::new(|s| s.write_int(1000)),
            Box::new(|s| s.close()),
        ];
        let mut s = Serializer::new(ChokeSink::new(budget));
        for op in ops.iter_mut() {
            loop {
                match op(&mut s) {
                    Ok(()) => break,
                    Err(EncodeError::Overflow) => s.sink_mut().refill(1),
                    Err(e) => panic!("unexpected error {e:?}"),
                }
            }
        }
        assert_eq!(s.sink().accepted, expected);
        assert!(!s.broken());
    }

    #[test]
    fn number_context_tiny_range() {
        let mut s = serializer();
        s.open_list(Some(2), ContextId::Number).unwrap();
        s.write_int(97).unwrap();
        s.write_int(-97).unwrap();
        s.close().unwrap();
        assert_eq!(&s.sink().bytes()[2..], &[0x62 + 97, 0x62 - 97]);
    }
}
