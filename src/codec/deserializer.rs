//! Restartable, event-based decoder.
//!
//! Each [Deserializer::read] call yields exactly one event from the input
//! buffer. When the buffer is too short, [DecodeError::Incomplete] carries a
//! lower bound on the bytes the caller should make available before
//! retrying; nothing is consumed in that case, so the same buffer position
//! is simply re-presented with more data. The minimum useful buffer size is
//! [MIN_BUFFER_SIZE] bytes.

use crate::codec::class::{ClassCollection, ClassDef, ClassField, ClassId, ClassRef};
use crate::codec::encoding::*;
use crate::codec::enums::{ContainerKind, ContextId, FrameKind};
use crate::codec::error::DecodeError;

/// Maximum number of nested containers.
pub const STACK_SIZE: usize = 16;

/// With fewer bytes than this available, the reported lower bound may only
/// cover the size probe, leading to a second short read.
pub const MIN_BUFFER_SIZE: usize = 3;

/// One decoded event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'b> {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(&'b [u8]),
    /// Start of a chunked string; chunks follow, then a close event.
    ChunkedString,
    Chunk(&'b [u8]),
    /// Fixed-size list and its declared length.
    List(usize),
    ZList,
    /// Fixed-size map and its declared entry count.
    Map(usize),
    ZMap,
    Object(ClassId),
    /// A class definition was decoded and registered.
    ClassDef(ClassId),
    /// End of a container.
    Close(ContainerKind),
}

/// Where the decoded value sits relative to its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    TopLevel,
    ListItem,
    MapKey,
    MapValue,
    ObjectField,
    Chunk,
    NewContainer,
}

/// Position of an object field; resolve the name (if any) with
/// [Deserializer::field_name].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPos {
    pub classid: ClassId,
    pub index: usize,
}

/// A decoded event together with its position information.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Data<'b> {
    pub value: Value<'b>,
    pub kind: ItemKind,
    /// Set when the value is an object field.
    pub field: Option<FieldPos>,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    ctxid: ContextId,
    /// Children still expected; -1 when variable-sized.
    missing: i64,
    /// Map parity: true when the next child is a key.
    even: bool,
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

enum StringMatch<'b> {
    Value { consumed: usize, data: &'b [u8] },
    ChunkedStart,
}

fn need(buf: &[u8], n: usize) -> Result<(), DecodeError> {
    if buf.len() < n {
        Err(DecodeError::Incomplete(n))
    } else {
        Ok(())
    }
}

/// Shifts an incomplete-input bound by the bytes already accounted for.
fn offset_incomplete(e: DecodeError, base: usize) -> DecodeError {
    match e {
        DecodeError::Incomplete(n) => DecodeError::Incomplete(base + n),
        other => other,
    }
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Decodes an UNSIGNED_OR_STRING unsigned integer. Returns the bytes
/// consumed and the value; any non-integer opcode is invalid here.
fn decode_unsigned(buf: &[u8]) -> Result<(usize, i64), DecodeError> {
    need(buf, 1)?;
    let op = buf[0];
    match op {
        0x3B..=0xC6 => Ok((1, (op - UIS_TINY_OPCODE) as i64)),
        0xC7..=0xE6 => {
            need(buf, 2)?;
            let off = (((op - UIS_SMALL_OPCODE) as i64) << 8) + buf[1] as i64;
            Ok((2, off + UIS_TINY_MAX + 1))
        }
        0xE7..=0xF6 => {
            need(buf, 3)?;
            let off = (((op - UIS_MEDIUM_OPCODE) as i64) << 16)
                + ((buf[1] as i64) << 8)
                + buf[2] as i64;
            Ok((3, off + UIS_SMALL_MAX + 1))
        }
        0xF7..=0xFE => {
            need(buf, 4)?;
            let off = (((op - UIS_LARGE_OPCODE) as i64) << 24)
                + ((buf[1] as i64) << 16)
                + ((buf[2] as i64) << 8)
                + buf[3] as i64;
            Ok((4, off + UIS_MEDIUM_MAX + 1))
        }
        0xFF => {
            need(buf, 5)?;
            Ok((5, be_u32(&buf[1..5]) as i64))
        }
        _ => Err(DecodeError::Invalid),
    }
}

/// Tries the string family of `enc`. `Ok(None)` when the opcode belongs to
/// another family.
fn match_string<'b>(
    buf: &'b [u8],
    enc: &StringEncoding,
) -> Result<Option<StringMatch<'b>>, DecodeError> {
    need(buf, 1)?;
    let op = buf[0];
    if op >= enc.small_opcode && op < enc.medium_opcode {
        let len = (op - enc.small_opcode) as usize;
        need(buf, len + 1)?;
        Ok(Some(StringMatch::Value {
            consumed: len + 1,
            data: &buf[1..1 + len],
        }))
    } else if op >= enc.medium_opcode && op < enc.large_opcode {
        need(buf, 2)?;
        let len = (((op - enc.medium_opcode) as usize) << 8) + buf[1] as usize + enc.small_limit + 1;
        need(buf, len + 2)?;
        Ok(Some(StringMatch::Value {
            consumed: len + 2,
            data: &buf[2..2 + len],
        }))
    } else if op == enc.large_opcode {
        need(buf, 3)?;
        let len = ((buf[1] as usize) << 8) + buf[2] as usize + enc.medium_limit + 1;
        need(buf, len + 3)?;
        Ok(Some(StringMatch::Value {
            consumed: len + 3,
            data: &buf[3..3 + len],
        }))
    } else if op == enc.chunked_opcode {
        Ok(Some(StringMatch::ChunkedStart))
    } else {
        Ok(None)
    }
}

/// Tries the integer family of `enc`.
fn match_integer(buf: &[u8], enc: &IntegerEncoding) -> Result<Option<(usize, i64)>, DecodeError> {
    need(buf, 1)?;
    let op = buf[0] as i64;
    let tz = enc.tiny_zero_opcode as i64;
    let (spos, sneg) = (enc.small_pos_opcode as i64, enc.small_neg_opcode as i64);
    let (mpos, mneg) = (enc.medium_pos_opcode as i64, enc.medium_neg_opcode as i64);
    let (lpos, lneg) = (enc.large_pos_opcode as i64, enc.large_neg_opcode as i64);

    if op >= tz + enc.tiny_min && op <= tz + enc.tiny_max {
        Ok(Some((1, op - tz)))
    } else if op >= spos && op < sneg {
        need(buf, 2)?;
        Ok(Some((2, ((op - spos) << 8) + buf[1] as i64 + enc.tiny_max + 1)))
    } else if op >= sneg && op < mpos {
        need(buf, 2)?;
        Ok(Some((2, -(((op - sneg) << 8) + buf[1] as i64) + enc.tiny_min - 1)))
    } else if op >= mpos && op < mneg {
        need(buf, 3)?;
        let mag = ((op - mpos) << 16) + ((buf[1] as i64) << 8) + buf[2] as i64;
        Ok(Some((3, mag + enc.small_max + 1)))
    } else if op >= mneg && op < lpos {
        need(buf, 3)?;
        let mag = ((op - mneg) << 16) + ((buf[1] as i64) << 8) + buf[2] as i64;
        Ok(Some((3, -mag + enc.small_min - 1)))
    } else if op >= lpos && op < lneg {
        need(buf, 4)?;
        let mag = ((op - lpos) << 24)
            + ((buf[1] as i64) << 16)
            + ((buf[2] as i64) << 8)
            + buf[3] as i64;
        Ok(Some((4, mag + enc.medium_max + 1)))
    } else if op >= lneg && op <= enc.last_large_neg_opcode as i64 {
        need(buf, 4)?;
        let mag = ((op - lneg) << 24)
            + ((buf[1] as i64) << 16)
            + ((buf[2] as i64) << 8)
            + buf[3] as i64;
        Ok(Some((4, -mag + enc.medium_min - 1)))
    } else if op == enc.int32_opcode as i64 {
        need(buf, 5)?;
        Ok(Some((5, be_u32(&buf[1..5]) as i32 as i64)))
    } else if op == enc.int64_opcode as i64 {
        need(buf, 9)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[1..9]);
        Ok(Some((9, i64::from_be_bytes(raw))))
    } else {
        Ok(None)
    }
}

/// The streaming decoder.
#[derive(Debug, Clone)]
pub struct Deserializer {
    read: usize,
    stack: Vec<Frame>,
    classes: ClassCollection,
}

impl Default for Deserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deserializer {
    pub fn new() -> Self {
        Deserializer {
            read: 0,
            stack: vec![Frame::top()],
            classes: ClassCollection::new(),
        }
    }

    /// Resets the stream position and drops every class, including the ones
    /// added with [Deserializer::add_class].
    pub fn reset(&mut self) {
        self.read = 0;
        self.stack.clear();
        self.stack.push(Frame::top());
        self.classes.reset();
    }

    /// Registers a class known out of band (not defined in the stream).
    pub fn add_class(&mut self, class: ClassRef) {
        self.classes.set(class);
    }

    /// Looks up a class decoded from or registered on this stream.
    pub fn class(&self, classid: ClassId) -> Option<&ClassDef> {
        self.classes.get(classid)
    }

    /// Resolves an object field name, when the class carries names.
    pub fn field_name(&self, pos: FieldPos) -> Option<&str> {
        self.classes
            .get(pos.classid)
            .and_then(|c| c.fields.get(pos.index))
            .and_then(|f| f.name.as_deref())
    }

    /// Total bytes consumed since creation or reset.
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    /// Number of open containers.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    // ---- frame helpers ----

    fn top(&self) -> &Frame {
        self.stack.last().expect("stack always holds the top frame")
    }

    fn current_ctx(&self) -> Result<ContextId, DecodeError> {
        let f = self.top();
        if matches!(f.kind, FrameKind::Map | FrameKind::ZMap) && f.even {
            return Ok(ContextId::UnsignedOrString);
        }
        if f.kind == FrameKind::Object {
            let class = self.classes.get(f.classid).ok_or(DecodeError::Internal)?;
            let index = class
                .nfields()
                .checked_sub(f.missing as usize)
                .ok_or(DecodeError::Internal)?;
            return class
                .fields
                .get(index)
                .map(|field| field.ctxid)
                .ok_or(DecodeError::Internal);
        }
        Ok(f.ctxid)
    }

    fn push_frame(
        &mut self,
        kind: FrameKind,
        ctxid: ContextId,
        missing: i64,
    ) -> Result<(), DecodeError> {
        if self.stack.len() == STACK_SIZE {
            return Err(DecodeError::TooDeep);
        }
        let mut f = Frame {
            kind,
            ctxid,
            missing,
            even: false,
            classid: 0,
        };
        if matches!(kind, FrameKind::Map | FrameKind::ZMap) {
            // Both keys and values count as children.
            f.missing *= 2;
            f.even = true;
        }
        self.stack.push(f);
        Ok(())
    }

    fn item_kind_of_top(&self) -> (ItemKind, Option<FieldPos>) {
        let f = self.top();
        match f.kind {
            FrameKind::Top | FrameKind::ClassDef => (ItemKind::TopLevel, None),
            FrameKind::Map | FrameKind::ZMap => {
                if f.even {
                    (ItemKind::MapValue, None)
                } else {
                    (ItemKind::MapKey, None)
                }
            }
            FrameKind::Object => {
                let field = self.classes.get(f.classid).map(|class| FieldPos {
                    classid: f.classid,
                    index: class.nfields().saturating_sub(f.missing as usize + 1),
                });
                (ItemKind::ObjectField, field)
            }
            FrameKind::List | FrameKind::ZList => (ItemKind::ListItem, None),
            FrameKind::Chunked => (ItemKind::Chunk, None),
        }
    }

    /// The null opcode: a plain null value, except that it closes
    /// variable-size containers (maps only from a key slot).
    fn decode_null(&mut self) -> Value<'static> {
        let f = *self.top();
        if f.kind == FrameKind::ZList || (f.kind == FrameKind::ZMap && f.even) {
            self.stack.pop();
            match f.kind.container_kind() {
                Some(kind) => Value::Close(kind),
                None => Value::Null,
            }
        } else {
            Value::Null
        }
    }

    fn open_object(&mut self, classid_raw: i64) -> Result<Value<'static>, DecodeError> {
        let classid: ClassId = classid_raw
            .try_into()
            .map_err(|_| DecodeError::BadClassId)?;
        let nfields = self
            .classes
            .get(classid)
            .ok_or(DecodeError::BadClassId)?
            .nfields();
        self.push_frame(FrameKind::Object, ContextId::Global, nfields as i64)?;
        self.stack.last_mut().expect("frame just pushed").classid = classid;
        Ok(Value::Object(classid))
    }

    // ---- opcode family dispatch ----

    fn match_collection(
        &mut self,
        buf: &[u8],
        enc: &CollectionEncoding,
    ) -> Result<Option<(usize, Value<'static>)>, DecodeError> {
        need(buf, 1)?;
        let op = buf[0];
        let fixed_value = |len: usize| match enc.fixed_kind {
            FrameKind::Map => Value::Map(len),
            _ => Value::List(len),
        };
        let variable_value = || match enc.variable_kind {
            FrameKind::ZMap => Value::ZMap,
            _ => Value::ZList,
        };

        if op == enc.empty_opcode {
            self.push_frame(enc.fixed_kind, ContextId::Global, 0)?;
            Ok(Some((1, fixed_value(0))))
        } else if op >= enc.small_untyped_opcode
            && op <= enc.small_untyped_opcode + enc.small_limit as u8 - 1
        {
            let len = (op - enc.small_untyped_opcode) as usize + 1;
            self.push_frame(enc.fixed_kind, ContextId::Global, len as i64)?;
            Ok(Some((1, fixed_value(len))))
        } else if op == enc.long_untyped_opcode {
            let (sub, count) =
                decode_unsigned(&buf[1..]).map_err(|e| offset_incomplete(e, 1))?;
            let len = count as usize + enc.small_limit + 1;
            self.push_frame(enc.fixed_kind, ContextId::Global, len as i64)?;
            Ok(Some((1 + sub, fixed_value(len))))
        } else if op == enc.variable_untyped_opcode {
            self.push_frame(enc.variable_kind, ContextId::Global, -1)?;
            Ok(Some((1, variable_value())))
        } else if op >= enc.small_typed_opcode
            && op <= enc.small_typed_opcode + enc.small_limit as u8 - 1
        {
            need(buf, 2)?;
            let ctxid = ContextId::from_wire(buf[1]).ok_or(DecodeError::BadContext)?;
            let len = (op - enc.small_typed_opcode) as usize + 1;
            self.push_frame(enc.fixed_kind, ctxid, len as i64)?;
            Ok(Some((2, fixed_value(len))))
        } else if op == enc.long_typed_opcode {
            let (sub, count) =
                decode_unsigned(&buf[1..]).map_err(|e| offset_incomplete(e, 1))?;
            need(buf, 1 + sub + 1)?;
            let ctxid = ContextId::from_wire(buf[1 + sub]).ok_or(DecodeError::BadContext)?;
            let len = count as usize + enc.small_limit + 1;
            self.push_frame(enc.fixed_kind, ctxid, len as i64)?;
            Ok(Some((2 + sub, fixed_value(len))))
        } else if op == enc.variable_typed_opcode {
            need(buf, 2)?;
            let ctxid = ContextId::from_wire(buf[1]).ok_or(DecodeError::BadContext)?;
            self.push_frame(enc.variable_kind, ctxid, -1)?;
            Ok(Some((2, variable_value())))
        } else {
            Ok(None)
        }
    }

    /// Decodes a class definition (opcodes 0x71/0x72), registering it on
    /// success. Nothing is kept when the input turns out to be too short, so
    /// the parse restarts cleanly from the same position.
    fn match_class(&mut self, buf: &[u8]) -> Result<Option<(usize, Value<'static>)>, DecodeError> {
        need(buf, 1)?;
        let named = match buf[0] {
            CLASSDEF_NAMED_OPCODE => true,
            CLASSDEF_UNNAMED_OPCODE => false,
            _ => return Ok(None),
        };
        let mut nread = 1;

        let (sub, classid_raw) =
            decode_unsigned(&buf[nread..]).map_err(|e| offset_incomplete(e, nread))?;
        nread += sub;
        let classid: ClassId = classid_raw
            .try_into()
            .map_err(|_| DecodeError::Invalid)?;

        let name = if named {
            let (sub, raw) = Self::uis_string(&buf[nread..])
                .map_err(|e| offset_incomplete(e, nread))?;
            nread += sub;
            Some(String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Invalid)?)
        } else {
            None
        };

        let (sub, nfields) =
            decode_unsigned(&buf[nread..]).map_err(|e| offset_incomplete(e, nread))?;
        nread += sub;
        if nfields < 0 || nfields > u16::MAX as i64 {
            return Err(DecodeError::Invalid);
        }

        let mut fields = Vec::new();
        for _ in 0..nfields {
            let field_name = if named {
                let (sub, raw) = Self::uis_string(&buf[nread..])
                    .map_err(|e| offset_incomplete(e, nread))?;
                nread += sub;
                Some(String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Invalid)?)
            } else {
                None
            };
            need(buf, nread + 1)?;
            let ctxid = ContextId::from_wire(buf[nread]).ok_or(DecodeError::Invalid)?;
            nread += 1;
            fields.push(ClassField::new(field_name, ctxid));
        }

        self.classes.set(ClassRef::Owned(Box::new(ClassDef {
            classid,
            name,
            fields,
        })));
        Ok(Some((nread, Value::ClassDef(classid))))
    }

    /// A single-frame UNSIGNED_OR_STRING string; chunked form not accepted.
    fn uis_string(buf: &[u8]) -> Result<(usize, &[u8]), DecodeError> {
        match match_string(buf, &UIS_STRING)? {
            Some(StringMatch::Value { consumed, data }) => Ok((consumed, data)),
            _ => Err(DecodeError::Invalid),
        }
    }

    // ---- per-context decoders ----

    fn decode_global<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 1)?;
        let op = buf[0];

        if let Some((n, x)) = match_integer(buf, &GLOBAL_INTEGER)? {
            return Ok((n, Value::Int(x)));
        }
        match match_string(buf, &GLOBAL_STRING)? {
            Some(StringMatch::Value { consumed, data }) => {
                return Ok((consumed, Value::String(data)))
            }
            Some(StringMatch::ChunkedStart) => {
                self.push_frame(FrameKind::Chunked, ContextId::Chunked, -1)?;
                return Ok((1, Value::ChunkedString));
            }
            None => {}
        }
        if let Some(r) = self.match_collection(buf, &GLOBAL_LIST)? {
            return Ok(r);
        }
        if let Some(r) = self.match_collection(buf, &GLOBAL_MAP)? {
            return Ok(r);
        }
        if let Some(r) = self.match_class(buf)? {
            return Ok(r);
        }
        if (OBJECT_SHORT_BASE..=OBJECT_SHORT_BASE + 0x0F).contains(&op) {
            let value = self.open_object((op - OBJECT_SHORT_BASE) as i64)?;
            return Ok((1, value));
        }
        match op {
            GLOBAL_NULL => Ok((1, self.decode_null())),
            GLOBAL_TRUE => Ok((1, Value::Bool(true))),
            GLOBAL_FALSE => Ok((1, Value::Bool(false))),
            OBJECT_LONG_OPCODE => {
                let (sub, id) =
                    decode_unsigned(&buf[1..]).map_err(|e| offset_incomplete(e, 1))?;
                let value = self.open_object(id + OBJECT_SHORT_LIMIT as i64)?;
                Ok((1 + sub, value))
            }
            0xFE => {
                need(buf, 5)?;
                let f = f32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                Ok((5, Value::Double(f as f64)))
            }
            0xFF => {
                need(buf, 9)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[1..9]);
                Ok((9, Value::Double(f64::from_be_bytes(raw))))
            }
            _ => Err(DecodeError::Invalid),
        }
    }

    fn decode_uis<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 1)?;
        let op = buf[0];
        match match_string(buf, &UIS_STRING)? {
            Some(StringMatch::Value { consumed, data }) => {
                return Ok((consumed, Value::String(data)))
            }
            Some(StringMatch::ChunkedStart) => {
                self.push_frame(FrameKind::Chunked, ContextId::Chunked, -1)?;
                return Ok((1, Value::ChunkedString));
            }
            None => {}
        }
        if op == 0x00 {
            return Ok((1, self.decode_null()));
        }
        let (n, x) = decode_unsigned(buf)?;
        Ok((n, Value::Int(x)))
    }

    fn decode_number<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 1)?;
        if let Some((n, x)) = match_integer(buf, &NUMBER_INTEGER)? {
            return Ok((n, Value::Int(x)));
        }
        match buf[0] {
            0x00 => Ok((1, self.decode_null())),
            0xFE => {
                need(buf, 5)?;
                let f = f32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                Ok((5, Value::Double(f as f64)))
            }
            0xFF => {
                need(buf, 9)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[1..9]);
                Ok((9, Value::Double(f64::from_be_bytes(raw))))
            }
            _ => Err(DecodeError::Invalid),
        }
    }

    fn decode_int32<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 4)?;
        let raw = be_u32(buf);
        if raw == 0x8000_0000 {
            need(buf, 5)?;
            match buf[4] {
                0x00 => Ok((5, self.decode_null())),
                0x01 => Ok((5, Value::Int(i32::MIN as i64))),
                _ => Err(DecodeError::Invalid),
            }
        } else {
            Ok((4, Value::Int(raw as i32 as i64)))
        }
    }

    fn decode_float<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 4)?;
        let raw = be_u32(buf);
        if raw == u32::MAX {
            need(buf, 5)?;
            match buf[4] {
                0x00 => Ok((5, self.decode_null())),
                0x01 => Ok((5, Value::Double(f32::from_bits(raw) as f64))),
                _ => Err(DecodeError::Invalid),
            }
        } else {
            Ok((4, Value::Double(f32::from_bits(raw) as f64)))
        }
    }

    fn decode_double<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        let bits = u64::from_be_bytes(raw);
        if bits == u64::MAX {
            need(buf, 9)?;
            match buf[8] {
                0x00 => Ok((9, self.decode_null())),
                0x01 => Ok((9, Value::Double(f64::from_bits(bits)))),
                _ => Err(DecodeError::Invalid),
            }
        } else {
            Ok((8, Value::Double(f64::from_bits(bits))))
        }
    }

    fn decode_listmap<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 1)?;
        if let Some(r) = self.match_collection(buf, &LISTMAP_LIST)? {
            return Ok(r);
        }
        if let Some(r) = self.match_collection(buf, &LISTMAP_MAP)? {
            return Ok(r);
        }
        if buf[0] == 0x00 {
            return Ok((1, self.decode_null()));
        }
        Err(DecodeError::Invalid)
    }

    fn decode_chunked<'b>(&mut self, buf: &'b [u8]) -> Result<(usize, Value<'b>), DecodeError> {
        need(buf, 2)?;
        let size = ((buf[0] as usize) << 8) + buf[1] as usize;
        if size == 0 {
            self.stack.pop();
            Ok((2, Value::Close(ContainerKind::ChunkedString)))
        } else {
            need(buf, size + 2)?;
            Ok((size + 2, Value::Chunk(&buf[2..2 + size])))
        }
    }

    // ---- the public read loop ----

    /// Decodes the next event from `buffer`.
    ///
    /// Returns the number of bytes consumed (zero when a fixed container is
    /// closed) and the event. [DecodeError::Incomplete] means nothing was
    /// consumed and the buffer must be extended first. The returned payload
    /// borrows `buffer` only, so events outlive subsequent `read` calls.
    pub fn read<'b>(&mut self, buffer: &'b [u8]) -> Result<(usize, Data<'b>), DecodeError> {
        // Fixed containers close themselves once all children were decoded.
        let top = *self.top();
        if top.missing == 0 {
            self.stack.pop();
            let value = Value::Close(top.kind.container_kind().ok_or(DecodeError::Internal)?);
            let (kind, field) = self.item_kind_of_top();
            return Ok((0, Data { value, kind, field }));
        }

        let depth_before = self.stack.len();
        let (consumed, value) = match self.current_ctx()? {
            ContextId::Global => self.decode_global(buffer)?,
            ContextId::UnsignedOrString => self.decode_uis(buffer)?,
            ContextId::Number => self.decode_number(buffer)?,
            ContextId::Int32 => self.decode_int32(buffer)?,
            ContextId::Float => self.decode_float(buffer)?,
            ContextId::Double => self.decode_double(buffer)?,
            ContextId::ListOrMap => self.decode_listmap(buffer)?,
            ContextId::Chunked => self.decode_chunked(buffer)?,
            ContextId::Object => return Err(DecodeError::BadContext),
        };

        // Account the value as one child of its container. Class definitions
        // do not count; neither do sentinel closes (the container counted as
        // a child when it was opened).
        let popped = self.stack.len() < depth_before;
        if !matches!(value, Value::ClassDef(_)) && !popped {
            let parent = &mut self.stack[depth_before - 1];
            if parent.missing > 0 {
                parent.missing -= 1;
            }
            if matches!(parent.kind, FrameKind::Map | FrameKind::ZMap) {
                parent.even = !parent.even;
            }
        }

        let (kind, field) = if self.stack.len() > depth_before {
            (ItemKind::NewContainer, None)
        } else {
            self.item_kind_of_top()
        };
        self.read += consumed;
        Ok((consumed, Data { value, kind, field }))
    }
}
