use int_enum::IntEnum;

/// Identifies the decoding context that governs how the next value on the
/// wire is interpreted.
///
/// The first seven contexts can appear on the wire (as the element-type byte
/// of typed containers and as class field types); [ContextId::Chunked] and
/// [ContextId::Object] only ever live on the codec stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum ContextId {
    /// Any value kind; the densest opcode space.
    Global = 0,

    /// Unsigned integers and strings only. Used for map keys.
    UnsignedOrString = 1,

    /// Integers and floating point numbers, with wider tiny ranges.
    Number = 2,

    /// Raw 4-byte big-endian integers.
    Int32 = 3,

    /// Raw 4-byte floats.
    Float = 4,

    /// Raw 8-byte doubles.
    Double = 5,

    /// Lists and maps only.
    ListOrMap = 6,

    // Internal contexts; never valid on the wire.
    /// Inside a chunked string: only length-prefixed chunks are accepted.
    Chunked = 8,

    /// Marker for object frames; the effective context comes from the class
    /// schema, field by field.
    Object = 9,
}

/// Number of wire-visible contexts; any context byte must be below this.
pub const CTXID_LAST: u8 = 7;

impl ContextId {
    /// Decodes a context byte from the wire, rejecting the internal contexts.
    pub fn from_wire(byte: u8) -> Option<ContextId> {
        if byte < CTXID_LAST {
            ContextId::try_from(byte).ok()
        } else {
            None
        }
    }

    /// True when this context may appear on the wire.
    pub fn is_wire(self) -> bool {
        u8::from(self) < CTXID_LAST
    }
}

/// Stack frame kinds shared by the serializer and the deserializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Top level, no open container.
    Top,
    /// Fixed-size map.
    Map,
    /// Variable-size map, closed by a null sentinel on a key slot.
    ZMap,
    /// Object instance, sized by its class schema.
    Object,
    /// Fixed-size list.
    List,
    /// Variable-size list, closed by a null sentinel.
    ZList,
    /// Chunked string or binary.
    Chunked,
    /// Class definition.
    ClassDef,
}

/// The container kinds reported by close events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    List,
    ZList,
    Map,
    ZMap,
    Object,
    ChunkedString,
}

impl FrameKind {
    /// The container kind a close event reports for this frame, if any.
    pub fn container_kind(self) -> Option<ContainerKind> {
        match self {
            FrameKind::Map => Some(ContainerKind::Map),
            FrameKind::ZMap => Some(ContainerKind::ZMap),
            FrameKind::Object => Some(ContainerKind::Object),
            FrameKind::List => Some(ContainerKind::List),
            FrameKind::ZList => Some(ContainerKind::ZList),
            FrameKind::Chunked => Some(ContainerKind::ChunkedString),
            FrameKind::Top | FrameKind::ClassDef => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::global(0, Some(ContextId::Global))]
    #[case::uis(1, Some(ContextId::UnsignedOrString))]
    #[case::number(2, Some(ContextId::Number))]
    #[case::listmap(6, Some(ContextId::ListOrMap))]
    #[case::past_last(7, None)]
    #[case::chunked_internal(8, None)]
    #[case::garbage(0xFF, None)]
    fn wire_context_bytes(#[case] byte: u8, #[case] expected: Option<ContextId>) {
        assert_eq!(ContextId::from_wire(byte), expected);
    }

    #[test]
    fn internal_contexts_are_not_wire() {
        assert!(!ContextId::Chunked.is_wire());
        assert!(!ContextId::Object.is_wire());
        assert!(ContextId::Global.is_wire());
    }
}
