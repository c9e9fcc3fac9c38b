use thiserror_no_std::Error;

/// Fault reported by a byte sink. Anything other than a short write is
/// surfaced through this type; a short write is reported as
/// [EncodeError::Overflow](crate::codec::error::EncodeError::Overflow)
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The backing store cannot accept writes in its current state.
    #[error("sink backing store cannot accept writes in its current state")]
    BadState,

    /// A single write exceeds the sink's maximum cell size.
    #[error("write exceeds the sink's maximum cell size")]
    TooBig,

    /// The sink failed to allocate.
    #[error("sink allocation failure")]
    Memory,

    /// I/O failure on a file-backed sink.
    #[error("sink I/O failure: {0:?}")]
    Io(std::io::ErrorKind),
}

/// Errors returned by the serializer.
///
/// [EncodeError::Overflow] is the only retryable error: the operation that
/// returned it must be retried, unchanged, once the sink can accept more
/// bytes. Every other error that occurs after bytes reached the sink leaves
/// the serializer broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The sink refused part of the write; retry the same operation later.
    #[error("sink overflow, retry the same operation")]
    Overflow,

    /// Too many nested containers.
    #[error("too many nested containers")]
    TooDeep,

    /// Invalid operation (empty chunk, null in a variable list, ...).
    #[error("invalid operation")]
    Invalid,

    /// A map was closed with an odd number of children.
    #[error("odd number of children in a map")]
    BadMap,

    /// The declared container size does not match the children written.
    #[error("declared size does not match the number of children written")]
    SizeMismatch,

    /// Unknown context id declared for a container.
    #[error("unknown context id")]
    BadCtxId,

    /// The operation is not permitted in the current decoding context.
    #[error("operation not permitted in the current context")]
    BadContext,

    /// No class with that id is registered.
    #[error("unknown class id")]
    BadClassId,

    /// Bad field context, or a missing field name in a named class.
    #[error("bad field context or missing field name")]
    BadField,

    /// The number cannot be represented in the current context.
    #[error("number out of bounds for the current context")]
    OutOfBounds,

    /// Close was called with no open container.
    #[error("no container to close")]
    NoContainer,

    /// The stream was corrupted by a previous error.
    #[error("stream corrupted by a previous error")]
    Broken,

    /// Allocation failure.
    #[error("out of memory")]
    Memory,

    /// Internal invariant violation.
    #[error("internal error")]
    Internal,

    /// The sink reported a hard fault.
    #[error("sink fault: {0}")]
    Sink(#[from] SinkError),
}

/// Errors returned by the deserializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// More input is needed; the payload is a lower bound on the number of
    /// bytes that should be available in the buffer before retrying. The
    /// bound is best-effort: streamed class definitions may produce two
    /// consecutive short reads.
    #[error("at least {0} input bytes are required")]
    Incomplete(usize),

    /// Syntactically invalid stream.
    #[error("invalid stream")]
    Invalid,

    /// The decoding context is unknown or does not accept this opcode.
    #[error("unknown or invalid decoding context")]
    BadContext,

    /// No class with that id is registered.
    #[error("unknown class id")]
    BadClassId,

    /// Too many nested containers.
    #[error("too many nested containers")]
    TooDeep,

    /// Allocation failure.
    #[error("out of memory")]
    Memory,

    /// Internal invariant violation.
    #[error("internal error")]
    Internal,
}
