use crate::codec::error::{DecodeError, EncodeError, SinkError};
use thiserror_no_std::Error;

/// Errors reported by staging tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StagingError {
    /// Operation not permitted in the table's current state.
    #[error("operation not permitted in the table's current state")]
    BadState,

    /// A cell exceeds the maximum encodable size.
    #[error("cell exceeds the maximum encodable size")]
    TooBig,

    /// Invalid argument or configuration.
    #[error("invalid argument or configuration")]
    Invalid,

    /// Allocation failure.
    #[error("out of memory")]
    Memory,

    /// The table has no consolidation configured.
    #[error("no consolidation configured")]
    NoConsolidation,

    /// File storage failure.
    #[error("file storage failure: {0:?}")]
    BadFile(std::io::ErrorKind),

    /// Null cells are forbidden on this table.
    #[error("null cells are forbidden on this table")]
    NullForbidden,

    /// The table reached its row cap.
    #[error("table reached its row cap")]
    Full,

    /// The table holds no complete row.
    #[error("table holds no complete row")]
    Empty,

    /// The output sink refused part of a write; retry the serialization.
    #[error("output sink overflow, retry the serialization")]
    Overflow,

    /// A stored cell failed to decode.
    #[error("stored cell is corrupt: {0}")]
    Decode(DecodeError),

    /// The cell encoder failed.
    #[error("cell encoder fault: {0}")]
    Encode(EncodeError),

    /// Internal invariant violation.
    #[error("internal error")]
    Internal,
}

impl StagingError {
    /// True for the retryable overflow condition.
    pub fn is_overflow(&self) -> bool {
        matches!(self, StagingError::Overflow)
    }
}

impl From<EncodeError> for StagingError {
    fn from(e: EncodeError) -> Self {
        // Faults raised by the table's own sink come back out as staging
        // errors, as do retryable overflows from an application sink.
        match e {
            EncodeError::Overflow => StagingError::Overflow,
            EncodeError::Sink(SinkError::BadState) => StagingError::BadState,
            EncodeError::Sink(SinkError::TooBig) => StagingError::TooBig,
            EncodeError::Sink(SinkError::Memory) => StagingError::Memory,
            EncodeError::Sink(SinkError::Io(kind)) => StagingError::BadFile(kind),
            other => StagingError::Encode(other),
        }
    }
}

impl From<DecodeError> for StagingError {
    fn from(e: DecodeError) -> Self {
        StagingError::Decode(e)
    }
}

#[cfg(feature = "file")]
impl From<std::io::Error> for StagingError {
    fn from(e: std::io::Error) -> Self {
        StagingError::BadFile(e.kind())
    }
}
