//! # Bysant + Staging Database
//!
//! A context-sensitive binary serialization format ("Bysant") together with
//! an append-only columnar staging database that accumulates encoded cells
//! and streams them back out under the most compact of several column
//! encodings.

/// The Bysant wire format: opcode tables, class schemas, and the two
/// streaming state machines (encode and decode).
pub mod codec {
    /// Decoding contexts and stack frame kinds.
    pub mod enums;

    /// Compile-time opcode/limit tables for every decoding context.
    pub mod encoding;

    /// Class schemas and the ordered class registry.
    pub mod class;

    /// Error types for encode, decode and byte sinks.
    pub mod error;

    /// The byte sink abstraction consumed by the serializer.
    pub mod sink;

    /// Streaming, transactional encoder.
    pub mod serializer;

    /// Restartable, event-based decoder.
    pub mod deserializer;
}

/// The staging database: chunked cell storage, cell writers, a cell-wise
/// read cursor, column consolidation and the streamed table emitter.
pub mod staging {
    pub mod enums;

    /// Staging-side error type.
    pub mod error;

    /// Chunked RAM storage and the optional file-backed storage.
    pub mod storage;

    /// The staging table itself: configuration, lifecycle, cell writers.
    pub mod table;

    /// Cell-by-cell cursor over a table's storage.
    pub mod cursor;

    /// Reduction of a source table's columns into a destination table.
    pub mod consolidate;

    /// Column-encoding selection and the resumable table serializer.
    pub mod emit;
}

pub mod utilities {
    /// Number related code.
    pub mod math;
}

pub use codec::class::{ClassCollection, ClassDef, ClassField, ClassId, ClassRef};
pub use codec::deserializer::{Data, Deserializer, FieldPos, ItemKind, Value};
pub use codec::enums::{ContainerKind, ContextId};
pub use codec::error::{DecodeError, EncodeError, SinkError};
pub use codec::serializer::Serializer;
pub use codec::sink::{Sink, VecSink};
pub use staging::consolidate::{ConsolidationColumn, ConsolidationMethod, ConsolidationSpec};
pub use staging::cursor::{Cell, CellCursor};
pub use staging::enums::{ColumnContainer, ColumnSpec, StorageKind, TableState};
pub use staging::error::StagingError;
pub use staging::table::StagingTable;
