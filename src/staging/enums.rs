/// Lifecycle of a staging table.
///
/// Cells are only accepted in `Reading`; `Serializing` is entered by the
/// flush entry point and left when the emission completes or is canceled.
/// `Broken` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Not all columns have been configured yet.
    Unconfigured,
    /// Accepting data input.
    Reading,
    /// Waiting for the flush output stream to be consumed.
    Serializing,
    /// Experienced a fatal error.
    Broken,
}

/// Backend holding the encoded cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Chained fixed-size chunks in memory.
    Ram,
    /// Append-only file; the table identifier is the path.
    #[cfg(feature = "file")]
    File,
}

/// How a column is rendered when the table is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnContainer {
    /// Stream stored cells verbatim; no analysis cost.
    Fastest,
    /// Measure list, deltas-vector and quasi-periodic-vector renderings and
    /// pick the smallest.
    #[default]
    Smallest,
    /// Plain list of the stored cells.
    List,
    /// Factor, start value, and per-row scaled integer deltas.
    DeltasVector,
    /// Factor, start value, and (shift-count, shift-value) runs; best when
    /// most rows differ from the previous one by a fixed period.
    QuasiPeriodicVector,
}

/// Configuration of one table column.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub label: String,
    pub container: ColumnContainer,
    /// Round doubles through 32-bit floats before storing.
    pub four_byte_floats: bool,
    /// Meaning depends on the container: fixed precision for `Smallest`,
    /// the factor for `DeltasVector`, the period for `QuasiPeriodicVector`.
    pub precision: Option<f64>,
}

impl ColumnSpec {
    pub fn new(label: impl Into<String>, container: ColumnContainer) -> Self {
        ColumnSpec {
            label: label.into(),
            container,
            four_byte_floats: false,
            precision: None,
        }
    }

    /// A column serialized as a plain list.
    pub fn list(label: impl Into<String>) -> Self {
        Self::new(label, ColumnContainer::List)
    }

    /// A column whose encoding is chosen by measurement.
    pub fn smallest(label: impl Into<String>) -> Self {
        Self::new(label, ColumnContainer::Smallest)
    }

    /// A deltas-vector column with the given factor.
    pub fn deltas_vector(label: impl Into<String>, factor: f64) -> Self {
        let mut spec = Self::new(label, ColumnContainer::DeltasVector);
        spec.precision = Some(factor);
        spec
    }

    /// A quasi-periodic-vector column with the given period.
    pub fn quasi_periodic(label: impl Into<String>, period: f64) -> Self {
        let mut spec = Self::new(label, ColumnContainer::QuasiPeriodicVector);
        spec.precision = Some(period);
        spec
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_four_byte_floats(mut self) -> Self {
        self.four_byte_floats = true;
        self
    }
}
