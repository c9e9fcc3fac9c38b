//! The staging table: a fixed set of named columns, an append-only store of
//! encoded cells, and the machinery to flush them back out.
//!
//! Cells are written row by row, column after column; the column a cell
//! lands in is simply the cell count modulo the column count. Each write
//! feeds the column's running analysis (used by the smallest-encoding
//! chooser) before it is encoded into the backing storage.

use crate::codec::serializer::Serializer;
use crate::staging::consolidate::ConsolidationSpec;
use crate::staging::emit::EmitState;
use crate::staging::enums::{ColumnContainer, ColumnSpec, StorageKind, TableState};
use crate::staging::error::StagingError;
use crate::staging::storage::{StagingSink, Storage};
use crate::utilities::math::gcd;
use log::debug;

/// Highest allowed column count.
pub const MAX_COLUMNS: usize = 254;

/// Running statistics for one column, collected as cells are written.
/// Only meaningful for columns using the smallest-encoding chooser.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DataAnalysis {
    /// The configured precision, before the chooser overwrites `arg`.
    pub original_arg: f64,
    /// Greatest common divisor of all integer cells.
    pub gcd: i64,
    /// Previous integer cell.
    pub prev_value: i64,
    /// Sum of deltas between consecutive integer cells.
    pub delta_sum: i64,
    /// Encoding chosen by the last analysis pass.
    pub method: ColumnContainer,
    /// False once any non-integer cell was stored.
    pub all_integer: bool,
    /// False once any non-numeric cell was stored.
    pub all_numeric: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Column {
    pub label_off: usize,
    pub label_len: usize,
    pub container: ColumnContainer,
    pub four_byte_floats: bool,
    /// A caller-fixed precision (only honored by the chooser).
    pub fixed_precision: bool,
    /// Method argument: precision, factor or period.
    pub arg: f64,
    pub analysis: DataAnalysis,
}

/// The table's cell encoder, or just the bare storage after a trim.
pub(crate) enum Backing {
    /// Encoder bound to the storage, ready to accept cells.
    Live(Serializer<StagingSink>),
    /// Storage without an encoder; rebuilt lazily on the next write.
    Trimmed(Storage),
}

impl Backing {
    pub(crate) fn storage(&self) -> &Storage {
        match self {
            Backing::Live(enc) => &enc.sink().storage,
            Backing::Trimmed(storage) => storage,
        }
    }
}

/// An append-only row store of Bysant-encoded cells.
pub struct StagingTable {
    pub(crate) state: TableState,
    /// Packed name arena: table identifier first, then column labels.
    pub(crate) names: String,
    pub(crate) id_len: usize,
    pub(crate) columns: Vec<Column>,
    pub(crate) conf_cols: usize,
    pub(crate) backing: Backing,
    pub(crate) nwrittenobjects: usize,
    /// Cell cap derived from the row cap; 0 means unlimited.
    pub(crate) max_objects: usize,
    pub(crate) nil_forbidden: bool,
    pub(crate) consolidation: Option<ConsolidationSpec>,
    pub(crate) emit: Option<Box<EmitState>>,
}

impl StagingTable {
    /// Creates a table and configures all of its columns in one call.
    ///
    /// For [StorageKind::File], `id` doubles as the backing file path; a
    /// pre-existing file is scanned so its cells count again.
    pub fn new(
        id: &str,
        storage: StorageKind,
        specs: &[ColumnSpec],
    ) -> Result<StagingTable, StagingError> {
        let mut tbl = StagingTable::unconfigured(id, specs.len(), storage)?;
        for spec in specs {
            tbl.set_column(spec)?;
        }
        if tbl.state != TableState::Reading {
            return Err(StagingError::Internal);
        }
        Ok(tbl)
    }

    /// Creates a table whose columns are configured later, one
    /// [StagingTable::set_column] call per column. Useful when the schema is
    /// only known at run time.
    pub fn unconfigured(
        id: &str,
        ncolumns: usize,
        storage: StorageKind,
    ) -> Result<StagingTable, StagingError> {
        if ncolumns == 0 || ncolumns > MAX_COLUMNS {
            return Err(StagingError::Invalid);
        }
        let storage = match storage {
            StorageKind::Ram => Storage::ram(),
            #[cfg(feature = "file")]
            StorageKind::File => Storage::file(id)?,
        };
        Ok(StagingTable {
            state: TableState::Unconfigured,
            names: id.to_owned(),
            id_len: id.len(),
            columns: Vec::with_capacity(ncolumns),
            conf_cols: ncolumns,
            backing: Backing::Live(Serializer::new(StagingSink::new(storage))),
            nwrittenobjects: 0,
            max_objects: 0,
            nil_forbidden: false,
            consolidation: None,
            emit: None,
        })
    }

    /// Configures the next column. The table starts accepting cells once
    /// the declared column count is reached.
    pub fn set_column(&mut self, spec: &ColumnSpec) -> Result<(), StagingError> {
        if self.state != TableState::Unconfigured {
            return Err(StagingError::BadState);
        }
        let label_off = self.names.len();
        self.names.push_str(&spec.label);
        let mut column = Column {
            label_off,
            label_len: spec.label.len(),
            container: spec.container,
            four_byte_floats: spec.four_byte_floats,
            fixed_precision: spec.precision.is_some(),
            arg: spec.precision.unwrap_or(0.0),
            analysis: DataAnalysis::default(),
        };
        if spec.container == ColumnContainer::Smallest {
            column.analysis.original_arg = column.arg;
            column.analysis.all_integer = true;
            column.analysis.all_numeric = true;
        }
        self.columns.push(column);

        if self.columns.len() == self.conf_cols {
            self.state = TableState::Reading;
            debug!("table '{}' configured with {} columns", self.id(), self.conf_cols);
            // A reopened file table already holds cells; account for them.
            #[cfg(feature = "file")]
            if self.storage().kind() == StorageKind::File && !self.storage().is_empty() {
                self.restore_cells()?;
            }
        }
        Ok(())
    }

    // ---- accessors ----

    pub fn state(&self) -> TableState {
        self.state
    }

    /// Table identifier (the file path for file-backed tables).
    pub fn id(&self) -> &str {
        &self.names[..self.id_len]
    }

    pub fn ncolumns(&self) -> usize {
        self.columns.len()
    }

    /// Complete rows currently stored.
    pub fn nrows(&self) -> usize {
        if self.columns.is_empty() {
            0
        } else {
            self.nwrittenobjects / self.columns.len()
        }
    }

    /// Cells currently stored.
    pub fn ncells(&self) -> usize {
        self.nwrittenobjects
    }

    /// Encoded bytes currently stored.
    pub fn nbytes(&self) -> usize {
        self.storage().len()
    }

    /// Column index for a label, if any.
    pub fn column_index(&self, label: &str) -> Option<usize> {
        if matches!(self.state, TableState::Broken | TableState::Unconfigured) {
            return None;
        }
        (0..self.columns.len()).find(|&i| self.column_label(i) == label)
    }

    /// Label of a column.
    pub fn column_label(&self, index: usize) -> &str {
        let c = &self.columns[index];
        &self.names[c.label_off..c.label_off + c.label_len]
    }

    /// Caps the number of rows the table accepts; writes beyond the cap
    /// fail with [StagingError::Full]. Fails if the table already holds
    /// more.
    pub fn set_max_rows(&mut self, nrows: usize) -> Result<(), StagingError> {
        let cap = nrows * self.columns.len();
        if self.nwrittenobjects > cap {
            return Err(StagingError::Full);
        }
        self.max_objects = cap;
        Ok(())
    }

    /// When set, writing a null cell fails with
    /// [StagingError::NullForbidden].
    pub fn forbid_null(&mut self, forbid: bool) {
        self.nil_forbidden = forbid;
    }

    // ---- backing management ----

    pub(crate) fn storage(&self) -> &Storage {
        self.backing.storage()
    }

    pub(crate) fn storage_mut(&mut self) -> &mut Storage {
        match &mut self.backing {
            Backing::Live(enc) => &mut enc.sink_mut().storage,
            Backing::Trimmed(storage) => storage,
        }
    }

    /// Rebuilds the cell encoder after a trim.
    fn untrim(&mut self) {
        if matches!(self.backing, Backing::Trimmed(_)) {
            let prev = std::mem::replace(&mut self.backing, Backing::Trimmed(Storage::empty()));
            if let Backing::Trimmed(storage) = prev {
                self.backing = Backing::Live(Serializer::new(StagingSink::new(storage)));
            }
        }
    }

    fn encoder(&mut self) -> &mut Serializer<StagingSink> {
        self.untrim();
        match &mut self.backing {
            Backing::Live(enc) => enc,
            Backing::Trimmed(_) => unreachable!("untrim always rebuilds the encoder"),
        }
    }

    /// Releases slack memory: tears the cell encoder down and shrinks the
    /// storage. The next cell write transparently rebuilds the encoder.
    pub fn trim(&mut self) -> Result<(), StagingError> {
        if self.state != TableState::Reading {
            return Err(StagingError::BadState);
        }
        if matches!(self.backing, Backing::Live(_)) {
            let prev = std::mem::replace(&mut self.backing, Backing::Trimmed(Storage::empty()));
            if let Backing::Live(enc) = prev {
                self.backing = Backing::Trimmed(enc.into_sink().into_storage());
            }
        }
        self.storage_mut().trim()
    }

    /// Drops every stored cell. A serialization in progress is canceled
    /// first.
    pub fn reset(&mut self) -> Result<(), StagingError> {
        if self.state == TableState::Serializing {
            self.serialize_cancel()?;
        }
        if self.state != TableState::Reading {
            return Err(StagingError::BadState);
        }
        self.storage_mut().reset()?;
        self.nwrittenobjects = 0;
        for column in &mut self.columns {
            if column.container == ColumnContainer::Smallest {
                column.analysis.delta_sum = 0;
                column.analysis.all_integer = true;
                column.analysis.all_numeric = true;
            }
        }
        if let Backing::Live(enc) = &mut self.backing {
            enc.reset();
        }
        Ok(())
    }

    // ---- data analysis ----

    /// Column about to receive the next cell.
    fn next_column(&self) -> usize {
        self.nwrittenobjects % self.columns.len()
    }

    /// Feeds an integer cell into the column statistics. Must run before
    /// the cell counter advances, as the column is derived from it.
    fn analyze_integer(&mut self, x: i64) {
        let index = self.next_column();
        let first_row = self.nwrittenobjects < self.columns.len();
        let column = &mut self.columns[index];
        if column.container != ColumnContainer::Smallest || !column.analysis.all_integer {
            return;
        }
        if first_row {
            // Seeds the running GCD.
            column.analysis.gcd = x;
        } else {
            column.analysis.delta_sum += x - column.analysis.prev_value;
        }
        if !column.fixed_precision {
            column.analysis.gcd = gcd(x, column.analysis.gcd);
        }
        column.analysis.prev_value = x;
    }

    /// Marks the receiving column non-integer (and possibly non-numeric).
    fn analyze_noninteger(&mut self, numeric: bool) {
        let index = self.next_column();
        let column = &mut self.columns[index];
        if column.container == ColumnContainer::Smallest {
            column.analysis.all_integer = false;
            column.analysis.all_numeric = column.analysis.all_numeric && numeric;
        }
    }

    // ---- cell writers ----

    fn begin_cell(&mut self) -> Result<(), StagingError> {
        if self.state != TableState::Reading {
            return Err(StagingError::BadState);
        }
        if self.max_objects != 0 && self.nwrittenobjects >= self.max_objects {
            return Err(StagingError::Full);
        }
        Ok(())
    }

    fn finish_cell(&mut self) -> Result<(), StagingError> {
        self.nwrittenobjects += 1;
        // File tables persist at each row boundary.
        #[cfg(feature = "file")]
        if self.nwrittenobjects % self.columns.len() == 0 {
            if let Storage::File(f) = self.storage_mut() {
                f.flush()?;
            }
        }
        Ok(())
    }

    /// Writes one integer cell.
    pub fn write_int(&mut self, x: i64) -> Result<(), StagingError> {
        self.begin_cell()?;
        self.analyze_integer(x);
        self.encoder().write_int(x)?;
        self.finish_cell()
    }

    /// Writes one floating point cell. Columns configured for four-byte
    /// floats round the value through `f32` first.
    pub fn write_double(&mut self, x: f64) -> Result<(), StagingError> {
        self.begin_cell()?;
        let x = if self.columns[self.next_column()].four_byte_floats {
            x as f32 as f64
        } else {
            x
        };
        self.analyze_noninteger(true);
        self.encoder().write_double(x)?;
        self.finish_cell()
    }

    /// Writes a numeric cell: integers take the integer encoding, anything
    /// else the float one.
    pub fn write_number(&mut self, x: f64) -> Result<(), StagingError> {
        if x >= -9_223_372_036_854_775_808.0 && x < 9_223_372_036_854_775_808.0 {
            let ix = x as i64;
            if ix as f64 == x {
                return self.write_int(ix);
            }
        }
        self.write_double(x)
    }

    /// Writes one string cell.
    pub fn write_string(&mut self, s: &str) -> Result<(), StagingError> {
        self.write_binary(s.as_bytes())
    }

    /// Writes one binary cell (same wire encoding as strings).
    pub fn write_binary(&mut self, data: &[u8]) -> Result<(), StagingError> {
        self.begin_cell()?;
        self.analyze_noninteger(false);
        self.encoder().write_string(data)?;
        self.finish_cell()
    }

    /// Writes one boolean cell.
    pub fn write_bool(&mut self, b: bool) -> Result<(), StagingError> {
        self.begin_cell()?;
        self.analyze_noninteger(false);
        self.encoder().write_bool(b)?;
        self.finish_cell()
    }

    /// Writes one null cell, unless the table forbids them.
    pub fn write_null(&mut self) -> Result<(), StagingError> {
        if self.nil_forbidden {
            return Err(StagingError::NullForbidden);
        }
        self.begin_cell()?;
        self.analyze_noninteger(false);
        self.encoder().write_null()?;
        self.finish_cell()
    }

    /// Injects an already-encoded cell. The bytes must form exactly one
    /// value valid in GLOBAL context.
    pub fn write_raw(&mut self, cell: &[u8]) -> Result<(), StagingError> {
        self.begin_cell()?;
        self.analyze_noninteger(false);
        self.encoder().write_raw(cell)?;
        self.finish_cell()
    }

    /// Appends a cell copied verbatim from another table, without touching
    /// this table's column analysis. Used by positional consolidation.
    pub(crate) fn append_consolidated(&mut self, bytes: &[u8]) -> Result<(), StagingError> {
        self.storage_mut().append(bytes).map_err(StagingError::from_sink)?;
        self.finish_cell()
    }

    /// Replays the cells of a reopened file table to rebuild the counters
    /// and the per-column analysis.
    #[cfg(feature = "file")]
    fn restore_cells(&mut self) -> Result<(), StagingError> {
        use crate::codec::deserializer::Value;
        use crate::staging::cursor::CellCursor;

        let mut cursor = CellCursor::new(self.storage())?;
        let mut restored: Vec<(usize, Option<i64>, bool)> = Vec::new();
        loop {
            let storage = self.storage();
            match cursor.next(storage, false)? {
                None => break,
                Some(cell) => {
                    let entry = match cell.value.map(|d| d.value) {
                        Some(Value::Int(i)) => (cell.size, Some(i), true),
                        Some(Value::Double(_)) => (cell.size, None, true),
                        _ => (cell.size, None, false),
                    };
                    restored.push(entry);
                }
            }
        }
        for (_size, int_value, numeric) in restored {
            match int_value {
                Some(i) => self.analyze_integer(i),
                None => self.analyze_noninteger(numeric),
            }
            self.nwrittenobjects += 1;
        }
        debug!(
            "table '{}' restored {} cells from file",
            self.id(),
            self.nwrittenobjects
        );
        Ok(())
    }
}

impl StagingError {
    pub(crate) fn from_sink(e: crate::codec::error::SinkError) -> StagingError {
        use crate::codec::error::SinkError;
        match e {
            SinkError::BadState => StagingError::BadState,
            SinkError::TooBig => StagingError::TooBig,
            SinkError::Memory => StagingError::Memory,
            SinkError::Io(kind) => StagingError::BadFile(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::enums::ColumnSpec;

    fn two_column_table() -> StagingTable {
        StagingTable::new(
            "metrics",
            StorageKind::Ram,
            &[ColumnSpec::smallest("time"), ColumnSpec::smallest("value")],
        )
        .unwrap()
    }

    #[test]
    fn configuration_reaches_reading_state() {
        let tbl = two_column_table();
        assert_eq!(tbl.state(), TableState::Reading);
        assert_eq!(tbl.ncolumns(), 2);
        assert_eq!(tbl.id(), "metrics");
        assert_eq!(tbl.column_label(0), "time");
        assert_eq!(tbl.column_label(1), "value");
        assert_eq!(tbl.column_index("value"), Some(1));
        assert_eq!(tbl.column_index("nope"), None);
    }

    #[test]
    fn incremental_configuration_gates_writes() {
        let mut tbl =
            StagingTable::unconfigured("t", 2, StorageKind::Ram).unwrap();
        assert_eq!(tbl.state(), TableState::Unconfigured);
        assert_eq!(tbl.write_int(1), Err(StagingError::BadState));
        tbl.set_column(&ColumnSpec::list("a")).unwrap();
        assert_eq!(tbl.state(), TableState::Unconfigured);
        tbl.set_column(&ColumnSpec::list("b")).unwrap();
        assert_eq!(tbl.state(), TableState::Reading);
        tbl.write_int(1).unwrap();
    }

    #[test]
    fn zero_or_too_many_columns_rejected() {
        assert_eq!(
            StagingTable::unconfigured("t", 0, StorageKind::Ram).err(),
            Some(StagingError::Invalid)
        );
        assert_eq!(
            StagingTable::unconfigured("t", 255, StorageKind::Ram).err(),
            Some(StagingError::Invalid)
        );
    }

    #[test]
    fn cells_round_robin_into_columns() {
        let mut tbl = two_column_table();
        tbl.write_int(10).unwrap();
        tbl.write_int(100).unwrap();
        tbl.write_int(20).unwrap();
        tbl.write_int(200).unwrap();
        assert_eq!(tbl.ncells(), 4);
        assert_eq!(tbl.nrows(), 2);
        assert_eq!(tbl.columns[0].analysis.gcd, 10);
        assert_eq!(tbl.columns[1].analysis.gcd, 100);
        assert_eq!(tbl.columns[0].analysis.delta_sum, 10);
        assert_eq!(tbl.columns[1].analysis.delta_sum, 100);
    }

    #[test]
    fn non_numeric_cells_poison_analysis() {
        let mut tbl = two_column_table();
        tbl.write_int(1).unwrap();
        tbl.write_string("x").unwrap();
        assert!(tbl.columns[0].analysis.all_integer);
        assert!(!tbl.columns[1].analysis.all_integer);
        assert!(!tbl.columns[1].analysis.all_numeric);

        tbl.write_double(1.5).unwrap();
        assert!(!tbl.columns[0].analysis.all_integer);
        assert!(tbl.columns[0].analysis.all_numeric);
    }

    #[test]
    fn row_cap_is_enforced() {
        let mut tbl = two_column_table();
        tbl.set_max_rows(1).unwrap();
        tbl.write_int(1).unwrap();
        tbl.write_int(2).unwrap();
        assert_eq!(tbl.write_int(3), Err(StagingError::Full));
        // Raising the cap unblocks writes.
        tbl.set_max_rows(2).unwrap();
        tbl.write_int(3).unwrap();
        // A cap below the current content is rejected.
        assert_eq!(tbl.set_max_rows(1), Err(StagingError::Full));
    }

    #[test]
    fn null_rejection_flag() {
        let mut tbl = two_column_table();
        tbl.forbid_null(true);
        assert_eq!(tbl.write_null(), Err(StagingError::NullForbidden));
        tbl.forbid_null(false);
        tbl.write_null().unwrap();
    }

    #[test]
    fn four_byte_floats_round_through_f32() {
        let mut tbl = StagingTable::new(
            "t",
            StorageKind::Ram,
            &[ColumnSpec::list("v").with_four_byte_floats()],
        )
        .unwrap();
        tbl.write_double(0.1).unwrap();
        // 0.1 is not exactly representable in f32; the stored cell is the
        // f32 rounding, which the serializer then emits in 5 bytes.
        assert_eq!(tbl.nbytes(), 5);
    }

    #[test]
    fn trim_and_lazy_untrim() {
        let mut tbl = two_column_table();
        tbl.write_int(1).unwrap();
        tbl.trim().unwrap();
        assert!(matches!(tbl.backing, Backing::Trimmed(_)));
        // The next write transparently rebuilds the encoder.
        tbl.write_int(2).unwrap();
        assert!(matches!(tbl.backing, Backing::Live(_)));
        assert_eq!(tbl.ncells(), 2);
    }

    #[test]
    fn reset_clears_cells_and_analysis() {
        let mut tbl = two_column_table();
        tbl.write_string("s").unwrap();
        tbl.write_int(4).unwrap();
        tbl.reset().unwrap();
        assert_eq!(tbl.ncells(), 0);
        assert_eq!(tbl.nbytes(), 0);
        assert!(tbl.columns[0].analysis.all_integer);
        assert!(tbl.columns[1].analysis.all_numeric);
        tbl.write_int(1).unwrap();
        assert_eq!(tbl.ncells(), 1);
    }

    #[test]
    fn write_number_picks_integer_or_double() {
        let mut tbl = two_column_table();
        tbl.write_number(5.0).unwrap();
        tbl.write_number(5.5).unwrap();
        assert!(tbl.columns[0].analysis.all_integer);
        assert!(!tbl.columns[1].analysis.all_integer);
        assert!(tbl.columns[1].analysis.all_numeric);
    }

    #[cfg(feature = "file")]
    #[test]
    fn file_table_restores_cells_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sdb");
        let path = path.to_str().unwrap();
        let specs = [ColumnSpec::smallest("a"), ColumnSpec::smallest("b")];
        {
            let mut tbl = StagingTable::new(path, StorageKind::File, &specs).unwrap();
            tbl.write_int(10).unwrap();
            tbl.write_int(3).unwrap();
            tbl.write_int(20).unwrap();
            tbl.write_int(6).unwrap();
        }
        let tbl = StagingTable::new(path, StorageKind::File, &specs).unwrap();
        assert_eq!(tbl.ncells(), 4);
        assert_eq!(tbl.nrows(), 2);
        assert_eq!(tbl.columns[0].analysis.gcd, 10);
        assert_eq!(tbl.columns[1].analysis.gcd, 3);
    }
}
