//! Consolidation: reducing every row of a source table into a single row
//! appended to a destination table.
//!
//! Each destination column takes its value from one source column through a
//! method: positional methods (first/middle/last) keep one source cell's
//! encoded bytes and copy them verbatim, numeric reducers fold every cell
//! of the column into one number. A consolidation run holds both tables
//! exclusively for its duration.

use crate::codec::deserializer::{Data, Value};
use crate::staging::cursor::CellCursor;
use crate::staging::enums::TableState;
use crate::staging::error::StagingError;
use crate::staging::table::StagingTable;
use derive_new::new;
use log::debug;

/// Ways to reduce a source column into a single destination cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationMethod {
    /// Copy the first cell of the column verbatim.
    First,
    /// Copy the last cell of the column verbatim.
    Last,
    /// Copy the middle cell of the column verbatim.
    Middle,
    Max,
    Min,
    Mean,
    Sum,
    /// Collects the column, sorts it, and takes the middle element.
    Median,
}

/// One destination column: which source column it reduces, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct ConsolidationColumn {
    pub src_column: usize,
    pub method: ConsolidationMethod,
}

/// Consolidation configuration of a source table: one entry per column of
/// the destination table, in destination order.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationSpec {
    pub columns: Vec<ConsolidationColumn>,
}

impl ConsolidationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a destination column fed from `src_column` by `method`.
    pub fn column(mut self, src_column: usize, method: ConsolidationMethod) -> Self {
        self.columns.push(ConsolidationColumn::new(src_column, method));
        self
    }
}

enum Acc {
    /// Running extreme; `true` picks the maximum.
    Extreme(bool, Option<f64>),
    Sum(f64),
    Median(Vec<f64>),
    /// (offset, length) of the retained source cell.
    Stream(Option<(usize, usize)>),
}

/// Folds the cells of one source column for one destination column.
struct Reducer {
    method: ConsolidationMethod,
    broken: bool,
    iteration: usize,
    nrows: usize,
    acc: Acc,
}

enum Outcome {
    Null,
    Number(f64),
    Copy(usize, usize),
}

impl Reducer {
    fn new(method: ConsolidationMethod, nrows: usize) -> Reducer {
        let acc = match method {
            ConsolidationMethod::Max => Acc::Extreme(true, None),
            ConsolidationMethod::Min => Acc::Extreme(false, None),
            ConsolidationMethod::Mean | ConsolidationMethod::Sum => Acc::Sum(0.0),
            ConsolidationMethod::Median => Acc::Median(Vec::with_capacity(nrows)),
            _ => Acc::Stream(None),
        };
        Reducer {
            method,
            broken: false,
            iteration: 0,
            nrows,
            acc,
        }
    }

    fn reduce(&mut self, value: Option<f64>, offset: usize, length: usize) {
        if self.broken {
            return;
        }
        let i = self.iteration;
        self.iteration += 1;
        match &mut self.acc {
            Acc::Stream(pos) => {
                let keep = match self.method {
                    ConsolidationMethod::First => i == 0,
                    ConsolidationMethod::Last => i == self.nrows - 1,
                    _ => i == self.nrows / 2,
                };
                if keep {
                    *pos = Some((offset, length));
                }
            }
            acc => {
                // Numeric reduction; any non-numeric cell breaks it.
                let Some(d) = value else {
                    self.broken = true;
                    return;
                };
                match acc {
                    Acc::Extreme(want_max, cur) => {
                        let better = match cur {
                            None => true,
                            Some(c) => {
                                if *want_max {
                                    d > *c
                                } else {
                                    d < *c
                                }
                            }
                        };
                        if better {
                            *cur = Some(d);
                        }
                    }
                    Acc::Sum(sum) => *sum += d,
                    Acc::Median(values) => values.push(d),
                    Acc::Stream(_) => unreachable!(),
                }
            }
        }
    }

    fn outcome(self) -> Outcome {
        if self.broken {
            return Outcome::Null;
        }
        match self.acc {
            Acc::Stream(Some((offset, length))) => Outcome::Copy(offset, length),
            Acc::Stream(None) => Outcome::Null,
            Acc::Extreme(_, Some(x)) => Outcome::Number(x),
            Acc::Extreme(_, None) => Outcome::Null,
            Acc::Sum(sum) => {
                if self.method == ConsolidationMethod::Mean {
                    Outcome::Number(sum / self.nrows as f64)
                } else {
                    Outcome::Number(sum)
                }
            }
            Acc::Median(mut values) => {
                if values.is_empty() {
                    return Outcome::Null;
                }
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal));
                Outcome::Number(values[values.len() / 2])
            }
        }
    }
}

fn numeric_of(data: &Data<'_>) -> Option<f64> {
    match data.value {
        Value::Int(i) => Some(i as f64),
        Value::Double(d) => Some(d),
        _ => None,
    }
}

impl StagingTable {
    /// Declares how this table consolidates into a destination table. One
    /// [ConsolidationColumn] per destination column, in destination order.
    /// A table carries at most one consolidation.
    pub fn set_consolidation(&mut self, spec: ConsolidationSpec) -> Result<(), StagingError> {
        if matches!(self.state, TableState::Broken | TableState::Unconfigured) {
            return Err(StagingError::BadState);
        }
        if self.consolidation.is_some() {
            return Err(StagingError::Invalid);
        }
        if spec.columns.iter().any(|c| c.src_column >= self.ncolumns()) {
            return Err(StagingError::Invalid);
        }
        self.consolidation = Some(spec);
        Ok(())
    }

    /// Runs the configured consolidation, appending exactly one row to
    /// `dst`. Both tables must be in reading state; the source rows are
    /// left untouched.
    pub fn consolidate(&mut self, dst: &mut StagingTable) -> Result<(), StagingError> {
        let spec = self
            .consolidation
            .as_ref()
            .ok_or(StagingError::NoConsolidation)?
            .columns
            .clone();
        let ncols = self.ncolumns();
        if spec.len() != dst.ncolumns() {
            return Err(StagingError::Invalid);
        }
        let nrows = self.nrows();
        if nrows == 0 {
            return Err(StagingError::Empty);
        }
        if self.state != TableState::Reading || dst.state != TableState::Reading {
            return Err(StagingError::BadState);
        }

        // Source column -> destination columns fed by it.
        let mut matrix: Vec<Vec<usize>> = vec![Vec::new(); ncols];
        for (dst_col, entry) in spec.iter().enumerate() {
            matrix[entry.src_column].push(dst_col);
        }
        debug!(
            "consolidating '{}' ({} rows) into '{}'",
            self.id(),
            nrows,
            dst.id()
        );

        let mut reducers: Vec<Reducer> =
            spec.iter().map(|e| Reducer::new(e.method, nrows)).collect();

        let mut cursor = CellCursor::new(self.storage())?;
        for _row in 0..nrows {
            for feeds in &matrix {
                let (offset, size, value) = {
                    let cell = cursor
                        .next(self.storage(), feeds.is_empty())?
                        .ok_or(StagingError::Internal)?;
                    (
                        cell.offset,
                        cell.size,
                        cell.value.as_ref().and_then(numeric_of),
                    )
                };
                for &dst_col in feeds {
                    reducers[dst_col].reduce(value, offset, size);
                }
            }
        }

        for reducer in reducers {
            match reducer.outcome() {
                Outcome::Null => dst.write_null()?,
                Outcome::Number(x) => dst.write_number(x)?,
                Outcome::Copy(offset, length) => {
                    // The bytes are already a valid GLOBAL-context cell;
                    // copy them without re-encoding.
                    match cursor.cell_bytes(self.storage(), offset, length) {
                        Ok(bytes) => dst.append_consolidated(bytes)?,
                        Err(_) => dst.write_null()?,
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::cursor::CellCursor;
    use crate::staging::enums::{ColumnSpec, StorageKind};

    fn src_table(rows: &[(i64, f64)]) -> StagingTable {
        let mut tbl = StagingTable::new(
            "src",
            StorageKind::Ram,
            &[ColumnSpec::list("t"), ColumnSpec::list("v")],
        )
        .unwrap();
        for (t, v) in rows {
            tbl.write_int(*t).unwrap();
            tbl.write_double(*v).unwrap();
        }
        tbl
    }

    fn dst_table(ncols: usize) -> StagingTable {
        let specs: Vec<ColumnSpec> = (0..ncols)
            .map(|i| ColumnSpec::list(format!("c{i}")))
            .collect();
        StagingTable::new("dst", StorageKind::Ram, &specs).unwrap()
    }

    fn dst_values(dst: &StagingTable) -> Vec<Value<'static>> {
        let mut out = Vec::new();
        let mut cursor = CellCursor::new(dst.storage()).unwrap();
        loop {
            let storage = dst.storage();
            match cursor.next(storage, false).unwrap() {
                None => break,
                Some(cell) => out.push(match cell.value.unwrap().value {
                    Value::Int(i) => Value::Int(i),
                    Value::Double(d) => Value::Double(d),
                    Value::Null => Value::Null,
                    Value::Bool(b) => Value::Bool(b),
                    _ => Value::Null,
                }),
            }
        }
        out
    }

    #[test]
    fn numeric_reducers() {
        let mut src = src_table(&[(10, 1.5), (20, 2.5), (30, 7.0)]);
        let mut dst = dst_table(4);
        src.set_consolidation(
            ConsolidationSpec::new()
                .column(0, ConsolidationMethod::Min)
                .column(0, ConsolidationMethod::Max)
                .column(1, ConsolidationMethod::Sum)
                .column(1, ConsolidationMethod::Mean),
        )
        .unwrap();
        src.consolidate(&mut dst).unwrap();
        assert_eq!(dst.ncells(), 4);
        assert_eq!(
            dst_values(&dst),
            vec![
                Value::Int(10),
                Value::Int(30),
                Value::Int(11), // 1.5 + 2.5 + 7.0 stored as an exact integer
                Value::Double(11.0 / 3.0),
            ]
        );
    }

    #[test]
    fn positional_methods_copy_cells_verbatim() {
        let mut src = src_table(&[(10, 0.5), (20, 1.5), (30, 2.5)]);
        let mut dst = dst_table(3);
        src.set_consolidation(
            ConsolidationSpec::new()
                .column(0, ConsolidationMethod::First)
                .column(0, ConsolidationMethod::Middle)
                .column(0, ConsolidationMethod::Last),
        )
        .unwrap();
        src.consolidate(&mut dst).unwrap();
        assert_eq!(
            dst_values(&dst),
            vec![Value::Int(10), Value::Int(20), Value::Int(30)]
        );
    }

    #[test]
    fn median_takes_middle_of_sorted() {
        let mut src = src_table(&[(5, 0.0), (1, 0.0), (9, 0.0), (3, 0.0), (7, 0.0)]);
        let mut dst = dst_table(1);
        src.set_consolidation(
            ConsolidationSpec::new().column(0, ConsolidationMethod::Median),
        )
        .unwrap();
        src.consolidate(&mut dst).unwrap();
        assert_eq!(dst_values(&dst), vec![Value::Int(5)]);
    }

    #[test]
    fn non_numeric_cell_breaks_reducer_to_null() {
        let mut src = StagingTable::new(
            "src",
            StorageKind::Ram,
            &[ColumnSpec::list("v")],
        )
        .unwrap();
        src.write_int(1).unwrap();
        src.write_string("oops").unwrap();
        src.write_int(3).unwrap();
        let mut dst = dst_table(1);
        src.set_consolidation(ConsolidationSpec::new().column(0, ConsolidationMethod::Sum))
            .unwrap();
        src.consolidate(&mut dst).unwrap();
        assert_eq!(dst_values(&dst), vec![Value::Null]);
    }

    #[test]
    fn repeated_consolidations_accumulate_rows() {
        let mut dst = dst_table(1);
        for round in 0..3 {
            let mut src = src_table(&[(round, 0.0), (round + 1, 0.0)]);
            src.set_consolidation(
                ConsolidationSpec::new().column(0, ConsolidationMethod::Last),
            )
            .unwrap();
            src.consolidate(&mut dst).unwrap();
        }
        assert_eq!(dst.nrows(), 3);
        assert_eq!(
            dst_values(&dst),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn empty_source_is_rejected() {
        let mut src = src_table(&[]);
        let mut dst = dst_table(1);
        src.set_consolidation(ConsolidationSpec::new().column(0, ConsolidationMethod::Sum))
            .unwrap();
        assert_eq!(src.consolidate(&mut dst), Err(StagingError::Empty));
    }

    #[test]
    fn spec_is_validated() {
        let mut src = src_table(&[(1, 1.0)]);
        // Source column out of range.
        assert_eq!(
            src.set_consolidation(
                ConsolidationSpec::new().column(7, ConsolidationMethod::Sum)
            ),
            Err(StagingError::Invalid)
        );
        // Column count mismatch against the destination.
        src.set_consolidation(ConsolidationSpec::new().column(0, ConsolidationMethod::Sum))
            .unwrap();
        let mut dst = dst_table(2);
        assert_eq!(src.consolidate(&mut dst), Err(StagingError::Invalid));
        // Only one consolidation per table.
        assert_eq!(
            src.set_consolidation(
                ConsolidationSpec::new().column(0, ConsolidationMethod::Sum)
            ),
            Err(StagingError::Invalid)
        );
    }
}
