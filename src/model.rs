//! Result-materialization capabilities.
//!
//! Readers hand every decoded column to a [`ColumnScanner`] and every
//! finished row to a [`Model`]; the engine itself never keeps row data.

use crate::error::ModelError;

/// Receives the columns of a single row, in wire order.
///
/// `value` is `None` for SQL NULL. The byte slice is only valid for the
/// duration of the call; implementations copy what they keep.
pub trait ColumnScanner {
    fn scan_column(
        &mut self,
        index: usize,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), ModelError>;
}

/// Accumulates rows of a result set.
pub trait Model {
    type Row: ColumnScanner;

    /// Clears any state from a previous result set.
    fn reset(&mut self) -> Result<(), ModelError>;

    /// Produces the scan target for the next row.
    fn new_row(&mut self) -> Self::Row;

    /// Accepts a fully scanned row.
    fn add_row(&mut self, row: Self::Row) -> Result<(), ModelError>;
}

/// A model that ignores every row.
///
/// Readers fall back to it when model creation fails mid-response: the
/// first error is preserved while the remaining messages are still drained
/// to the synchronization point.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl ColumnScanner for Discard {
    fn scan_column(
        &mut self,
        _index: usize,
        _name: &str,
        _value: Option<&[u8]>,
    ) -> Result<(), ModelError> {
        Ok(())
    }
}

impl Model for Discard {
    type Row = Discard;

    fn reset(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    fn new_row(&mut self) -> Discard {
        Discard
    }

    fn add_row(&mut self, _row: Discard) -> Result<(), ModelError> {
        Ok(())
    }
}

/// A model collecting every column as text, mostly useful in tests and
/// one-off tooling.
#[derive(Debug, Default)]
pub struct TextRows {
    rows: Vec<Vec<Option<String>>>,
}

impl TextRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }
}

/// One in-flight row of a [`TextRows`] model.
#[derive(Debug, Default)]
pub struct TextRow {
    columns: Vec<Option<String>>,
}

impl ColumnScanner for TextRow {
    fn scan_column(
        &mut self,
        _index: usize,
        _name: &str,
        value: Option<&[u8]>,
    ) -> Result<(), ModelError> {
        self.columns
            .push(value.map(|v| String::from_utf8_lossy(v).into_owned()));
        Ok(())
    }
}

impl Model for TextRows {
    type Row = TextRow;

    fn reset(&mut self) -> Result<(), ModelError> {
        self.rows.clear();
        Ok(())
    }

    fn new_row(&mut self) -> TextRow {
        TextRow::default()
    }

    fn add_row(&mut self, row: TextRow) -> Result<(), ModelError> {
        self.rows.push(row.columns);
        Ok(())
    }
}
