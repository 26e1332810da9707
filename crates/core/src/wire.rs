//! Wire-level values exchanged with the remote transport
//!
//! The transport itself is opaque. These types are the contract at its edge:
//! encoded parameters going out, a buffered [`RawResult`] coming back.

use crate::types::TypeId;
use std::collections::VecDeque;

/// Encoding of parameters and result columns on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Textual representation
    Text,
    /// Binary send/receive representation
    Binary,
}

/// One encoded, non-null field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    /// Text encoding
    Text(String),
    /// Binary encoding
    Binary(Vec<u8>),
}

impl WireValue {
    /// Format this field is encoded in
    pub fn format(&self) -> WireFormat {
        match self {
            WireValue::Text(_) => WireFormat::Text,
            WireValue::Binary(_) => WireFormat::Binary,
        }
    }
}

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireParam {
    /// Declared type of the parameter
    pub type_id: TypeId,
    /// Encoded value; `None` is SQL NULL
    pub value: Option<WireValue>,
}

/// A result column as described by the remote node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    /// Column name
    pub name: String,
    /// Column type
    pub type_id: TypeId,
}

/// One result row; `None` fields are SQL NULL
pub type WireRow = Vec<Option<WireValue>>;

/// Complete result of one remote statement, consumed row by row
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    columns: Vec<ColumnDesc>,
    rows: VecDeque<WireRow>,
}

impl RawResult {
    /// Result with the given columns and rows
    pub fn new(columns: Vec<ColumnDesc>, rows: Vec<WireRow>) -> Self {
        RawResult {
            columns,
            rows: rows.into(),
        }
    }

    /// Result of a statement that returns no rows
    pub fn empty() -> Self {
        RawResult::default()
    }

    /// Column descriptions
    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    /// Rows not yet fetched
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Next row, or `None` once the cursor is exhausted
    pub fn fetch_row(&mut self) -> Option<WireRow> {
        self.rows.pop_front()
    }
}
