//! Spreadsheet collaborator interface.
//!
//! A [`SheetStore`] opens workbooks by id; a [`Workbook`] addresses its tabs by
//! name. Handles are cheap and take `&self`: implementations keep their state
//! behind a lock or on disk, so source and destination may be the same
//! workbook.

use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

mod csv_dir;
mod memory;

pub use csv_dir::CsvSheetStore;
pub use memory::MemorySheetStore;

pub type Row = Vec<String>;

pub type StoreResult<T> = Result<T, CollaboratorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    /// Stable identity; a recreated tab gets a new one.
    pub tab_id: u64,
    pub name: String,
}

/// Cosmetic tab state carried along by format-preserving copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabFormat {
    #[serde(default)]
    pub column_widths: Vec<u32>,
    #[serde(default)]
    pub frozen_rows: u32,
    #[serde(default)]
    pub header_bold: bool,
}

/// Everything needed to reproduce a tab elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabSnapshot {
    pub rows: Vec<Row>,
    pub format: TabFormat,
}

pub trait SheetStore: Send + Sync {
    fn open(&self, workbook_id: &str) -> StoreResult<Box<dyn Workbook + '_>>;
}

pub trait Workbook {
    fn id(&self) -> &str;

    fn tab(&self, name: &str) -> StoreResult<Option<TabInfo>>;

    fn create_tab(&self, name: &str) -> StoreResult<TabInfo>;

    fn delete_tab(&self, name: &str) -> StoreResult<()>;

    fn clear_tab(&self, name: &str) -> StoreResult<()>;

    fn rename_tab(&self, from: &str, to: &str) -> StoreResult<()>;

    fn read_rows(&self, name: &str) -> StoreResult<Vec<Row>>;

    /// Write `rows` starting at zero-based row `start_row`, overwriting cells
    /// in that range and growing the tab as needed.
    fn write_rows(&self, name: &str, start_row: usize, rows: &[Row]) -> StoreResult<()>;

    fn snapshot(&self, name: &str) -> StoreResult<TabSnapshot>;

    /// Create tab `name` from a snapshot taken from any workbook.
    fn insert_snapshot(&self, name: &str, snapshot: TabSnapshot) -> StoreResult<TabInfo>;

    /// Resize columns to their content. Stores without column widths ignore it.
    fn autofit_columns(&self, _name: &str) -> StoreResult<()> {
        Ok(())
    }
}

/// Index one past the last row holding any non-empty cell.
pub fn last_row(rows: &[Row]) -> usize {
    rows.iter()
        .rposition(|row| row.iter().any(|cell| !cell.is_empty()))
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Widest row.
pub fn column_count(rows: &[Row]) -> usize {
    rows.iter().map(Vec::len).max().unwrap_or(0)
}

/// Pad ragged rows so the block is rectangular.
pub fn normalize_rows(mut rows: Vec<Row>) -> Vec<Row> {
    let width = column_count(&rows);
    for row in &mut rows {
        row.resize(width, String::new());
    }
    rows
}

/// Character width of each column, used by stores that track widths.
pub fn fitted_widths(rows: &[Row]) -> Vec<u32> {
    let mut widths = vec![0u32; column_count(rows)];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count() as u32);
        }
    }
    widths
}

/// Overwrite `target` in place starting at `start_row`.
pub(crate) fn splice_rows(target: &mut Vec<Row>, start_row: usize, rows: &[Row]) {
    if target.len() < start_row + rows.len() {
        target.resize(start_row + rows.len(), Vec::new());
    }
    for (offset, row) in rows.iter().enumerate() {
        let existing = &mut target[start_row + offset];
        if existing.len() < row.len() {
            existing.resize(row.len(), String::new());
        }
        for (i, cell) in row.iter().enumerate() {
            existing[i] = cell.clone();
        }
    }
}
