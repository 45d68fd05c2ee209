use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    fitted_widths, splice_rows, Row, SheetStore, StoreResult, TabFormat, TabInfo, TabSnapshot,
    Workbook,
};
use crate::error::{CollaboratorError, FailureHint};

#[derive(Debug, Clone)]
struct TabData {
    id: u64,
    name: String,
    rows: Vec<Row>,
    format: TabFormat,
}

#[derive(Debug, Default)]
struct Inner {
    books: HashMap<String, Vec<TabData>>,
    next_tab_id: u64,
    write_failure: Option<CollaboratorError>,
}

/// In-memory workbooks, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySheetStore {
    inner: Mutex<Inner>,
}

impl MemorySheetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workbook(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.books.entry(id.to_string()).or_default();
    }

    /// Create or replace a tab with the given rows.
    pub fn put_tab(&self, workbook_id: &str, name: &str, rows: Vec<Row>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_tab_id += 1;
        let id = inner.next_tab_id;
        let tabs = inner.books.entry(workbook_id.to_string()).or_default();
        tabs.retain(|t| t.name != name);
        tabs.push(TabData {
            id,
            name: name.to_string(),
            rows,
            format: TabFormat::default(),
        });
        id
    }

    pub fn set_format(&self, workbook_id: &str, name: &str, format: TabFormat) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tab) = inner
            .books
            .get_mut(workbook_id)
            .and_then(|tabs| tabs.iter_mut().find(|t| t.name == name))
        {
            tab.format = format;
        }
    }

    pub fn rows(&self, workbook_id: &str, name: &str) -> Option<Vec<Row>> {
        let inner = self.inner.lock().unwrap();
        inner
            .books
            .get(workbook_id)?
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.rows.clone())
    }

    pub fn format(&self, workbook_id: &str, name: &str) -> Option<TabFormat> {
        let inner = self.inner.lock().unwrap();
        inner
            .books
            .get(workbook_id)?
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.format.clone())
    }

    pub fn tab_names(&self, workbook_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .books
            .get(workbook_id)
            .map(|tabs| tabs.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Make every subsequent `write_rows` fail with `err` (None clears it).
    pub fn fail_writes(&self, err: Option<CollaboratorError>) {
        self.inner.lock().unwrap().write_failure = err;
    }
}

impl SheetStore for MemorySheetStore {
    fn open(&self, workbook_id: &str) -> StoreResult<Box<dyn Workbook + '_>> {
        let inner = self.inner.lock().unwrap();
        if !inner.books.contains_key(workbook_id) {
            return Err(CollaboratorError::with_hint(
                format!("Workbook '{}' not found", workbook_id),
                FailureHint::NotFound,
            ));
        }
        Ok(Box::new(MemoryWorkbook {
            store: self,
            id: workbook_id.to_string(),
        }))
    }
}

struct MemoryWorkbook<'a> {
    store: &'a MemorySheetStore,
    id: String,
}

impl MemoryWorkbook<'_> {
    fn with_tabs<T>(&self, f: impl FnOnce(&mut Vec<TabData>, &mut u64) -> StoreResult<T>) -> StoreResult<T> {
        let mut inner = self.store.inner.lock().unwrap();
        let Inner {
            books, next_tab_id, ..
        } = &mut *inner;
        let tabs = books.get_mut(&self.id).ok_or_else(|| {
            CollaboratorError::with_hint(
                format!("Workbook '{}' not found", self.id),
                FailureHint::NotFound,
            )
        })?;
        f(tabs, next_tab_id)
    }

    fn missing(&self, name: &str) -> CollaboratorError {
        CollaboratorError::with_hint(
            format!("Tab '{}' not found in workbook '{}'", name, self.id),
            FailureHint::NotFound,
        )
    }
}

impl Workbook for MemoryWorkbook<'_> {
    fn id(&self) -> &str {
        &self.id
    }

    fn tab(&self, name: &str) -> StoreResult<Option<TabInfo>> {
        self.with_tabs(|tabs, _| {
            Ok(tabs.iter().find(|t| t.name == name).map(|t| TabInfo {
                tab_id: t.id,
                name: t.name.clone(),
            }))
        })
    }

    fn create_tab(&self, name: &str) -> StoreResult<TabInfo> {
        self.insert_snapshot(name, TabSnapshot::default())
    }

    fn delete_tab(&self, name: &str) -> StoreResult<()> {
        let missing = self.missing(name);
        self.with_tabs(|tabs, _| {
            let before = tabs.len();
            tabs.retain(|t| t.name != name);
            if tabs.len() == before {
                return Err(missing);
            }
            Ok(())
        })
    }

    fn clear_tab(&self, name: &str) -> StoreResult<()> {
        let missing = self.missing(name);
        self.with_tabs(|tabs, _| {
            let tab = tabs.iter_mut().find(|t| t.name == name).ok_or(missing)?;
            tab.rows.clear();
            Ok(())
        })
    }

    fn rename_tab(&self, from: &str, to: &str) -> StoreResult<()> {
        let missing = self.missing(from);
        self.with_tabs(|tabs, _| {
            if tabs.iter().any(|t| t.name == to) {
                return Err(CollaboratorError::new(format!(
                    "A tab named '{}' already exists",
                    to
                )));
            }
            let tab = tabs.iter_mut().find(|t| t.name == from).ok_or(missing)?;
            tab.name = to.to_string();
            Ok(())
        })
    }

    fn read_rows(&self, name: &str) -> StoreResult<Vec<Row>> {
        let missing = self.missing(name);
        self.with_tabs(|tabs, _| {
            tabs.iter()
                .find(|t| t.name == name)
                .map(|t| t.rows.clone())
                .ok_or(missing)
        })
    }

    fn write_rows(&self, name: &str, start_row: usize, rows: &[Row]) -> StoreResult<()> {
        if let Some(err) = self.store.inner.lock().unwrap().write_failure.clone() {
            return Err(err);
        }
        let missing = self.missing(name);
        self.with_tabs(|tabs, _| {
            let tab = tabs.iter_mut().find(|t| t.name == name).ok_or(missing)?;
            splice_rows(&mut tab.rows, start_row, rows);
            Ok(())
        })
    }

    fn snapshot(&self, name: &str) -> StoreResult<TabSnapshot> {
        let missing = self.missing(name);
        self.with_tabs(|tabs, _| {
            tabs.iter()
                .find(|t| t.name == name)
                .map(|t| TabSnapshot {
                    rows: t.rows.clone(),
                    format: t.format.clone(),
                })
                .ok_or(missing)
        })
    }

    fn insert_snapshot(&self, name: &str, snapshot: TabSnapshot) -> StoreResult<TabInfo> {
        self.with_tabs(|tabs, next_id| {
            if tabs.iter().any(|t| t.name == name) {
                return Err(CollaboratorError::new(format!(
                    "A tab named '{}' already exists",
                    name
                )));
            }
            *next_id += 1;
            tabs.push(TabData {
                id: *next_id,
                name: name.to_string(),
                rows: snapshot.rows,
                format: snapshot.format,
            });
            Ok(TabInfo {
                tab_id: *next_id,
                name: name.to_string(),
            })
        })
    }

    fn autofit_columns(&self, name: &str) -> StoreResult<()> {
        let missing = self.missing(name);
        self.with_tabs(|tabs, _| {
            let tab = tabs.iter_mut().find(|t| t.name == name).ok_or(missing)?;
            tab.format.column_widths = fitted_widths(&tab.rows);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_workbook_is_not_found() {
        let store = MemorySheetStore::new();
        let err = store.open("nope").err().unwrap();
        assert_eq!(err.hint, Some(FailureHint::NotFound));
    }

    #[test]
    fn recreated_tab_gets_new_identity() {
        let store = MemorySheetStore::new();
        store.add_workbook("b");
        let wb = store.open("b").unwrap();
        let first = wb.create_tab("T").unwrap();
        wb.delete_tab("T").unwrap();
        let second = wb.create_tab("T").unwrap();
        assert_ne!(first.tab_id, second.tab_id);
    }

    #[test]
    fn autofit_records_widths() {
        let store = MemorySheetStore::new();
        store.put_tab("b", "T", vec![vec!["abc".into(), "d".into()]]);
        store.open("b").unwrap().autofit_columns("T").unwrap();
        assert_eq!(store.format("b", "T").unwrap().column_widths, vec![3, 1]);
    }
}
