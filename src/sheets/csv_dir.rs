//! Workbooks stored on disk: one directory per workbook holding a
//! `manifest.json` (tab order, identities, formatting) and one CSV file per
//! tab named after its identity, so renames never touch the data file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{
    fitted_widths, splice_rows, Row, SheetStore, StoreResult, TabFormat, TabInfo, TabSnapshot,
    Workbook,
};
use crate::error::{CollaboratorError, FailureHint};

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TabEntry {
    id: u64,
    name: String,
    #[serde(default)]
    format: TabFormat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    next_tab_id: u64,
    #[serde(default)]
    tabs: Vec<TabEntry>,
}

pub struct CsvSheetStore {
    root: PathBuf,
}

impl CsvSheetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create an empty workbook directory if it does not exist yet.
    pub fn create_workbook(&self, id: &str) -> StoreResult<()> {
        let dir = self.root.join(id);
        fs::create_dir_all(&dir)?;
        let manifest = dir.join(MANIFEST);
        if !manifest.exists() {
            write_manifest(&dir, &Manifest::default())?;
        }
        Ok(())
    }
}

impl SheetStore for CsvSheetStore {
    fn open(&self, workbook_id: &str) -> StoreResult<Box<dyn Workbook + '_>> {
        let dir = self.root.join(workbook_id);
        if !dir.is_dir() {
            return Err(CollaboratorError::with_hint(
                format!("Workbook '{}' not found under {}", workbook_id, self.root.display()),
                FailureHint::NotFound,
            ));
        }
        Ok(Box::new(CsvWorkbook {
            id: workbook_id.to_string(),
            dir,
        }))
    }
}

fn read_manifest(dir: &Path) -> StoreResult<Manifest> {
    let path = dir.join(MANIFEST);
    if !path.exists() {
        return Ok(Manifest::default());
    }
    let data = fs::read_to_string(&path)?;
    serde_json::from_str(&data)
        .map_err(|e| CollaboratorError::new(format!("Corrupt manifest {}: {}", path.display(), e)))
}

fn write_manifest(dir: &Path, manifest: &Manifest) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| CollaboratorError::new(e.to_string()))?;
    fs::write(dir.join(MANIFEST), json)?;
    Ok(())
}

fn read_csv(path: &Path) -> StoreResult<Vec<Row>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| CollaboratorError::new(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            CollaboratorError::new(format!("Failed to read {}: {}", path.display(), e))
        })?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn write_csv(path: &Path, rows: &[Row]) -> StoreResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| CollaboratorError::new(format!("Failed to write {}: {}", path.display(), e)))?;
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| CollaboratorError::new(format!("Failed to write {}: {}", path.display(), e)))?;
    }
    writer.flush()?;
    Ok(())
}

struct CsvWorkbook {
    id: String,
    dir: PathBuf,
}

impl CsvWorkbook {
    fn data_path(&self, tab_id: u64) -> PathBuf {
        self.dir.join(format!("tab-{}.csv", tab_id))
    }

    fn entry(&self, manifest: &Manifest, name: &str) -> StoreResult<TabEntry> {
        manifest
            .tabs
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| {
                CollaboratorError::with_hint(
                    format!("Tab '{}' not found in workbook '{}'", name, self.id),
                    FailureHint::NotFound,
                )
            })
    }
}

impl Workbook for CsvWorkbook {
    fn id(&self) -> &str {
        &self.id
    }

    fn tab(&self, name: &str) -> StoreResult<Option<TabInfo>> {
        let manifest = read_manifest(&self.dir)?;
        Ok(manifest
            .tabs
            .iter()
            .find(|t| t.name == name)
            .map(|t| TabInfo {
                tab_id: t.id,
                name: t.name.clone(),
            }))
    }

    fn create_tab(&self, name: &str) -> StoreResult<TabInfo> {
        self.insert_snapshot(name, TabSnapshot::default())
    }

    fn delete_tab(&self, name: &str) -> StoreResult<()> {
        let mut manifest = read_manifest(&self.dir)?;
        let entry = self.entry(&manifest, name)?;
        manifest.tabs.retain(|t| t.id != entry.id);
        write_manifest(&self.dir, &manifest)?;
        let path = self.data_path(entry.id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn clear_tab(&self, name: &str) -> StoreResult<()> {
        let manifest = read_manifest(&self.dir)?;
        let entry = self.entry(&manifest, name)?;
        write_csv(&self.data_path(entry.id), &[])
    }

    fn rename_tab(&self, from: &str, to: &str) -> StoreResult<()> {
        let mut manifest = read_manifest(&self.dir)?;
        if manifest.tabs.iter().any(|t| t.name == to) {
            return Err(CollaboratorError::new(format!(
                "A tab named '{}' already exists",
                to
            )));
        }
        let entry = self.entry(&manifest, from)?;
        for tab in &mut manifest.tabs {
            if tab.id == entry.id {
                tab.name = to.to_string();
            }
        }
        write_manifest(&self.dir, &manifest)
    }

    fn read_rows(&self, name: &str) -> StoreResult<Vec<Row>> {
        let manifest = read_manifest(&self.dir)?;
        let entry = self.entry(&manifest, name)?;
        read_csv(&self.data_path(entry.id))
    }

    fn write_rows(&self, name: &str, start_row: usize, rows: &[Row]) -> StoreResult<()> {
        let manifest = read_manifest(&self.dir)?;
        let entry = self.entry(&manifest, name)?;
        let path = self.data_path(entry.id);
        let mut existing = read_csv(&path)?;
        splice_rows(&mut existing, start_row, rows);
        write_csv(&path, &existing)
    }

    fn snapshot(&self, name: &str) -> StoreResult<TabSnapshot> {
        let manifest = read_manifest(&self.dir)?;
        let entry = self.entry(&manifest, name)?;
        Ok(TabSnapshot {
            rows: read_csv(&self.data_path(entry.id))?,
            format: entry.format,
        })
    }

    fn insert_snapshot(&self, name: &str, snapshot: TabSnapshot) -> StoreResult<TabInfo> {
        let mut manifest = read_manifest(&self.dir)?;
        if manifest.tabs.iter().any(|t| t.name == name) {
            return Err(CollaboratorError::new(format!(
                "A tab named '{}' already exists",
                name
            )));
        }
        manifest.next_tab_id += 1;
        let id = manifest.next_tab_id;
        write_csv(&self.data_path(id), &snapshot.rows)?;
        manifest.tabs.push(TabEntry {
            id,
            name: name.to_string(),
            format: snapshot.format,
        });
        write_manifest(&self.dir, &manifest)?;
        Ok(TabInfo {
            tab_id: id,
            name: name.to_string(),
        })
    }

    fn autofit_columns(&self, name: &str) -> StoreResult<()> {
        let mut manifest = read_manifest(&self.dir)?;
        let entry = self.entry(&manifest, name)?;
        let widths = fitted_widths(&read_csv(&self.data_path(entry.id))?);
        for tab in &mut manifest.tabs {
            if tab.id == entry.id {
                tab.format.column_widths = widths.clone();
            }
        }
        write_manifest(&self.dir, &manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn tabs_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvSheetStore::new(dir.path());
        store.create_workbook("book").unwrap();
        let wb = store.open("book").unwrap();

        wb.create_tab("Data").unwrap();
        wb.write_rows("Data", 0, &[row(&["name", "note"]), row(&["a", "x, y"])])
            .unwrap();
        wb.write_rows("Data", 2, &[row(&["b", "z"])]).unwrap();

        assert_eq!(
            wb.read_rows("Data").unwrap(),
            vec![row(&["name", "note"]), row(&["a", "x, y"]), row(&["b", "z"])]
        );
    }

    #[test]
    fn rename_keeps_data_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvSheetStore::new(dir.path());
        store.create_workbook("book").unwrap();
        let wb = store.open("book").unwrap();

        let info = wb.create_tab("Old").unwrap();
        wb.write_rows("Old", 0, &[row(&["1"])]).unwrap();
        wb.rename_tab("Old", "New").unwrap();

        assert!(wb.tab("Old").unwrap().is_none());
        assert_eq!(wb.tab("New").unwrap().unwrap().tab_id, info.tab_id);
        assert_eq!(wb.read_rows("New").unwrap(), vec![row(&["1"])]);
    }

    #[test]
    fn clear_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvSheetStore::new(dir.path());
        store.create_workbook("book").unwrap();
        let wb = store.open("book").unwrap();

        wb.create_tab("T").unwrap();
        wb.write_rows("T", 0, &[row(&["1", "2"])]).unwrap();
        wb.clear_tab("T").unwrap();
        assert!(wb.read_rows("T").unwrap().is_empty());

        wb.delete_tab("T").unwrap();
        assert!(wb.tab("T").unwrap().is_none());
        assert!(wb.read_rows("T").is_err());
    }

    #[test]
    fn missing_workbook_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvSheetStore::new(dir.path());
        assert_eq!(store.open("ghost").err().unwrap().hint, Some(FailureHint::NotFound));
    }
}
