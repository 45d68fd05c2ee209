//! Resource and sheet-mode resolution.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CollaboratorError, TransferError};
use crate::rules::HandlingMode;
use crate::sheets::{last_row, Row, TabInfo, Workbook};

fn url_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/d/([A-Za-z0-9_-]+)").expect("static regex"))
}

fn raw_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

/// Extract a workbook id from a raw id or a shareable URL
/// (`https://host/spreadsheets/d/<id>/edit#gid=0`).
pub fn resolve_resource_id(input: &str) -> Result<String, TransferError> {
    let trimmed = input.trim();
    if trimmed.contains("://") || trimmed.contains("/d/") {
        return url_id_pattern()
            .captures(trimmed)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| TransferError::InvalidResource(trimmed.to_string()));
    }
    if raw_id_pattern().is_match(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(TransferError::InvalidResource(trimmed.to_string()))
    }
}

/// A destination tab made ready for writing under one handling mode.
#[derive(Debug, Clone)]
pub struct PreparedTab {
    pub tab: TabInfo,
    pub mode: HandlingMode,
    /// Rows holding data before the write (non-zero only for append).
    pub existing_rows: usize,
    pub created: bool,
}

impl PreparedTab {
    /// Write incoming data (header row first) and return the rows written.
    ///
    /// Append into a tab that already has data drops the incoming header and
    /// starts after the last data row; append into an empty tab keeps the
    /// header, like every other mode.
    pub fn write(&self, workbook: &dyn Workbook, rows: &[Row]) -> Result<usize, TransferError> {
        let (start, block) = if self.mode == HandlingMode::Append && self.existing_rows > 0 {
            (self.existing_rows, rows.get(1..).unwrap_or_default())
        } else {
            (0, rows)
        };
        if block.is_empty() {
            return Ok(0);
        }
        workbook
            .write_rows(&self.tab.name, start, block)
            .map_err(TransferError::destination)?;
        Ok(block.len())
    }
}

fn dest_err(err: CollaboratorError) -> TransferError {
    TransferError::destination(err)
}

/// Prepare `tab_name` in `workbook` for `mode`.
///
/// An absent tab is always created. `recreate` deletes and recreates the tab,
/// so anything holding the old tab identity is invalidated. `copyFormat` is
/// carried out by the sheet strategies; if it reaches here it behaves like
/// `clearAndReuse`.
pub fn prepare(
    workbook: &dyn Workbook,
    tab_name: &str,
    mode: HandlingMode,
) -> Result<PreparedTab, TransferError> {
    let Some(existing) = workbook.tab(tab_name).map_err(dest_err)? else {
        let tab = workbook.create_tab(tab_name).map_err(dest_err)?;
        log::info!("Created tab '{}' in workbook {}", tab_name, workbook.id());
        return Ok(PreparedTab {
            tab,
            mode,
            existing_rows: 0,
            created: true,
        });
    };

    match mode {
        HandlingMode::ClearAndReuse | HandlingMode::CopyFormat => {
            workbook.clear_tab(tab_name).map_err(dest_err)?;
            Ok(PreparedTab {
                tab: existing,
                mode,
                existing_rows: 0,
                created: false,
            })
        }
        HandlingMode::Recreate => {
            workbook.delete_tab(tab_name).map_err(dest_err)?;
            let tab = workbook.create_tab(tab_name).map_err(dest_err)?;
            Ok(PreparedTab {
                tab,
                mode,
                existing_rows: 0,
                created: true,
            })
        }
        HandlingMode::Append => {
            let rows = workbook.read_rows(tab_name).map_err(dest_err)?;
            Ok(PreparedTab {
                tab: existing,
                mode,
                existing_rows: last_row(&rows),
                created: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::sheets::{MemorySheetStore, SheetStore};

    fn rows(data: &[&[&str]]) -> Vec<Row> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn resolves_raw_ids_and_urls() {
        assert_eq!(resolve_resource_id("  abc-DEF_9 ").unwrap(), "abc-DEF_9");
        assert_eq!(
            resolve_resource_id("https://docs.google.com/spreadsheets/d/1AbC_d-e/edit#gid=0")
                .unwrap(),
            "1AbC_d-e"
        );
        let err = resolve_resource_id("https://example.com/no-id-here").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationInvalidResource);
        assert!(resolve_resource_id("has spaces").is_err());
    }

    #[test]
    fn absent_tab_is_created_for_every_mode() {
        for mode in [
            HandlingMode::ClearAndReuse,
            HandlingMode::Append,
            HandlingMode::Recreate,
            HandlingMode::CopyFormat,
        ] {
            let store = MemorySheetStore::new();
            store.add_workbook("b");
            let wb = store.open("b").unwrap();
            let prepared = prepare(wb.as_ref(), "T", mode).unwrap();
            assert!(prepared.created);
            assert!(wb.tab("T").unwrap().is_some());
        }
    }

    #[test]
    fn clear_and_reuse_is_idempotent() {
        let store = MemorySheetStore::new();
        let id = store.put_tab("b", "T", rows(&[&["h"], &["1"], &["2"]]));
        let wb = store.open("b").unwrap();

        let first = prepare(wb.as_ref(), "T", HandlingMode::ClearAndReuse).unwrap();
        assert_eq!(first.tab.tab_id, id);
        assert!(store.rows("b", "T").unwrap().is_empty());

        let second = prepare(wb.as_ref(), "T", HandlingMode::ClearAndReuse).unwrap();
        assert_eq!(second.tab.tab_id, id);
        assert!(store.rows("b", "T").unwrap().is_empty());
    }

    #[test]
    fn recreate_changes_identity() {
        let store = MemorySheetStore::new();
        let id = store.put_tab("b", "T", rows(&[&["h"], &["1"]]));
        let wb = store.open("b").unwrap();
        let prepared = prepare(wb.as_ref(), "T", HandlingMode::Recreate).unwrap();
        assert_ne!(prepared.tab.tab_id, id);
        assert!(store.rows("b", "T").unwrap().is_empty());
    }

    #[test]
    fn append_keeps_existing_rows_and_drops_header() {
        let store = MemorySheetStore::new();
        let before = rows(&[&["id", "v"], &["1", "a"], &["2", "b"]]);
        store.put_tab("b", "T", before.clone());
        let wb = store.open("b").unwrap();

        let prepared = prepare(wb.as_ref(), "T", HandlingMode::Append).unwrap();
        assert_eq!(prepared.existing_rows, 3);
        let incoming = rows(&[&["id", "v"], &["3", "c"], &["4", "d"]]);
        let written = prepared.write(wb.as_ref(), &incoming).unwrap();
        assert_eq!(written, 2);

        let after = store.rows("b", "T").unwrap();
        assert_eq!(after.len(), 3 + (3 - 1));
        assert_eq!(&after[..3], &before[..]);
        assert_eq!(after[3], vec!["3".to_string(), "c".to_string()]);
    }

    #[test]
    fn append_into_empty_tab_keeps_header() {
        let store = MemorySheetStore::new();
        store.put_tab("b", "T", Vec::new());
        let wb = store.open("b").unwrap();
        let prepared = prepare(wb.as_ref(), "T", HandlingMode::Append).unwrap();
        let incoming = rows(&[&["id"], &["1"], &["2"]]);
        assert_eq!(prepared.write(wb.as_ref(), &incoming).unwrap(), 3);
        assert_eq!(store.rows("b", "T").unwrap(), incoming);
    }
}
