//! The control workbook as a tiny row store.
//!
//! Physical layout is fixed by the external `GI-FO-012` format: rows 1-6 are
//! a non-data banner, row 7 is the column header, data starts at row 8.
//! Records are keyed by (identity number, visit date); an upsert either
//! merges into the matching row (non-empty values only, item number kept) or
//! appends with the next sequential item number.
//!
//! Reads go through calamine, in-place cell writes through edit_xlsx so the
//! banner and header formatting survive, and a missing workbook is created
//! with rust_xlsxwriter. The read-modify-write is not atomic against
//! concurrent writers; the pipeline runs one interactive session at a time
//! and last-writer-wins is accepted.

use crate::dates::normalize_date;
use crate::errors::{ProcessError, Result};
use crate::rules::{SENTINEL_NONE, SENTINEL_NOT_FOUND};
use crate::types::{UpsertAction, UpsertOutcome};
use calamine::{open_workbook_auto, DataType, Reader};
use edit_xlsx::Write;
use regex::Regex;
use rust_xlsxwriter::XlsxError;
use std::collections::BTreeMap;
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Row 7 (0-based index 6) holds the column header.
const HEADER_ROW_INDEX: usize = 6;
/// Data starts at row 8.
const FIRST_DATA_ROW_INDEX: usize = 7;

/// Fixed column set of the control workbook, in physical order.
pub const CONTROL_COLUMNS: &[&str] = &[
    "Item",
    "Nombre Completo",
    "No. Identificación",
    "Fecha Nac",
    "Edad",
    "Sexo",
    "Afiliación",
    "Estado civil",
    "Evaluación Ocupacional",
    "Fecha de Atención",
    "Cargo",
    "Exámenes realizados",
    "Recomendaciones Laborales",
    "Incluir SVE",
    "Restricciones Laborales",
    "Concepto medico laboral",
    "Concepto Medico",
    "Concepto Manipulación Alimento",
    "Concepto Altura",
    "Concepto de trabajo en espacios confinados",
    "Motivo de Restricción",
];

/// Canonical field key → workbook column header.
const FIELD_COLUMNS: &[(&str, &str)] = &[
    ("Nombre_Completo", "Nombre Completo"),
    ("No_Identificacion", "No. Identificación"),
    ("Fecha_Nac", "Fecha Nac"),
    ("Edad", "Edad"),
    ("Sexo", "Sexo"),
    ("Afiliacion", "Afiliación"),
    ("Estado_Civil", "Estado civil"),
    ("Evaluacion_Ocupacional", "Evaluación Ocupacional"),
    ("Fecha_Atencion", "Fecha de Atención"),
    ("Cargo", "Cargo"),
    ("Examenes_Realizados", "Exámenes realizados"),
    ("Recomendaciones_Laborales", "Recomendaciones Laborales"),
    ("Incluir_SVE", "Incluir SVE"),
    ("Restricciones_Laborales", "Restricciones Laborales"),
    ("Concepto_Medico", "Concepto Medico"),
    ("Concepto_Manipulacion_Alimento", "Concepto Manipulación Alimento"),
    ("Concepto_Altura", "Concepto Altura"),
    ("Concepto_Espacios_Confinados", "Concepto de trabajo en espacios confinados"),
    ("Motivo_Restriccion", "Motivo de Restricción"),
];

/// Fields normalized to the canonical date shape before they are written.
const DATE_FIELDS: &[&str] = &["Fecha_Atencion", "Fecha_Nac"];

/// Column index to Excel letter (0→A, 1→B, 25→Z, 26→AA).
fn col_index_to_letter(index: u32) -> String {
    let mut n = index;
    let mut s = String::new();
    loop {
        let r = (n % 26) as u8;
        s.insert(0, (b'A' + r) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// Remove or replace characters that can corrupt the sheet XML and make
/// Excel report "unreadable content". Drops control chars (except tab,
/// newline, CR); replaces & < > so raw XML is never broken.
fn sanitize_cell(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let u = c as u32;
        if c == '\t' || c == '\n' || c == '\r' {
            out.push(c);
        } else if u < 0x20 || u == 0x7F || u == 0xFFFE || u == 0xFFFF {
            // skip control and invalid
        } else {
            match c {
                '&' => out.push_str(" y "),
                '<' => out.push(' '),
                '>' => out.push(' '),
                _ => out.push(c),
            }
        }
    }
    out
}

/// Identity cells round-trip through numeric types and pick up a trailing
/// `.0`; keys must compare as plain digit strings.
fn normalize_identity(raw: &str) -> String {
    let t = raw.trim();
    t.strip_suffix(".0").unwrap_or(t).trim().to_string()
}

fn is_sentinel(value: &str) -> bool {
    value == SENTINEL_NOT_FOUND || value == SENTINEL_NONE
}

struct SheetRow {
    /// 0-based absolute row in the workbook.
    row: usize,
    cells: Vec<String>,
}

pub struct ControlSheetStore {
    path: PathBuf,
}

impl ControlSheetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find-or-append the record for `fields`, keyed by
    /// (identity number, visit date).
    ///
    /// Fails with `Upsert` — before touching the file — when the identity
    /// number is absent, empty or a sentinel: without it the record cannot
    /// be keyed.
    pub fn upsert(&self, fields: &BTreeMap<String, String>) -> Result<UpsertOutcome> {
        let identity = match fields.get("No_Identificacion") {
            Some(v) => {
                let id = normalize_identity(v);
                if id.is_empty() || is_sentinel(&id) {
                    return Err(ProcessError::upsert(
                        "identity number missing from extracted data",
                    ));
                }
                id
            }
            None => {
                return Err(ProcessError::upsert(
                    "identity number missing from extracted data",
                ))
            }
        };
        let fecha: Option<String> = fields
            .get("Fecha_Atencion")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && !is_sentinel(s))
            .map(normalize_date);

        if !self.path.exists() {
            info!(path = %self.path.display(), "control file does not exist, creating");
            self.create_empty()?;
        }

        let (sheet_name, columns, rows) = self.load_rows()?;
        let id_col = *columns.get("No. Identificación").unwrap_or(&2);
        let fecha_col = *columns.get("Fecha de Atención").unwrap_or(&9);
        let item_col = *columns.get("Item").unwrap_or(&0);

        let existing = rows.iter().find(|r| {
            let row_id = normalize_identity(r.cells.get(id_col).map(String::as_str).unwrap_or(""));
            if row_id != identity {
                return false;
            }
            match &fecha {
                Some(f) => {
                    let row_fecha =
                        normalize_date(r.cells.get(fecha_col).map(String::as_str).unwrap_or(""));
                    row_fecha == *f
                }
                None => true,
            }
        });

        let max_item = rows
            .iter()
            .filter_map(|r| r.cells.get(item_col).and_then(|c| c.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);

        // Selective merge: an empty new value never blanks an existing cell.
        let mut updates: Vec<(usize, String)> = Vec::new();
        for (field, column) in FIELD_COLUMNS {
            let Some(raw) = fields.get(*field) else {
                continue;
            };
            let value = if DATE_FIELDS.contains(field) {
                normalize_date(raw)
            } else {
                raw.clone()
            };
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            if let Some(col) = columns.get(*column) {
                updates.push((*col, sanitize_cell(&value)));
            }
        }
        // The identity cell always carries the normalized digit string.
        updates.retain(|(c, _)| *c != id_col);
        updates.push((id_col, identity.clone()));

        let (action, item, target_row) = match existing {
            Some(r) => {
                let item = r
                    .cells
                    .get(item_col)
                    .and_then(|c| c.parse::<u32>().ok())
                    .unwrap_or(max_item);
                (UpsertAction::Updated, item, r.row)
            }
            None => {
                let next_row = rows
                    .iter()
                    .map(|r| r.row + 1)
                    .max()
                    .unwrap_or(FIRST_DATA_ROW_INDEX)
                    .max(FIRST_DATA_ROW_INDEX);
                (UpsertAction::Appended, max_item + 1, next_row)
            }
        };

        let mut workbook = edit_xlsx::Workbook::from_path(&self.path).map_err(|e| {
            ProcessError::upsert(format!(
                "could not open control file for writing (close it in Excel first): {e}"
            ))
        })?;
        let worksheet = workbook
            .get_worksheet_mut_by_name(&sheet_name)
            .map_err(|e| ProcessError::upsert(format!("worksheet '{sheet_name}' not found: {e}")))?;

        let row_1based = (target_row + 1) as u32;
        if action == UpsertAction::Appended {
            let cell_ref = format!("{}{}", col_index_to_letter(item_col as u32), row_1based);
            worksheet
                .write_string(&cell_ref, item.to_string())
                .map_err(|e| ProcessError::upsert(e.to_string()))?;
        }
        for (col, value) in &updates {
            let cell_ref = format!("{}{}", col_index_to_letter(*col as u32), row_1based);
            worksheet
                .write_string(&cell_ref, value.clone())
                .map_err(|e| ProcessError::upsert(e.to_string()))?;
        }

        workbook
            .save_as(&self.path)
            .map_err(|e| ProcessError::upsert(format!("cannot write control file: {e}")))?;
        strip_drawings_from_xlsx(&self.path)?;

        info!(
            path = %self.path.display(),
            ?action,
            item,
            row = row_1based,
            "control file updated"
        );
        Ok(UpsertOutcome {
            action,
            item,
            row: row_1based,
        })
    }

    /// New workbook with the fixed banner offset and column set.
    fn create_empty(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet
            .set_name("Control")
            .map_err(|e: XlsxError| ProcessError::upsert(e.to_string()))?;

        let title_format = rust_xlsxwriter::Format::new().set_bold();
        worksheet
            .write_string_with_format(0, 0, "CONTROL DE REMISIONES EPS", &title_format)
            .map_err(|e: XlsxError| ProcessError::upsert(e.to_string()))?;

        let header_format = rust_xlsxwriter::Format::new()
            .set_bold()
            .set_background_color(rust_xlsxwriter::Color::RGB(0x2563EB))
            .set_font_color(rust_xlsxwriter::Color::RGB(0xFFFFFF));
        for (col, header) in CONTROL_COLUMNS.iter().enumerate() {
            worksheet
                .write_string_with_format(HEADER_ROW_INDEX as u32, col as u16, *header, &header_format)
                .map_err(|e: XlsxError| ProcessError::upsert(e.to_string()))?;
            let width = (header.chars().count() as f64 * 1.2).clamp(10.0, 40.0);
            worksheet
                .set_column_width(col as u16, width)
                .map_err(|e: XlsxError| ProcessError::upsert(e.to_string()))?;
        }
        let _ = worksheet.set_freeze_panes(FIRST_DATA_ROW_INDEX as u32, 0);

        workbook
            .save(&self.path)
            .map_err(|e: XlsxError| ProcessError::upsert(e.to_string()))?;
        Ok(())
    }

    /// Header map (column header → 0-based index, resolved by name like the
    /// original sheet reader) plus the non-empty data rows with absolute
    /// positions.
    fn load_rows(&self) -> Result<(String, BTreeMap<String, usize>, Vec<SheetRow>)> {
        let mut workbook = open_workbook_auto(&self.path)
            .map_err(|e| ProcessError::upsert(format!("could not open control file: {e}")))?;
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| ProcessError::upsert("control file has no worksheets"))?;
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| ProcessError::upsert(format!("worksheet not readable: {e}")))?;
        let start_row = range.start().map(|(r, _)| r as usize).unwrap_or(0);

        let mut columns = BTreeMap::new();
        let mut rows = Vec::new();
        for (i, row) in range.rows().enumerate() {
            let abs = start_row + i;
            let cells: Vec<String> = row
                .iter()
                .map(|c| c.as_string().unwrap_or_default().trim().to_string())
                .collect();
            if abs == HEADER_ROW_INDEX {
                for (idx, text) in cells.iter().enumerate() {
                    if !text.is_empty() {
                        columns.insert(text.clone(), idx);
                    }
                }
            } else if abs >= FIRST_DATA_ROW_INDEX && cells.iter().any(|c| !c.is_empty()) {
                rows.push(SheetRow { row: abs, cells });
            }
        }
        if columns.is_empty() {
            // Banner-only files from older templates: assume the fixed schema.
            for (idx, name) in CONTROL_COLUMNS.iter().enumerate() {
                columns.insert((*name).to_string(), idx);
            }
        }
        debug!(rows = rows.len(), "control file loaded");
        Ok((sheet_name, columns, rows))
    }
}

/// Strip drawing and image parts from an xlsx (zip) file so Excel won't
/// show "Repairs to ... Removed Part: Drawing shape" after an in-place
/// edit. Worksheet XML is copied unchanged to avoid corrupting cell data.
fn strip_drawings_from_xlsx(path: &Path) -> Result<()> {
    use std::fs::File;

    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ProcessError::upsert(format!("invalid workbook zip: {e}")))?;

    let temp_path = path.with_extension("tmp.xlsx");
    let out_file = File::create(&temp_path)?;
    let mut zip_writer = ZipWriter::new(out_file);
    let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let rel_drawing_re = Regex::new(r#"<Relationship[^>]*drawing[^>]*/>"#).expect("rel drawing regex");
    let ct_drawing_re =
        Regex::new(r#"<Override\s+PartName="/xl/drawings/[^"]*"[^>]*/>"#).expect("ct drawing regex");
    let ct_media_re =
        Regex::new(r#"<Override\s+PartName="/xl/media/[^"]*"[^>]*/>"#).expect("ct media regex");

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ProcessError::upsert(format!("workbook entry {i}: {e}")))?;
        let name = entry.name().replace('\\', "/");
        if name.starts_with("xl/drawings/") || name.starts_with("xl/media/") {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        let bytes: Vec<u8> = if name == "[Content_Types].xml" {
            let s = String::from_utf8_lossy(&data);
            let out = ct_drawing_re.replace_all(&s, "");
            let out = ct_media_re.replace_all(&out, "");
            out.into_owned().into_bytes()
        } else if name.contains("worksheets/_rels/") && name.ends_with(".rels") {
            let s = String::from_utf8_lossy(&data);
            rel_drawing_re.replace_all(&s, "").into_owned().into_bytes()
        } else {
            data
        };
        zip_writer
            .start_file(name.as_str(), opts)
            .map_err(|e| ProcessError::upsert(e.to_string()))?;
        zip_writer.write_all(&bytes)?;
    }
    zip_writer
        .finish()
        .map_err(|e| ProcessError::upsert(e.to_string()))?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn read_sheet(path: &Path) -> Vec<(usize, Vec<String>)> {
        let mut workbook = open_workbook_auto(path).unwrap();
        let sheet_name = workbook.sheet_names().first().cloned().unwrap();
        let range = workbook.worksheet_range(&sheet_name).unwrap();
        let start = range.start().map(|(r, _)| r as usize).unwrap_or(0);
        range
            .rows()
            .enumerate()
            .map(|(i, row)| {
                (
                    start + i,
                    row.iter()
                        .map(|c| c.as_string().unwrap_or_default().trim().to_string())
                        .collect(),
                )
            })
            .collect()
    }

    fn data_rows(path: &Path) -> Vec<Vec<String>> {
        read_sheet(path)
            .into_iter()
            .filter(|(abs, cells)| {
                *abs >= FIRST_DATA_ROW_INDEX && cells.iter().any(|c| !c.is_empty())
            })
            .map(|(_, cells)| cells)
            .collect()
    }

    fn cell(column: &str, row_cells: &[String]) -> String {
        let idx = CONTROL_COLUMNS.iter().position(|c| c == &column).unwrap();
        row_cells.get(idx).cloned().unwrap_or_default()
    }

    #[test]
    fn creates_sheet_with_header_offset_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlSheetStore::new(dir.path().join("control.xlsx"));
        let outcome = store
            .upsert(&fields(&[
                ("No_Identificacion", "12345678"),
                ("Nombre_Completo", "JUAN PEREZ"),
                ("Fecha_Atencion", "15/08/2025"),
            ]))
            .unwrap();
        assert_eq!(outcome.action, UpsertAction::Appended);
        assert_eq!(outcome.item, 1);
        assert_eq!(outcome.row, (FIRST_DATA_ROW_INDEX + 1) as u32);

        let sheet = read_sheet(store.path());
        let header = sheet
            .iter()
            .find(|(abs, _)| *abs == HEADER_ROW_INDEX)
            .map(|(_, cells)| cells.clone())
            .unwrap();
        assert_eq!(&header[..CONTROL_COLUMNS.len()], CONTROL_COLUMNS);

        let rows = data_rows(store.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(cell("No. Identificación", &rows[0]), "12345678");
        assert_eq!(cell("Fecha de Atención", &rows[0]), "2025/08/15");
    }

    #[test]
    fn upsert_is_idempotent_for_same_identity_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlSheetStore::new(dir.path().join("control.xlsx"));
        let data = fields(&[
            ("No_Identificacion", "123"),
            ("Nombre_Completo", "ANA GOMEZ"),
            ("Fecha_Atencion", "15/08/2025"),
        ]);
        let first = store.upsert(&data).unwrap();
        let second = store.upsert(&data).unwrap();
        assert_eq!(first.action, UpsertAction::Appended);
        assert_eq!(second.action, UpsertAction::Updated);
        assert_eq!(second.item, first.item);
        assert_eq!(second.row, first.row);

        let rows = data_rows(store.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(cell("Nombre Completo", &rows[0]), "ANA GOMEZ");
    }

    #[test]
    fn merge_never_blanks_existing_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlSheetStore::new(dir.path().join("control.xlsx"));
        store
            .upsert(&fields(&[
                ("No_Identificacion", "123"),
                ("Fecha_Atencion", "15/08/2025"),
                ("Nombre_Completo", "A"),
            ]))
            .unwrap();
        store
            .upsert(&fields(&[
                ("No_Identificacion", "123"),
                ("Fecha_Atencion", "15/08/2025"),
                ("Nombre_Completo", ""),
                ("Cargo", "X"),
            ]))
            .unwrap();

        let rows = data_rows(store.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(cell("Nombre Completo", &rows[0]), "A");
        assert_eq!(cell("Cargo", &rows[0]), "X");
    }

    #[test]
    fn new_identity_appends_with_next_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlSheetStore::new(dir.path().join("control.xlsx"));
        let first = store
            .upsert(&fields(&[
                ("No_Identificacion", "111"),
                ("Fecha_Atencion", "15/08/2025"),
            ]))
            .unwrap();
        let second = store
            .upsert(&fields(&[
                ("No_Identificacion", "222"),
                ("Fecha_Atencion", "15/08/2025"),
            ]))
            .unwrap();
        assert_eq!(first.item, 1);
        assert_eq!(second.item, 2);
        assert_eq!(second.action, UpsertAction::Appended);
        assert_eq!(data_rows(store.path()).len(), 2);
    }

    #[test]
    fn same_identity_different_date_is_a_new_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlSheetStore::new(dir.path().join("control.xlsx"));
        store
            .upsert(&fields(&[
                ("No_Identificacion", "111"),
                ("Fecha_Atencion", "15/08/2025"),
            ]))
            .unwrap();
        let second = store
            .upsert(&fields(&[
                ("No_Identificacion", "111"),
                ("Fecha_Atencion", "16/08/2025"),
            ]))
            .unwrap();
        assert_eq!(second.action, UpsertAction::Appended);
        assert_eq!(data_rows(store.path()).len(), 2);
    }

    #[test]
    fn missing_identity_fails_and_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = ControlSheetStore::new(dir.path().join("control.xlsx"));
        store
            .upsert(&fields(&[
                ("No_Identificacion", "111"),
                ("Fecha_Atencion", "15/08/2025"),
            ]))
            .unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let err = store
            .upsert(&fields(&[("Nombre_Completo", "SIN CEDULA")]))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Upsert { .. }));

        let sentinel_err = store
            .upsert(&fields(&[("No_Identificacion", "N/A")]))
            .unwrap_err();
        assert!(matches!(sentinel_err, ProcessError::Upsert { .. }));

        let after = std::fs::read(store.path()).unwrap();
        assert_eq!(before, after, "failed upsert must not modify the sheet");
    }

    #[test]
    fn identity_numeric_artifacts_are_normalized() {
        assert_eq!(normalize_identity(" 12345678.0 "), "12345678");
        assert_eq!(normalize_identity("12345678"), "12345678");
    }

    #[test]
    fn column_letters() {
        assert_eq!(col_index_to_letter(0), "A");
        assert_eq!(col_index_to_letter(20), "U");
        assert_eq!(col_index_to_letter(26), "AA");
    }
}
