//! Spreadsheet parsing into raw [`Table`]s.
//!
//! Two formats are recognised: OOXML workbooks (`.xlsx`) and comma-separated
//! text (`.csv`). Workbooks are read straight from the zip container with
//! `quick-xml`; a CSV file becomes a single table named [`CSV_TABLE_NAME`].
//!
//! Cleaning rules applied to every table: the first non-empty row is the
//! header, rows with no values are dropped, and columns whose data cells are
//! all empty are dropped.

use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::events::{BytesStart, Event};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use crate::models::{CellValue, Table};

/// Table name given to the single table of a CSV file.
pub const CSV_TABLE_NAME: &str = "Sheet1";

/// Last addressable column (`XFD`) and row of an OOXML sheet, one-based.
const XLSX_MAX_COLUMNS: usize = 16_384;
const XLSX_MAX_ROWS: usize = 1_048_576;
/// Maximum decompressed bytes read from a single zip entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Bounds on what one `.xlsx` workbook may expand to in memory. A workbook
/// beyond any of them is rejected as a whole, never read in part.
#[derive(Debug, Clone, Copy)]
struct XlsxLimits {
    max_sheets: usize,
    /// Non-empty cells per sheet.
    max_cells_per_sheet: usize,
    /// Rows spanned times columns spanned, i.e. the dense table size.
    max_grid_cells: usize,
}

const XLSX_LIMITS: XlsxLimits = XlsxLimits {
    max_sheets: 100,
    max_cells_per_sheet: 1_000_000,
    max_grid_cells: 4_000_000,
};

/// Recognised spreadsheet formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Xlsx,
    Csv,
}

impl Format {
    pub fn from_extension(ext: &str) -> Option<Format> {
        match ext.to_ascii_lowercase().as_str() {
            "xlsx" => Some(Format::Xlsx),
            "csv" => Some(Format::Csv),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Format> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_extension)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkbookError {
    #[error("OOXML parsing failed: {0}")]
    Ooxml(String),
    #[error("CSV parsing failed: {0}")]
    Csv(String),
    #[error("workbook too large: {0}")]
    TooLarge(String),
}

/// Parse in-memory spreadsheet bytes. Tables come back in workbook order;
/// sheets that are empty after cleaning are returned as empty tables.
pub fn parse_bytes(bytes: &[u8], format: Format) -> Result<Vec<Table>, WorkbookError> {
    match format {
        Format::Xlsx => parse_xlsx(bytes, &XLSX_LIMITS),
        Format::Csv => parse_csv(bytes).map(|t| vec![t]),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CSV
// ═══════════════════════════════════════════════════════════════════════

fn parse_csv(bytes: &[u8]) -> Result<Table, WorkbookError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut grid = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(|e| WorkbookError::Csv(e.to_string()))?;
        let row: Vec<CellValue> = record
            .iter()
            .map(|field| infer_text_cell(&String::from_utf8_lossy(field)))
            .collect();
        grid.push(row);
    }
    Ok(build_table(CSV_TABLE_NAME, grid))
}

/// Type a textual cell: integer, float, boolean, ISO date/datetime, or text.
pub fn infer_text_cell(raw: &str) -> CellValue {
    let s = raw.trim();
    if s.is_empty() {
        return CellValue::Empty;
    }
    if let Ok(i) = s.parse::<i64>() {
        return CellValue::Int(i);
    }
    // f64 parsing accepts "inf" and "NaN"; those stay text.
    if !s.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        if let Ok(f) = s.parse::<f64>() {
            return CellValue::Float(f);
        }
    }
    if s.eq_ignore_ascii_case("true") {
        return CellValue::Bool(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return CellValue::Bool(false);
    }
    if let Some(dt) = parse_iso_datetime(s) {
        return CellValue::DateTime(dt);
    }
    CellValue::Text(raw.to_string())
}

fn parse_iso_datetime(s: &str) -> Option<NaiveDateTime> {
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// ═══════════════════════════════════════════════════════════════════════
// Table cleaning
// ═══════════════════════════════════════════════════════════════════════

/// Turn a raw grid into a cleaned table (header detection, empty row and
/// column removal, header de-duplication).
pub fn build_table(name: &str, grid: Vec<Vec<CellValue>>) -> Table {
    let mut rows = grid
        .into_iter()
        .filter(|r| r.iter().any(|c| !c.is_empty()));

    let header = match rows.next() {
        Some(h) => h,
        None => {
            return Table {
                name: name.to_string(),
                columns: Vec::new(),
                rows: Vec::new(),
            }
        }
    };
    let mut data: Vec<Vec<CellValue>> = rows.collect();

    let width = data
        .iter()
        .map(|r| r.len())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0);

    let columns = header_names(&header, width);
    for row in &mut data {
        row.resize(width, CellValue::Empty);
    }

    let keep: Vec<usize> = (0..width)
        .filter(|&i| data.iter().any(|r| !r[i].is_empty()))
        .collect();

    let columns = keep.iter().map(|&i| columns[i].clone()).collect();
    let rows = data
        .into_iter()
        .map(|mut r| {
            keep.iter()
                .map(|&i| std::mem::replace(&mut r[i], CellValue::Empty))
                .collect()
        })
        .collect();

    Table {
        name: name.to_string(),
        columns,
        rows,
    }
}

fn header_names(header: &[CellValue], width: usize) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(width);

    for i in 0..width {
        let base = match header.get(i) {
            None | Some(CellValue::Empty) => format!("Unnamed: {}", i),
            Some(CellValue::Text(s)) if s.trim().is_empty() => format!("Unnamed: {}", i),
            Some(CellValue::Text(s)) => s.trim().to_string(),
            Some(CellValue::Int(v)) => v.to_string(),
            Some(CellValue::Float(f)) if f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{:.0}", f)
            }
            Some(CellValue::Float(f)) => f.to_string(),
            Some(CellValue::Bool(b)) => b.to_string().to_uppercase(),
            Some(CellValue::DateTime(dt)) => dt.format(crate::models::DATETIME_FORMAT).to_string(),
        };

        let mut name = base.clone();
        while taken.contains(&name) {
            let n = seen.entry(base.clone()).or_insert(0);
            *n += 1;
            name = format!("{}.{}", base, n);
        }
        taken.insert(name.clone());
        names.push(name);
    }
    names
}

// ═══════════════════════════════════════════════════════════════════════
// XLSX
// ═══════════════════════════════════════════════════════════════════════

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn ooxml<E: std::fmt::Display>(e: E) -> WorkbookError {
    WorkbookError::Ooxml(e.to_string())
}

fn parse_xlsx(bytes: &[u8], limits: &XlsxLimits) -> Result<Vec<Table>, WorkbookError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml)?;

    let shared_strings = match read_optional_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => read_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let date_styles = match read_optional_entry(&mut archive, "xl/styles.xml")? {
        Some(xml) => read_date_styles(&xml)?,
        None => Vec::new(),
    };
    let book = match read_optional_entry(&mut archive, "xl/workbook.xml")? {
        Some(xml) => read_workbook(&xml)?,
        None => WorkbookInfo::default(),
    };
    let sheets = resolve_sheets(&mut archive, &book)?;
    if sheets.len() > limits.max_sheets {
        return Err(WorkbookError::TooLarge(format!(
            "{} sheets, more than the limit of {}",
            sheets.len(),
            limits.max_sheets
        )));
    }

    let ctx = SheetContext {
        shared_strings: &shared_strings,
        date_styles: &date_styles,
        date1904: book.date1904,
    };

    let mut tables = Vec::new();
    for (name, entry) in sheets {
        let xml = read_zip_entry_bounded(&mut archive, &entry, MAX_XML_ENTRY_BYTES)?;
        let grid = read_sheet_grid(&xml, &ctx, limits)
            .map_err(|e| match e {
                WorkbookError::TooLarge(why) => {
                    WorkbookError::TooLarge(format!("sheet '{}': {}", name, why))
                }
                other => other,
            })?;
        tables.push(build_table(&name, grid));
    }
    Ok(tables)
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, WorkbookError> {
    let entry = archive.by_name(name).map_err(ooxml)?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out).map_err(ooxml)?;
    if out.len() as u64 >= max_bytes {
        return Err(WorkbookError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn read_optional_entry(
    archive: &mut Archive<'_>,
    name: &str,
) -> Result<Option<Vec<u8>>, WorkbookError> {
    if archive.index_for_name(name).is_none() {
        return Ok(None);
    }
    read_zip_entry_bounded(archive, name, MAX_XML_ENTRY_BYTES).map(Some)
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, WorkbookError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    // Phonetic runs (<rPh>) repeat the text in another script; skip them.
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => in_phonetic = true,
                b"t" if current.is_some() && !in_phonetic => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"si" {
                    strings.push(String::new());
                }
            }
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"rPh" => in_phonetic = false,
                b"si" => {
                    if let Some(s) = current.take() {
                        strings.push(s);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// For each cell style index (`s` attribute), whether it formats a date.
fn read_date_styles(xml: &[u8]) -> Result<Vec<bool>, WorkbookError> {
    let mut custom_formats: HashMap<u32, bool> = HashMap::new();
    let mut styles = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_cell_xfs = false;

    loop {
        let event = reader.read_event_into(&mut buf);
        match event {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"numFmt" => {
                    let id = attr(e, b"numFmtId").and_then(|v| v.parse::<u32>().ok());
                    let code = attr(e, b"formatCode").unwrap_or_default();
                    if let Some(id) = id {
                        custom_formats.insert(id, is_date_format_code(&code));
                    }
                }
                b"cellXfs" => in_cell_xfs = matches!(event, Ok(Event::Start(_))),
                b"xf" if in_cell_xfs => {
                    let id = attr(e, b"numFmtId")
                        .and_then(|v| v.parse::<u32>().ok())
                        .unwrap_or(0);
                    let is_date = custom_formats
                        .get(&id)
                        .copied()
                        .unwrap_or_else(|| is_builtin_date_format(id));
                    styles.push(is_date);
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"cellXfs" => {
                in_cell_xfs = false;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(styles)
}

fn is_builtin_date_format(id: u32) -> bool {
    matches!(id, 14..=22 | 45..=47)
}

/// A number format is a date format when, outside quoted literals, bracketed
/// sections and escapes, it uses any date or time token.
fn is_date_format_code(code: &str) -> bool {
    if code.eq_ignore_ascii_case("general") {
        return false;
    }
    let mut in_quote = false;
    let mut in_bracket = false;
    let mut escaped = false;
    for ch in code.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_quote = !in_quote,
            '[' if !in_quote => in_bracket = true,
            ']' if !in_quote => in_bracket = false,
            _ if in_quote || in_bracket => {}
            'y' | 'Y' | 'm' | 'M' | 'd' | 'D' | 'h' | 'H' | 's' | 'S' => return true,
            _ => {}
        }
    }
    false
}

#[derive(Debug, Default)]
struct WorkbookInfo {
    /// `(sheet name, relationship id)` in workbook order.
    sheets: Vec<(String, String)>,
    date1904: bool,
}

fn read_workbook(xml: &[u8]) -> Result<WorkbookInfo, WorkbookError> {
    let mut info = WorkbookInfo::default();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"sheet" => {
                    if let (Some(name), Some(rid)) = (attr(e, b"name"), attr(e, b"id")) {
                        info.sheets.push((name, rid));
                    }
                }
                b"workbookPr" => {
                    info.date1904 = matches!(
                        attr(e, b"date1904").as_deref(),
                        Some("1") | Some("true")
                    );
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(info)
}

fn read_relationships(xml: &[u8]) -> Result<HashMap<String, String>, WorkbookError> {
    let mut rels = HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    if let (Some(id), Some(target)) = (attr(e, b"Id"), attr(e, b"Target")) {
                        let path = match target.strip_prefix('/') {
                            Some(abs) => abs.to_string(),
                            None => format!("xl/{}", target),
                        };
                        rels.insert(id, path);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

/// Map sheet names to their worksheet entries. Falls back to numbered
/// `xl/worksheets/sheetN.xml` entries when the workbook part is unusable.
fn resolve_sheets(
    archive: &mut Archive<'_>,
    book: &WorkbookInfo,
) -> Result<Vec<(String, String)>, WorkbookError> {
    let rels = match read_optional_entry(archive, "xl/_rels/workbook.xml.rels")? {
        Some(xml) => read_relationships(&xml)?,
        None => HashMap::new(),
    };

    let resolved: Vec<(String, String)> = book
        .sheets
        .iter()
        .filter_map(|(name, rid)| {
            rels.get(rid)
                .filter(|path| archive.index_for_name(path).is_some())
                .map(|path| (name.clone(), path.clone()))
        })
        .collect();
    if !resolved.is_empty() {
        return Ok(resolved);
    }

    let mut entries: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    entries.sort_by_key(|name| sheet_number(name).unwrap_or(u32::MAX));
    Ok(entries
        .into_iter()
        .map(|entry| {
            let n = sheet_number(&entry).unwrap_or(0);
            (format!("Sheet{}", n), entry)
        })
        .collect())
}

fn sheet_number(entry: &str) -> Option<u32> {
    entry
        .trim_start_matches("xl/worksheets/sheet")
        .trim_end_matches(".xml")
        .parse::<u32>()
        .ok()
}

struct SheetContext<'a> {
    shared_strings: &'a [String],
    date_styles: &'a [bool],
    date1904: bool,
}

#[derive(Default)]
struct PendingCell {
    col: usize,
    kind: Option<String>,
    style: Option<usize>,
    value: String,
    inline: String,
}

/// Parse a cell reference like `"BC12"` into a zero-based column index.
/// `None` when the reference has no column letters; an error past `XFD`.
fn column_index(reference: &str) -> Result<Option<usize>, WorkbookError> {
    let mut idx = 0usize;
    let mut seen = false;
    for b in reference.bytes().take_while(u8::is_ascii_alphabetic) {
        seen = true;
        idx = idx
            .checked_mul(26)
            .and_then(|i| i.checked_add(usize::from(b.to_ascii_uppercase() - b'A') + 1))
            .filter(|&i| i <= XLSX_MAX_COLUMNS)
            .ok_or_else(|| {
                WorkbookError::TooLarge(format!("cell reference '{}' is beyond column XFD", reference))
            })?;
    }
    Ok(seen.then(|| idx - 1))
}

/// Parse a one-based row number into a zero-based index. `None` when the
/// attribute is not a number; an error past the last sheet row.
fn row_index(reference: &str) -> Result<Option<usize>, WorkbookError> {
    match reference.trim().parse::<u64>() {
        Ok(r) if r > XLSX_MAX_ROWS as u64 => Err(WorkbookError::TooLarge(format!(
            "row {} is beyond the last sheet row {}",
            r, XLSX_MAX_ROWS
        ))),
        Ok(r) => Ok(Some((r as usize).saturating_sub(1))),
        Err(_) => Ok(None),
    }
}

fn check_position(row: usize, col: usize) -> Result<(), WorkbookError> {
    if row >= XLSX_MAX_ROWS || col >= XLSX_MAX_COLUMNS {
        return Err(WorkbookError::TooLarge(format!(
            "cell at row {}, column {} is outside the sheet bounds",
            row + 1,
            col + 1
        )));
    }
    Ok(())
}

fn read_sheet_grid(
    xml: &[u8],
    ctx: &SheetContext<'_>,
    limits: &XlsxLimits,
) -> Result<Vec<Vec<CellValue>>, WorkbookError> {
    let mut cells: BTreeMap<usize, Vec<(usize, CellValue)>> = BTreeMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row: usize = 0;
    let mut next_row: usize = 0;
    let mut next_col: usize = 0;
    let mut cell: Option<PendingCell> = None;
    let mut in_v = false;
    let mut in_inline_t = false;
    let mut cell_count = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"row" => {
                    row = match attr(e, b"r") {
                        Some(r) => row_index(&r)?.unwrap_or(next_row),
                        None => next_row,
                    };
                    check_position(row, 0)?;
                    next_row = row + 1;
                    next_col = 0;
                }
                b"c" => {
                    let col = match attr(e, b"r") {
                        Some(r) => column_index(&r)?.unwrap_or(next_col),
                        None => next_col,
                    };
                    check_position(row, col)?;
                    next_col = col + 1;
                    cell = Some(PendingCell {
                        col,
                        kind: attr(e, b"t"),
                        style: attr(e, b"s").and_then(|s| s.parse().ok()),
                        ..PendingCell::default()
                    });
                }
                b"v" => in_v = true,
                b"t" if cell.is_some() => in_inline_t = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"c" => {
                    let col = match attr(e, b"r") {
                        Some(r) => column_index(&r)?.unwrap_or(next_col),
                        None => next_col,
                    };
                    check_position(row, col)?;
                    next_col = col + 1;
                }
                b"row" => {
                    let empty = match attr(e, b"r") {
                        Some(r) => row_index(&r)?.unwrap_or(next_row),
                        None => next_row,
                    };
                    check_position(empty, 0)?;
                    next_row = empty + 1;
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_v || in_inline_t => {
                if let Some(c) = cell.as_mut() {
                    let text = te.unescape().map_err(ooxml)?;
                    if in_v {
                        c.value.push_str(&text);
                    } else {
                        c.inline.push_str(&text);
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"t" => in_inline_t = false,
                b"c" => {
                    if let Some(pending) = cell.take() {
                        let value = decode_cell(&pending, ctx);
                        if !value.is_empty() {
                            cell_count += 1;
                            if cell_count > limits.max_cells_per_sheet {
                                return Err(WorkbookError::TooLarge(format!(
                                    "more than {} non-empty cells",
                                    limits.max_cells_per_sheet
                                )));
                            }
                            cells.entry(row).or_default().push((pending.col, value));
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }

    // Re-densify: leading empty rows vanish in build_table anyway, so only
    // the populated row range is materialised.
    let first = cells.keys().next().copied().unwrap_or(0);
    let last = cells.keys().next_back().copied().unwrap_or(0);
    let width = cells
        .values()
        .flat_map(|r| r.iter().map(|(c, _)| c + 1))
        .max()
        .unwrap_or(0);
    let area = (last - first + 1).saturating_mul(width);
    if area > limits.max_grid_cells {
        return Err(WorkbookError::TooLarge(format!(
            "{} rows by {} columns exceeds the limit of {} cells",
            last - first + 1,
            width,
            limits.max_grid_cells
        )));
    }

    let mut grid = Vec::with_capacity(cells.len());
    let mut last_row: Option<usize> = None;
    for (r, row_cells) in cells {
        if let Some(prev) = last_row {
            for _ in prev + 1..r {
                grid.push(Vec::new());
            }
        }
        last_row = Some(r);
        let width = row_cells.iter().map(|(c, _)| c + 1).max().unwrap_or(0);
        let mut dense = vec![CellValue::Empty; width];
        for (c, v) in row_cells {
            dense[c] = v;
        }
        grid.push(dense);
    }
    Ok(grid)
}

fn decode_cell(cell: &PendingCell, ctx: &SheetContext<'_>) -> CellValue {
    let raw = cell.value.trim();
    match cell.kind.as_deref() {
        Some("s") => raw
            .parse::<usize>()
            .ok()
            .and_then(|i| ctx.shared_strings.get(i))
            .map(|s| CellValue::Text(s.clone()))
            .unwrap_or(CellValue::Empty),
        Some("inlineStr") => CellValue::Text(cell.inline.clone()),
        Some("str") => CellValue::Text(cell.value.clone()),
        Some("b") => CellValue::Bool(raw == "1" || raw.eq_ignore_ascii_case("true")),
        Some("e") => CellValue::Empty,
        Some("d") => parse_iso_datetime(raw)
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Text(raw.to_string())),
        _ => {
            if raw.is_empty() {
                return CellValue::Empty;
            }
            let is_date = cell
                .style
                .and_then(|s| ctx.date_styles.get(s))
                .copied()
                .unwrap_or(false);
            match raw.parse::<f64>() {
                Ok(serial) if is_date => excel_serial_to_datetime(serial, ctx.date1904)
                    .map(CellValue::DateTime)
                    .unwrap_or(CellValue::Float(serial)),
                Ok(f) if !raw.contains(['.', 'e', 'E']) => raw
                    .parse::<i64>()
                    .map(CellValue::Int)
                    .unwrap_or(CellValue::Float(f)),
                Ok(f) => CellValue::Float(f),
                Err(_) => CellValue::Text(raw.to_string()),
            }
        }
    }
}

/// Convert an Excel serial day number into a timestamp.
pub fn excel_serial_to_datetime(serial: f64, date1904: bool) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let epoch = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)?
    } else {
        // Day 60 is the non-existent 1900-02-29; serials below it are
        // shifted by one so 1 maps to 1900-01-01.
        if serial < 60.0 {
            NaiveDate::from_ymd_opt(1899, 12, 31)?
        } else {
            NaiveDate::from_ymd_opt(1899, 12, 30)?
        }
    };
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(chrono::Duration::milliseconds(millis))
}
