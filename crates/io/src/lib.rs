//! `planline-io` — tabular file decoding for the plan import pipeline.
//!
//! Decodes a CSV/XLSX byte stream into a `RawTable`: a header row plus raw
//! data rows. Only the first sheet of multi-sheet containers is read. Cell
//! values keep the source format's native type where it provides one; all
//! interpretation beyond that belongs to the engine crate.

pub mod csv;
pub mod xlsx;

use std::fmt;
use std::path::Path;

use planline_import::{RawTable, Scalar};

/// What the caller believes the byte stream contains, typically derived from
/// a file extension. `Unknown` sniffs container magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentHint {
    Csv,
    Spreadsheet,
    Unknown,
}

impl ContentHint {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Self::Csv,
            "xlsx" | "xls" | "xlsb" | "ods" => Self::Spreadsheet,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug)]
pub enum ReadError {
    /// The bytes decode as neither delimited text nor a spreadsheet
    /// container.
    UnreadableFormat(String),
    /// Fewer than two rows: a header row plus at least one data row are
    /// required.
    EmptyTable,
    Io(std::io::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnreadableFormat(msg) => write!(f, "unreadable format: {msg}"),
            Self::EmptyTable => {
                write!(f, "table needs a header row and at least one data row")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ReadError {}

/// ZIP local-file magic (xlsx/xlsb/ods) or the OLE compound-file magic
/// (legacy xls).
fn looks_like_container(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
        || bytes.starts_with(b"PK\x05\x06")
        || bytes.starts_with(b"PK\x07\x08")
        || bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1])
}

/// Decode a byte stream into a `RawTable`.
pub fn read_bytes(bytes: &[u8], hint: ContentHint) -> Result<RawTable, ReadError> {
    let rows = match hint {
        ContentHint::Csv => csv::read_rows(bytes)?,
        ContentHint::Spreadsheet => xlsx::read_rows(bytes)?,
        ContentHint::Unknown => {
            if looks_like_container(bytes) {
                xlsx::read_rows(bytes)?
            } else {
                csv::read_rows(bytes)?
            }
        }
    };
    table_from_rows(rows)
}

/// Convenience wrapper: extension → hint, then `read_bytes`.
pub fn read_path(path: &Path) -> Result<RawTable, ReadError> {
    let hint = path
        .extension()
        .and_then(|e| e.to_str())
        .map(ContentHint::from_extension)
        .unwrap_or(ContentHint::Unknown);
    let bytes = std::fs::read(path).map_err(ReadError::Io)?;
    read_bytes(&bytes, hint)
}

/// The first row becomes the header row, rendered to strings (blank for
/// empty cells, duplicates preserved positionally). The rest stay raw.
fn table_from_rows(mut rows: Vec<Vec<Scalar>>) -> Result<RawTable, ReadError> {
    if rows.len() < 2 {
        return Err(ReadError::EmptyTable);
    }
    let header_cells = rows.remove(0);
    let headers = header_cells
        .iter()
        .map(|c| c.to_text().trim().to_string())
        .collect();
    Ok(RawTable { headers, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_from_extensions() {
        assert_eq!(ContentHint::from_extension("CSV"), ContentHint::Csv);
        assert_eq!(ContentHint::from_extension("xlsx"), ContentHint::Spreadsheet);
        assert_eq!(ContentHint::from_extension("ods"), ContentHint::Spreadsheet);
        assert_eq!(ContentHint::from_extension("dat"), ContentHint::Unknown);
    }

    #[test]
    fn header_only_input_is_an_empty_table() {
        let err = read_bytes(b"Codigo,Orcamento\n", ContentHint::Csv).unwrap_err();
        assert!(matches!(err, ReadError::EmptyTable));
    }

    #[test]
    fn zero_byte_input_is_an_empty_table() {
        let err = read_bytes(b"", ContentHint::Csv).unwrap_err();
        assert!(matches!(err, ReadError::EmptyTable));
    }

    #[test]
    fn unknown_hint_reads_plain_text_as_csv() {
        let table = read_bytes(b"a,b\n1,2\n", ContentHint::Unknown).unwrap();
        assert_eq!(table.headers, vec!["a", "b"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn unknown_hint_routes_zip_magic_to_the_container_reader() {
        // ZIP magic followed by garbage: the container path is taken and
        // fails, instead of the bytes being misread as text.
        let bytes = b"PK\x03\x04 not really a workbook";
        let err = read_bytes(bytes, ContentHint::Unknown).unwrap_err();
        assert!(matches!(err, ReadError::UnreadableFormat(_)));
    }

    #[test]
    fn blank_and_duplicate_headers_survive_positionally() {
        let table = read_bytes(b"Codigo,,Codigo\nL1,x,y\n", ContentHint::Csv).unwrap();
        assert_eq!(table.headers, vec!["Codigo", "", "Codigo"]);
    }
}
