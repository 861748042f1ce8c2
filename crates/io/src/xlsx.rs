// Spreadsheet-container decoding via calamine (xlsx, xls, xlsb, ods).

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Duration, NaiveDate};
use planline_import::Scalar;

use crate::ReadError;

/// Serial 0 in the 1900 date system.
fn serial_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap()
}

/// Decode a spreadsheet container into raw rows. Only the first sheet is
/// read; the range covers that sheet's used area.
pub(crate) fn read_rows(bytes: &[u8]) -> Result<Vec<Vec<Scalar>>, ReadError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| ReadError::UnreadableFormat(format!("failed to open spreadsheet: {e}")))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let first = sheet_names
        .first()
        .ok_or_else(|| ReadError::UnreadableFormat("spreadsheet contains no sheets".into()))?
        .clone();

    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| ReadError::UnreadableFormat(format!("failed to read sheet '{first}': {e}")))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell).collect())
        .collect())
}

/// Keep the native cell type: numbers stay numeric, booleans boolean, date
/// cells become calendar dates with the time of day dropped. Text is
/// trimmed; empty and error cells are null.
fn cell(data: &Data) -> Scalar {
    match data {
        Data::Empty => Scalar::Null,
        Data::String(s) => text_cell(s),
        Data::Float(n) => Scalar::Number(*n),
        Data::Int(n) => Scalar::Number(*n as f64),
        Data::Bool(b) => Scalar::Bool(*b),
        Data::Error(_) => Scalar::Null,
        Data::DateTime(dt) => {
            let days = dt.as_f64().floor() as i64;
            if days > 0 {
                Scalar::Date(serial_epoch() + Duration::days(days))
            } else {
                Scalar::Null
            }
        }
        Data::DateTimeIso(s) => s
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map(Scalar::Date)
            .unwrap_or_else(|| text_cell(s)),
        Data::DurationIso(s) => text_cell(s),
    }
}

fn text_cell(s: &str) -> Scalar {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Scalar::Null
    } else {
        Scalar::Text(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_bytes, read_path, ContentHint, ReadError};
    use rust_xlsxwriter::Workbook;
    use tempfile::tempdir;

    fn sample_workbook() -> Workbook {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Codigo").unwrap();
        sheet.write_string(0, 1, "Veiculo").unwrap();
        sheet.write_string(0, 2, "Orcamento").unwrap();
        sheet.write_string(0, 3, "Ativo").unwrap();
        sheet.write_string(1, 0, "L1").unwrap();
        sheet.write_string(1, 1, "  Google ").unwrap();
        sheet.write_number(1, 2, 1500.0).unwrap();
        sheet.write_boolean(1, 3, true).unwrap();
        sheet.write_string(2, 0, "L2").unwrap();
        // row 2 leaves the rest empty
        workbook
    }

    #[test]
    fn first_sheet_reads_with_native_cell_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.xlsx");
        sample_workbook().save(&path).unwrap();

        let table = read_path(&path).unwrap();
        assert_eq!(table.headers, vec!["Codigo", "Veiculo", "Orcamento", "Ativo"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0], Scalar::Text("L1".into()));
        // text cells are trimmed
        assert_eq!(table.rows[0][1], Scalar::Text("Google".into()));
        // numeric cells stay numeric
        assert_eq!(table.rows[0][2], Scalar::Number(1500.0));
        assert_eq!(table.rows[0][3], Scalar::Bool(true));
        // empty trailing cells are null
        assert!(table.rows[1][2].is_null());
    }

    #[test]
    fn only_the_first_sheet_is_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multi.xlsx");
        let mut workbook = sample_workbook();
        let second = workbook.add_worksheet();
        second.write_string(0, 0, "Outro").unwrap();
        second.write_string(1, 0, "ignorado").unwrap();
        workbook.save(&path).unwrap();

        let table = read_path(&path).unwrap();
        assert_eq!(table.headers[0], "Codigo");
        assert!(table
            .rows
            .iter()
            .flatten()
            .all(|c| c.to_text() != "ignorado"));
    }

    #[test]
    fn header_only_sheet_is_an_empty_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.xlsx");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Codigo").unwrap();
        workbook.save(&path).unwrap();

        let err = read_path(&path).unwrap_err();
        assert!(matches!(err, ReadError::EmptyTable));
    }

    #[test]
    fn garbage_bytes_are_unreadable() {
        let err = read_bytes(b"\x00\x01\x02 nonsense", ContentHint::Spreadsheet).unwrap_err();
        assert!(matches!(err, ReadError::UnreadableFormat(_)));
    }

    #[test]
    fn date_serial_conversion_drops_time_of_day() {
        // 45292.5 = 2024-01-01 noon in the 1900 system
        assert_eq!(
            cell(&Data::Float(45292.0)),
            Scalar::Number(45292.0),
            "plain floats stay numeric; only date-formatted cells become dates"
        );
        assert_eq!(
            cell(&Data::DateTimeIso("2024-01-01T12:30:00".into())),
            Scalar::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
    }
}
