// Delimited-text decoding: encoding fallback plus delimiter sniffing.

use planline_import::Scalar;

use crate::ReadError;

/// Decode delimited-text bytes into raw rows, one `Scalar` per field.
pub(crate) fn read_rows(bytes: &[u8]) -> Result<Vec<Vec<Scalar>>, ReadError> {
    let content = decode_utf8(bytes);
    let delimiter = sniff_delimiter(&content);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| ReadError::UnreadableFormat(e.to_string()))?;
        rows.push(record.iter().map(cell).collect());
    }
    Ok(rows)
}

/// CSV is untyped: every cell is trimmed text or null.
fn cell(field: &str) -> Scalar {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        Scalar::Null
    } else {
        Scalar::Text(trimmed.to_string())
    }
}

/// Decode to UTF-8, falling back to Windows-1252 (common for Excel-exported
/// CSVs) when the bytes are not valid UTF-8.
fn decode_utf8(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => encoding_rs::WINDOWS_1252.decode(bytes).0.into_owned(),
    }
}

/// Detect the most likely field delimiter by checking consistency across the
/// first few lines.
///
/// For each candidate (tab, semicolon, comma, pipe), count fields per line.
/// The delimiter that produces the most consistent field count (>1 field)
/// wins; higher field count breaks ties.
fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b'\t', b';', b',', b'|'];
    let sample_lines: Vec<&str> = content.lines().take(10).collect();

    if sample_lines.is_empty() {
        return b',';
    }

    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        // Must produce >1 field on the first line to be viable
        if counts.first().copied().unwrap_or(0) <= 1 {
            continue;
        }

        let target = counts[0];
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;

        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}
