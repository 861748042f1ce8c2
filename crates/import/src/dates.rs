//! Date-format detection and per-value parsing.
//!
//! Detection runs once per mapped date column over a handful of samples and
//! must be deterministic; parsing runs per cell at import time and surfaces
//! ambiguity instead of guessing silently.

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;

use crate::model::{DateFormatId, Scalar};

/// Serial 0 in the 1900 date system.
fn serial_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap()
}

// Bare integers in this window are taken for spreadsheet serial dates
// (1941-01-25 through 2099-12-31). Outside it they are plain numbers.
const PLAUSIBLE_SERIAL_MIN: i64 = 15_000;
const PLAUSIBLE_SERIAL_MAX: i64 = 73_050;

// Hard validity bound for an explicitly serial-formatted column
// (9999-12-31 in the 1900 system).
const SERIAL_MAX: i64 = 2_958_465;

/// Outcome of parsing one cell as a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedDate {
    Date(NaiveDate),
    /// The cell holds something, but no date can be determined from it.
    Ambiguous,
    /// The cell is empty.
    Missing,
}

impl ParsedDate {
    pub fn date(self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(d),
            _ => None,
        }
    }
}

/// Detect the date encoding of a column from up to a few sample values.
///
/// Order of rules: all-integers-in-serial-window, ISO, then component-order
/// disambiguation for `/`, `-` and `.` delimited numeric dates (a first
/// component over 12 forces day-first, a second component over 12 forces
/// month-first, otherwise day-first per the system's locale convention).
/// Anything else falls back to best-effort per-value parsing.
pub fn detect_format(samples: &[&Scalar]) -> DateFormatId {
    if samples.is_empty() {
        return DateFormatId::Auto;
    }

    if samples.iter().all(|s| plausible_serial(s).is_some()) {
        return DateFormatId::Serial;
    }

    let iso = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
    if samples.iter().any(|s| match s {
        Scalar::Date(_) => true,
        Scalar::Text(t) => iso.is_match(t.trim()),
        _ => false,
    }) {
        return DateFormatId::Iso;
    }

    for sep in ['/', '-', '.'] {
        if let Some(format) = disambiguate_separated(samples, sep) {
            return format;
        }
    }

    DateFormatId::Auto
}

/// Parse one cell under the column's detected (or overridden) format.
pub fn parse_date(value: &Scalar, format: DateFormatId) -> ParsedDate {
    match value {
        Scalar::Null => ParsedDate::Missing,
        Scalar::Date(d) => ParsedDate::Date(*d),
        Scalar::Bool(_) => ParsedDate::Ambiguous,
        Scalar::Number(n) => {
            let bound = if format == DateFormatId::Serial {
                1..=SERIAL_MAX
            } else {
                PLAUSIBLE_SERIAL_MIN..=PLAUSIBLE_SERIAL_MAX
            };
            if n.fract() == 0.0 && bound.contains(&(*n as i64)) {
                from_serial(*n as i64)
            } else {
                ParsedDate::Ambiguous
            }
        }
        Scalar::Text(t) => parse_text(t.trim(), format),
    }
}

fn parse_text(text: &str, format: DateFormatId) -> ParsedDate {
    if text.is_empty() {
        return ParsedDate::Missing;
    }
    match format {
        DateFormatId::Serial => match text.parse::<i64>() {
            Ok(n) if (1..=SERIAL_MAX).contains(&n) => from_serial(n),
            _ => ParsedDate::Ambiguous,
        },
        DateFormatId::Iso => match NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            Ok(d) => ParsedDate::Date(d),
            Err(_) => ParsedDate::Ambiguous,
        },
        DateFormatId::DayFirst => match components(text) {
            Some((a, b, year)) => to_date(year, b, a),
            None => ParsedDate::Ambiguous,
        },
        DateFormatId::MonthFirst => match components(text) {
            Some((a, b, year)) => to_date(year, a, b),
            None => ParsedDate::Ambiguous,
        },
        DateFormatId::Auto => parse_auto(text),
    }
}

/// Best-effort single-value parse: ISO, then an unambiguous component order,
/// then a plausible serial. A value that could be either day- or month-first
/// stays ambiguous here; only column-level detection applies the locale
/// default.
fn parse_auto(text: &str) -> ParsedDate {
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return ParsedDate::Date(d);
    }
    if let Some((a, b, year)) = components(text) {
        if a > 12 {
            return to_date(year, b, a);
        }
        if b > 12 {
            return to_date(year, a, b);
        }
        if a == b {
            // Same date under either reading.
            return to_date(year, a, b);
        }
        return ParsedDate::Ambiguous;
    }
    if let Ok(n) = text.parse::<i64>() {
        if (PLAUSIBLE_SERIAL_MIN..=PLAUSIBLE_SERIAL_MAX).contains(&n) {
            return from_serial(n);
        }
    }
    ParsedDate::Ambiguous
}

/// Split `D<sep>M<sep>YYYY`-shaped text into its numeric components.
fn components(text: &str) -> Option<(u32, u32, i32)> {
    let sep = ['/', '-', '.'].into_iter().find(|s| text.contains(*s))?;
    let parts: Vec<&str> = text.split(sep).collect();
    if parts.len() != 3 || parts[2].len() != 4 {
        return None;
    }
    let a: u32 = parts[0].parse().ok()?;
    let b: u32 = parts[1].parse().ok()?;
    let year: i32 = parts[2].parse().ok()?;
    if parts[0].len() > 2 || parts[1].len() > 2 {
        return None;
    }
    Some((a, b, year))
}

fn to_date(year: i32, month: u32, day: u32) -> ParsedDate {
    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(d) => ParsedDate::Date(d),
        None => ParsedDate::Ambiguous,
    }
}

fn from_serial(serial: i64) -> ParsedDate {
    ParsedDate::Date(serial_epoch() + Duration::days(serial))
}

fn plausible_serial(value: &Scalar) -> Option<i64> {
    let n = match value {
        Scalar::Number(n) if n.fract() == 0.0 => *n as i64,
        Scalar::Text(t) => t.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (PLAUSIBLE_SERIAL_MIN..=PLAUSIBLE_SERIAL_MAX)
        .contains(&n)
        .then_some(n)
}

fn disambiguate_separated(samples: &[&Scalar], sep: char) -> Option<DateFormatId> {
    let pattern = format!(r"^\d{{1,2}}{}\d{{1,2}}{}\d{{4}}$", regex::escape(&sep.to_string()), regex::escape(&sep.to_string()));
    let re = Regex::new(&pattern).unwrap();

    let mut firsts = Vec::new();
    let mut seconds = Vec::new();
    for sample in samples {
        let text = match sample {
            Scalar::Text(t) => t.trim(),
            _ => return None,
        };
        if !re.is_match(text) {
            return None;
        }
        let (a, b, _) = components(text)?;
        firsts.push(a);
        seconds.push(b);
    }

    if firsts.iter().any(|&a| a > 12) {
        Some(DateFormatId::DayFirst)
    } else if seconds.iter().any(|&b| b > 12) {
        Some(DateFormatId::MonthFirst)
    } else {
        Some(DateFormatId::DayFirst)
    }
}

/// Parse a header label naming a budget period ("2025-01", "01/2025", or any
/// full date — the month is kept).
pub fn parse_month_label(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();

    let ym = Regex::new(r"^(\d{4})-(\d{1,2})$").unwrap();
    if let Some(caps) = ym.captures(trimmed) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, 1);
    }

    let my = Regex::new(r"^(\d{1,2})/(\d{4})$").unwrap();
    if let Some(caps) = my.captures(trimmed) {
        let month: u32 = caps[1].parse().ok()?;
        let year: i32 = caps[2].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, 1);
    }

    match parse_auto(trimmed) {
        ParsedDate::Date(d) => d.with_day(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.into())
    }

    #[test]
    fn day_over_twelve_forces_day_first() {
        let samples = [text("21/11/2025"), text("05/06/2025")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::DayFirst);
    }

    #[test]
    fn month_slot_over_twelve_forces_month_first() {
        let samples = [text("11/21/2025")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::MonthFirst);
    }

    #[test]
    fn ambiguous_slash_dates_default_day_first() {
        let samples = [text("05/06/2025"), text("01/02/2025")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::DayFirst);
    }

    #[test]
    fn iso_sample_wins_over_separator_rules() {
        let samples = [text("2025-11-21")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::Iso);
    }

    #[test]
    fn dotted_dates_disambiguate_like_slashes() {
        let samples = [text("21.11.2025")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::DayFirst);
    }

    #[test]
    fn all_serials_detect_serial_encoding() {
        let samples = [Scalar::Number(45000.0), text("45120")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::Serial);
    }

    #[test]
    fn mixed_content_falls_back_to_auto() {
        let samples = [text("next week"), text("21/11/2025")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        assert_eq!(detect_format(&refs), DateFormatId::Auto);
    }

    #[test]
    fn detection_is_deterministic() {
        let samples = [text("05/06/2025"), text("21/11/2025")];
        let refs: Vec<&Scalar> = samples.iter().collect();
        let first = detect_format(&refs);
        for _ in 0..10 {
            assert_eq!(detect_format(&refs), first);
        }
    }

    #[test]
    fn parse_day_first() {
        assert_eq!(
            parse_date(&text("21/11/2025"), DateFormatId::DayFirst),
            ParsedDate::Date(NaiveDate::from_ymd_opt(2025, 11, 21).unwrap())
        );
    }

    #[test]
    fn parse_serial_number() {
        // 45292 = 2024-01-01 in the 1900 system
        assert_eq!(
            parse_date(&Scalar::Number(45292.0), DateFormatId::Serial),
            ParsedDate::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
    }

    #[test]
    fn auto_leaves_truly_ambiguous_values_unparsed() {
        assert_eq!(parse_date(&text("05/06/2025"), DateFormatId::Auto), ParsedDate::Ambiguous);
        // 13 in the first slot can only be a day
        assert_eq!(
            parse_date(&text("13/06/2025"), DateFormatId::Auto),
            ParsedDate::Date(NaiveDate::from_ymd_opt(2025, 6, 13).unwrap())
        );
    }

    #[test]
    fn invalid_calendar_dates_are_ambiguous() {
        assert_eq!(parse_date(&text("32/01/2025"), DateFormatId::DayFirst), ParsedDate::Ambiguous);
        assert_eq!(parse_date(&text("2025-02-30"), DateFormatId::Iso), ParsedDate::Ambiguous);
    }

    #[test]
    fn empty_cells_are_missing_not_ambiguous() {
        assert_eq!(parse_date(&Scalar::Null, DateFormatId::Iso), ParsedDate::Missing);
        assert_eq!(parse_date(&text("   "), DateFormatId::Iso), ParsedDate::Missing);
    }

    #[test]
    fn month_labels() {
        assert_eq!(parse_month_label("2025-01"), NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(parse_month_label("03/2025"), NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(parse_month_label("15/03/2025"), NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(parse_month_label("Orcamento"), None);
    }
}
