use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::dates::{parse_date, parse_month_label, ParsedDate};
use crate::model::{
    DateFormatId, FieldId, MetricRowDraft, PeriodAmount, PlanRowDraft, RawTable, Scalar,
};
use crate::schema::MappingSet;

// ---------------------------------------------------------------------------
// Parse report
// ---------------------------------------------------------------------------

/// Per-parse accounting. Ambiguous dates do not fail the row: the field is
/// left empty, the occurrence is counted here with its row number so the
/// caller can render an actionable message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseReport {
    pub rows_total: usize,
    pub rows_skipped_empty: usize,
    pub ambiguous_dates: usize,
    pub ambiguous_date_rows: Vec<usize>,
    pub unparsable_numbers: usize,
    pub unparsable_number_rows: Vec<usize>,
}

impl ParseReport {
    fn ambiguous_date(&mut self, row: usize) {
        self.ambiguous_dates += 1;
        if !self.ambiguous_date_rows.contains(&row) {
            self.ambiguous_date_rows.push(row);
        }
    }

    fn unparsable_number(&mut self, row: usize) {
        self.unparsable_numbers += 1;
        if !self.unparsable_number_rows.contains(&row) {
            self.unparsable_number_rows.push(row);
        }
    }
}

/// Parsed rows plus the accounting for what could not be fully typed.
#[derive(Debug, Clone)]
pub struct ParseOutput<T> {
    pub rows: Vec<T>,
    pub report: ParseReport,
}

// ---------------------------------------------------------------------------
// Number heuristics
// ---------------------------------------------------------------------------

/// Parse a cell as an amount.
///
/// Text amounts tolerate currency markers ("R$ 1.234,56") and both separator
/// conventions. The rules, in order: strip currency symbols and spaces; with
/// both `.` and `,` present the rightmost one is the decimal separator; a
/// lone `,` (or `.`) followed by exactly 3 digits is a thousands separator,
/// any other single separator is decimal; repeated separators of one kind
/// are thousands separators.
pub fn parse_number(value: &Scalar) -> Option<f64> {
    match value {
        Scalar::Number(n) => Some(*n),
        Scalar::Text(t) => parse_number_text(t),
        _ => None,
    }
}

fn parse_number_text(text: &str) -> Option<f64> {
    let mut s: String = text
        .trim()
        .to_lowercase()
        .replace(['\u{a0}', ' '], "")
        .replace("r$", "")
        .replace("us$", "")
        .replace(['$', '€'], "");

    if s.is_empty() {
        return None;
    }

    let dots = s.matches('.').count();
    let commas = s.matches(',').count();

    if dots > 0 && commas > 0 {
        let last_dot = s.rfind('.').unwrap_or(0);
        let last_comma = s.rfind(',').unwrap_or(0);
        if last_comma > last_dot {
            s = s.replace('.', "").replace(',', ".");
        } else {
            s = s.replace(',', "");
        }
    } else if commas > 0 {
        s = normalize_single_separator(&s, ',');
    } else if dots > 1 {
        s = s.replace('.', "");
    } else if dots == 1 {
        s = normalize_single_separator(&s, '.');
    }

    s.parse::<f64>().ok()
}

fn normalize_single_separator(s: &str, sep: char) -> String {
    let count = s.matches(sep).count();
    let tail_len = s.rfind(sep).map(|i| s.len() - i - 1).unwrap_or(0);
    if count > 1 || tail_len == 3 {
        // Thousands grouping.
        s.replace(sep, "")
    } else if sep == ',' {
        s.replace(',', ".")
    } else {
        s.to_string()
    }
}

// ---------------------------------------------------------------------------
// Cell helpers
// ---------------------------------------------------------------------------

fn cell_text(table: &RawTable, row: usize, col: usize) -> Option<String> {
    let text = table.cell(row, col).to_text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn mapped_format(mappings: &MappingSet, col: usize) -> DateFormatId {
    mappings.mappings()[col].date_format.unwrap_or(DateFormatId::Auto)
}

fn read_date(
    table: &RawTable,
    mappings: &MappingSet,
    row: usize,
    col: Option<usize>,
    report: &mut ParseReport,
) -> Option<NaiveDate> {
    let col = col?;
    match parse_date(table.cell(row, col), mapped_format(mappings, col)) {
        ParsedDate::Date(d) => Some(d),
        ParsedDate::Missing => None,
        ParsedDate::Ambiguous => {
            report.ambiguous_date(row);
            None
        }
    }
}

fn read_number(
    table: &RawTable,
    row: usize,
    col: Option<usize>,
    report: &mut ParseReport,
) -> Option<f64> {
    let col = col?;
    let cell = table.cell(row, col);
    if cell.is_null() {
        return None;
    }
    match parse_number(cell) {
        Some(n) => Some(n),
        None => {
            report.unparsable_number(row);
            None
        }
    }
}

fn row_is_empty(table: &RawTable, row: usize) -> bool {
    table
        .rows
        .get(row)
        .map(|r| r.iter().all(|c| c.is_null() || c.to_text().trim().is_empty()))
        .unwrap_or(true)
}

// ---------------------------------------------------------------------------
// Plan rows
// ---------------------------------------------------------------------------

/// Turn the raw table into typed plan-line drafts under the given mappings.
/// Fully empty rows (common as trailing filler in real sheets) are skipped;
/// row indices of surviving drafts still refer to positions in the raw table.
pub fn parse_plan_rows(table: &RawTable, mappings: &MappingSet) -> ParseOutput<PlanRowDraft> {
    let code_col = mappings.column_for(FieldId::LineCode);
    let campaign_col = mappings.column_for(FieldId::CampaignName);
    let start_col = mappings.column_for(FieldId::StartDate);
    let end_col = mappings.column_for(FieldId::EndDate);
    let budget_col = mappings.column_for(FieldId::Budget);

    let entity_cols: Vec<(crate::model::EntityKind, usize)> = mappings
        .mappings()
        .iter()
        .filter_map(|m| {
            m.target
                .and_then(|f| f.entity_kind())
                .map(|kind| (kind, m.source_index))
        })
        .collect();

    let period_cols: Vec<(NaiveDate, usize)> = mappings
        .columns_for(FieldId::PeriodBudget)
        .into_iter()
        .filter_map(|col| {
            parse_month_label(&table.headers[col]).map(|month| (month, col))
        })
        .collect();

    let mut report = ParseReport::default();
    let mut rows = Vec::new();

    for row in 0..table.rows.len() {
        if row_is_empty(table, row) {
            report.rows_skipped_empty += 1;
            continue;
        }
        report.rows_total += 1;

        let mut labels = BTreeMap::new();
        for (kind, col) in &entity_cols {
            if let Some(label) = cell_text(table, row, *col) {
                labels.insert(*kind, label);
            }
        }

        let mut periods = Vec::new();
        for (month, col) in &period_cols {
            if let Some(amount) = read_number(table, row, Some(*col), &mut report) {
                periods.push(PeriodAmount { month: *month, amount });
            }
        }

        rows.push(PlanRowDraft {
            row_index: row,
            code: code_col.and_then(|c| cell_text(table, row, c)),
            campaign: campaign_col.and_then(|c| cell_text(table, row, c)),
            labels,
            start_date: read_date(table, mappings, row, start_col, &mut report),
            end_date: read_date(table, mappings, row, end_col, &mut report),
            budget: read_number(table, row, budget_col, &mut report).unwrap_or(0.0),
            periods,
        });
    }

    ParseOutput { rows, report }
}

// ---------------------------------------------------------------------------
// Metric rows
// ---------------------------------------------------------------------------

pub fn parse_metric_rows(table: &RawTable, mappings: &MappingSet) -> ParseOutput<MetricRowDraft> {
    let code_col = mappings.column_for(FieldId::LineCode);
    let campaign_col = mappings.column_for(FieldId::CampaignName);
    let period_col = mappings.column_for(FieldId::Period);
    let impressions_col = mappings.column_for(FieldId::Impressions);
    let clicks_col = mappings.column_for(FieldId::Clicks);
    let conversions_col = mappings.column_for(FieldId::Conversions);
    let spend_col = mappings.column_for(FieldId::Spend);

    let mut report = ParseReport::default();
    let mut rows = Vec::new();

    for row in 0..table.rows.len() {
        if row_is_empty(table, row) {
            report.rows_skipped_empty += 1;
            continue;
        }
        report.rows_total += 1;

        rows.push(MetricRowDraft {
            row_index: row,
            code: code_col.and_then(|c| cell_text(table, row, c)),
            campaign: campaign_col.and_then(|c| cell_text(table, row, c)),
            period: read_date(table, mappings, row, period_col, &mut report),
            impressions: read_number(table, row, impressions_col, &mut report),
            clicks: read_number(table, row, clicks_col, &mut report),
            conversions: read_number(table, row, conversions_col, &mut report),
            spend: read_number(table, row, spend_col, &mut report),
        });
    }

    ParseOutput { rows, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, ImportKind};
    use crate::schema::SchemaConfig;

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.into())
    }

    fn plan_table() -> RawTable {
        RawTable {
            headers: vec![
                "Codigo".into(),
                "Veiculo".into(),
                "Canal".into(),
                "Data Inicio".into(),
                "Orcamento".into(),
            ],
            rows: vec![
                vec![
                    text("L1"),
                    text("Google"),
                    text("Search"),
                    text("21/11/2025"),
                    text("R$ 1.000,00"),
                ],
                vec![
                    text("L2"),
                    text("Meta"),
                    text("Feed"),
                    text("??"),
                    Scalar::Number(2000.0),
                ],
                vec![Scalar::Null, Scalar::Null, Scalar::Null, Scalar::Null, Scalar::Null],
            ],
        }
    }

    fn mappings(table: &RawTable) -> MappingSet {
        MappingSet::infer(table, ImportKind::PlanLines, &SchemaConfig::default())
    }

    #[test]
    fn number_heuristics() {
        assert_eq!(parse_number_text("R$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_number_text("1,234.56"), Some(1234.56));
        assert_eq!(parse_number_text("1.000"), Some(1000.0));
        assert_eq!(parse_number_text("1,000"), Some(1000.0));
        assert_eq!(parse_number_text("1000,5"), Some(1000.5));
        assert_eq!(parse_number_text("1000.5"), Some(1000.5));
        assert_eq!(parse_number_text("2.500.000"), Some(2_500_000.0));
        assert_eq!(parse_number_text("-150"), Some(-150.0));
        assert_eq!(parse_number_text("n/a"), None);
        assert_eq!(parse_number_text(""), None);
    }

    #[test]
    fn plan_rows_are_typed_and_labeled() {
        let table = plan_table();
        let out = parse_plan_rows(&table, &mappings(&table));
        assert_eq!(out.rows.len(), 2);

        let first = &out.rows[0];
        assert_eq!(first.row_index, 0);
        assert_eq!(first.code.as_deref(), Some("L1"));
        assert_eq!(first.label(EntityKind::Vehicle), Some("Google"));
        assert_eq!(first.label(EntityKind::Channel), Some("Search"));
        assert_eq!(first.budget, 1000.0);
        assert_eq!(
            first.start_date,
            NaiveDate::from_ymd_opt(2025, 11, 21)
        );
    }

    #[test]
    fn trailing_empty_rows_are_skipped_but_counted() {
        let table = plan_table();
        let out = parse_plan_rows(&table, &mappings(&table));
        assert_eq!(out.report.rows_total, 2);
        assert_eq!(out.report.rows_skipped_empty, 1);
    }

    #[test]
    fn ambiguous_date_keeps_row_and_reports_it() {
        let table = plan_table();
        let out = parse_plan_rows(&table, &mappings(&table));
        let second = &out.rows[1];
        assert_eq!(second.start_date, None);
        assert_eq!(second.budget, 2000.0);
        assert_eq!(out.report.ambiguous_dates, 1);
        assert_eq!(out.report.ambiguous_date_rows, vec![1]);
    }

    #[test]
    fn period_budget_columns_fill_row_periods() {
        let table = RawTable {
            headers: vec![
                "Codigo".into(),
                "Orcamento".into(),
                "2025-01".into(),
                "2025-02".into(),
            ],
            rows: vec![vec![
                text("L1"),
                Scalar::Number(300.0),
                Scalar::Number(100.0),
                Scalar::Number(200.0),
            ]],
        };
        let out = parse_plan_rows(&table, &mappings(&table));
        let periods = &out.rows[0].periods;
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].month, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(periods[0].amount, 100.0);
        assert_eq!(periods[1].amount, 200.0);
    }

    #[test]
    fn metric_rows_parse_counts_and_period() {
        let table = RawTable {
            headers: vec![
                "Codigo".into(),
                "Periodo".into(),
                "Impressoes".into(),
                "Investimento".into(),
            ],
            rows: vec![vec![
                text("L1"),
                text("2025-11-01"),
                Scalar::Number(12000.0),
                text("1.500,00"),
            ]],
        };
        let set = MappingSet::infer(&table, ImportKind::Metrics, &SchemaConfig::default());
        let out = parse_metric_rows(&table, &set);
        assert_eq!(out.rows.len(), 1);
        let row = &out.rows[0];
        assert_eq!(row.period, NaiveDate::from_ymd_opt(2025, 11, 1));
        assert_eq!(row.impressions, Some(12000.0));
        assert_eq!(row.spend, Some(1500.0));
    }

    #[test]
    fn unparsable_budget_is_zero_and_reported() {
        let table = RawTable {
            headers: vec!["Codigo".into(), "Orcamento".into()],
            rows: vec![vec![text("L1"), text("a combinar")]],
        };
        let out = parse_plan_rows(&table, &mappings(&table));
        assert_eq!(out.rows[0].budget, 0.0);
        assert_eq!(out.report.unparsable_numbers, 1);
        assert_eq!(out.report.unparsable_number_rows, vec![0]);
    }
}
