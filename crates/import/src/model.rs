use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Cells and tables
// ---------------------------------------------------------------------------

/// A single cell value, keeping the source format's native type.
///
/// CSV cells are always `Text` or `Null` (the format is untyped); spreadsheet
/// containers also produce `Number`, `Bool` and `Date`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Render for header use and display. Integral numbers drop the decimals.
    pub fn to_text(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Text(s) => s.clone(),
            Scalar::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Scalar::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Scalar::Date(d) => d.to_string(),
        }
    }
}

/// Decoded spreadsheet content: a header row plus raw data rows.
///
/// `headers` may contain blanks or duplicates; duplicates are preserved
/// positionally. Rows may be shorter than the header row.
#[derive(Debug, Clone, Serialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl RawTable {
    /// Cell accessor tolerant of ragged rows. Missing trailing cells are null.
    pub fn cell(&self, row: usize, col: usize) -> &Scalar {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&Scalar::Null)
    }

    /// Up to `limit` non-null sample values from a column, in row order.
    pub fn column_samples(&self, col: usize, limit: usize) -> Vec<&Scalar> {
        self.rows
            .iter()
            .filter_map(|r| r.get(col))
            .filter(|v| !v.is_null())
            .take(limit)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Import kinds and target schema
// ---------------------------------------------------------------------------

/// What the uploaded sheet contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    /// Media-plan line items (the plan creation flow).
    PlanLines,
    /// Periodic performance metrics to attach to an existing plan.
    Metrics,
}

impl std::fmt::Display for ImportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanLines => write!(f, "plan_lines"),
            Self::Metrics => write!(f, "metrics"),
        }
    }
}

/// Semantic target field a source column can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    LineCode,
    CampaignName,
    Vehicle,
    Channel,
    Subdivision,
    Moment,
    FunnelStage,
    Target,
    StartDate,
    EndDate,
    Budget,
    /// A single period's budget amount; the source header names the period.
    PeriodBudget,
    Period,
    Impressions,
    Clicks,
    Conversions,
    Spend,
}

impl FieldId {
    /// At most one non-ignore mapping may point at a unique field.
    pub fn is_unique(self) -> bool {
        matches!(self, Self::LineCode)
    }

    pub fn is_date_valued(self) -> bool {
        matches!(self, Self::StartDate | Self::EndDate | Self::Period)
    }

    /// The catalog kind this field's labels reconcile against, if any.
    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            Self::Vehicle => Some(EntityKind::Vehicle),
            Self::Channel => Some(EntityKind::Channel),
            Self::Subdivision => Some(EntityKind::Subdivision),
            Self::Moment => Some(EntityKind::Moment),
            Self::FunnelStage => Some(EntityKind::FunnelStage),
            Self::Target => Some(EntityKind::Target),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LineCode => "line_code",
            Self::CampaignName => "campaign_name",
            Self::Vehicle => "vehicle",
            Self::Channel => "channel",
            Self::Subdivision => "subdivision",
            Self::Moment => "moment",
            Self::FunnelStage => "funnel_stage",
            Self::Target => "target",
            Self::StartDate => "start_date",
            Self::EndDate => "end_date",
            Self::Budget => "budget",
            Self::PeriodBudget => "period_budget",
            Self::Period => "period",
            Self::Impressions => "impressions",
            Self::Clicks => "clicks",
            Self::Conversions => "conversions",
            Self::Spend => "spend",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "line_code" => Some(Self::LineCode),
            "campaign_name" => Some(Self::CampaignName),
            "vehicle" => Some(Self::Vehicle),
            "channel" => Some(Self::Channel),
            "subdivision" => Some(Self::Subdivision),
            "moment" => Some(Self::Moment),
            "funnel_stage" => Some(Self::FunnelStage),
            "target" => Some(Self::Target),
            "start_date" => Some(Self::StartDate),
            "end_date" => Some(Self::EndDate),
            "budget" => Some(Self::Budget),
            "period_budget" => Some(Self::PeriodBudget),
            "period" => Some(Self::Period),
            "impressions" => Some(Self::Impressions),
            "clicks" => Some(Self::Clicks),
            "conversions" => Some(Self::Conversions),
            "spend" => Some(Self::Spend),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a date-like column's textual values are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormatId {
    /// Spreadsheet serial number (days since the 1900 epoch).
    Serial,
    /// ISO `YYYY-MM-DD`.
    Iso,
    /// Day before month (`DD/MM/YYYY` and `-`/`.` variants).
    DayFirst,
    /// Month before day (`MM/DD/YYYY` and `-`/`.` variants).
    MonthFirst,
    /// No single format detected; best-effort per value at parse time.
    Auto,
}

impl std::fmt::Display for DateFormatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Iso => write!(f, "yyyy-mm-dd"),
            Self::DayFirst => write!(f, "dd/mm/yyyy"),
            Self::MonthFirst => write!(f, "mm/dd/yyyy"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// One mapping per source column.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnMapping {
    pub source_column: String,
    pub source_index: usize,
    /// `None` means the column is ignored.
    pub target: Option<FieldId>,
    /// Present only when `target` is a date-valued field.
    pub date_format: Option<DateFormatId>,
}

// ---------------------------------------------------------------------------
// Canonical entity kinds
// ---------------------------------------------------------------------------

/// Kinds of canonical catalog entities imported labels reconcile against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Vehicle,
    Channel,
    Subdivision,
    Moment,
    FunnelStage,
    Target,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Vehicle,
        EntityKind::Channel,
        EntityKind::Subdivision,
        EntityKind::Moment,
        EntityKind::FunnelStage,
        EntityKind::Target,
    ];

    /// The kind this kind nests under, if any. Channels live under vehicles.
    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            Self::Channel => Some(Self::Vehicle),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vehicle => write!(f, "vehicle"),
            Self::Channel => write!(f, "channel"),
            Self::Subdivision => write!(f, "subdivision"),
            Self::Moment => write!(f, "moment"),
            Self::FunnelStage => write!(f, "funnel_stage"),
            Self::Target => write!(f, "target"),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed rows
// ---------------------------------------------------------------------------

/// A file-provided budget amount for one period of a line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodAmount {
    /// First day of the period's month.
    pub month: NaiveDate,
    pub amount: f64,
}

/// One typed plan-line row extracted from the raw table.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRowDraft {
    /// Index into the raw table's data rows (0-based, header excluded).
    pub row_index: usize,
    pub code: Option<String>,
    pub campaign: Option<String>,
    /// Raw entity labels by kind, original casing preserved.
    pub labels: BTreeMap<EntityKind, String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub budget: f64,
    /// File-provided periodic amounts, empty when none were mapped.
    pub periods: Vec<PeriodAmount>,
}

impl PlanRowDraft {
    pub fn label(&self, kind: EntityKind) -> Option<&str> {
        self.labels.get(&kind).map(|s| s.as_str())
    }
}

/// One typed performance-metrics row extracted from the raw table.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRowDraft {
    pub row_index: usize,
    pub code: Option<String>,
    pub campaign: Option<String>,
    pub period: Option<NaiveDate>,
    pub impressions: Option<f64>,
    pub clicks: Option<f64>,
    pub conversions: Option<f64>,
    pub spend: Option<f64>,
}

// ---------------------------------------------------------------------------
// Plan-level attributes
// ---------------------------------------------------------------------------

/// Plan-level fields gathered at the PlanInfo step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanInfo {
    pub name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub total_budget: Option<f64>,
}

// ---------------------------------------------------------------------------
// Wizard steps
// ---------------------------------------------------------------------------

/// Steps of the import wizard. The plan-lines flow runs
/// Upload → Mapping → PlanInfo → EntityResolution → HierarchyConfig →
/// Confirm → Committed; the metrics flow replaces the middle with Matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    Upload,
    Mapping,
    PlanInfo,
    EntityResolution,
    HierarchyConfig,
    Matching,
    Confirm,
    Committed,
}

impl std::fmt::Display for WizardStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Mapping => write!(f, "mapping"),
            Self::PlanInfo => write!(f, "plan_info"),
            Self::EntityResolution => write!(f, "entity_resolution"),
            Self::HierarchyConfig => write!(f, "hierarchy_config"),
            Self::Matching => write!(f, "matching"),
            Self::Confirm => write!(f, "confirm"),
            Self::Committed => write!(f, "committed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_to_text_renders_integers_without_decimals() {
        assert_eq!(Scalar::Number(1500.0).to_text(), "1500");
        assert_eq!(Scalar::Number(0.5).to_text(), "0.5");
        assert_eq!(Scalar::Text("  x".into()).to_text(), "  x");
        assert_eq!(Scalar::Null.to_text(), "");
    }

    #[test]
    fn ragged_row_cells_read_as_null() {
        let table = RawTable {
            headers: vec!["a".into(), "b".into(), "c".into()],
            rows: vec![vec![Scalar::Text("x".into())]],
        };
        assert_eq!(table.cell(0, 0), &Scalar::Text("x".into()));
        assert!(table.cell(0, 2).is_null());
        assert!(table.cell(5, 0).is_null());
    }

    #[test]
    fn column_samples_skip_nulls() {
        let table = RawTable {
            headers: vec!["a".into()],
            rows: vec![
                vec![Scalar::Null],
                vec![Scalar::Number(1.0)],
                vec![Scalar::Number(2.0)],
            ],
        };
        let samples = table.column_samples(0, 5);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], &Scalar::Number(1.0));
    }

    #[test]
    fn field_names_round_trip() {
        for field in [
            FieldId::LineCode,
            FieldId::Channel,
            FieldId::FunnelStage,
            FieldId::PeriodBudget,
            FieldId::Spend,
        ] {
            assert_eq!(FieldId::from_name(field.name()), Some(field));
        }
        assert_eq!(FieldId::from_name("bogus"), None);
    }

    #[test]
    fn channel_nests_under_vehicle() {
        assert_eq!(EntityKind::Channel.parent_kind(), Some(EntityKind::Vehicle));
        assert_eq!(EntityKind::Vehicle.parent_kind(), None);
        assert_eq!(EntityKind::Moment.parent_kind(), None);
    }
}
