use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::allocate::HierarchyNode;
use crate::catalog::CatalogSnapshot;
use crate::error::{CommitStage, ImportError, StoreError};
use crate::matcher::{MatchKind, MatchResult};
use crate::model::{EntityKind, MetricRowDraft, PlanInfo, PlanRowDraft};
use crate::reconcile::{EntityStatus, Worklist};

// ---------------------------------------------------------------------------
// Persistence records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NewPlan {
    pub name: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub total_budget: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewLine {
    /// Raw-table row this line came from; `create_lines` is order-preserving
    /// so created ids zip back to these rows.
    pub source_row: usize,
    pub code: String,
    pub display_name: String,
    pub budget: f64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Canonical entity references, fully resolved.
    pub entity_ids: BTreeMap<EntityKind, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedLine {
    pub id: String,
    pub source_row: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetPeriodRecord {
    pub line_id: String,
    /// First day of the period's month.
    pub month: NaiveDate,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActualRecord {
    pub line_id: String,
    pub period: NaiveDate,
    pub impressions: Option<f64>,
    pub clicks: Option<f64>,
    pub conversions: Option<f64>,
    pub spend: Option<f64>,
}

/// External persistence, implemented by the caller. The commit sequence is
/// the only place the pipeline causes external writes.
pub trait PlanStore {
    fn create_plan(&mut self, plan: &NewPlan) -> Result<String, StoreError>;
    /// Order-preserving: result[i] corresponds to lines[i].
    fn create_lines(&mut self, plan_id: &str, lines: &[NewLine])
        -> Result<Vec<CreatedLine>, StoreError>;
    fn create_budget_periods(&mut self, records: &[BudgetPeriodRecord]) -> Result<(), StoreError>;
    fn create_distributions(&mut self, plan_id: &str, tree: &[HierarchyNode])
        -> Result<(), StoreError>;
    fn create_actuals(&mut self, plan_id: &str, records: &[ActualRecord])
        -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CommitMeta {
    pub engine_version: String,
    pub run_at: String,
}

impl CommitMeta {
    fn now() -> Self {
        CommitMeta {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub meta: CommitMeta,
    pub plan_id: String,
    pub lines_created: usize,
    pub budget_periods_created: usize,
    pub distribution_nodes: usize,
    pub actuals_created: usize,
    /// Rows excluded because a reference stayed Ignored.
    pub rows_excluded: Vec<usize>,
    /// Metrics rows skipped because no line matched.
    pub rows_unmatched: Vec<usize>,
    pub ambiguous_dates: usize,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Session idempotency cache
// ---------------------------------------------------------------------------

/// Writes already performed in this wizard session. A retried commit resumes
/// from the first write that has not happened yet, so the plan and its lines
/// are never duplicated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitCache {
    pub plan_id: Option<String>,
    pub lines: Option<Vec<CreatedLine>>,
    pub budget_periods_done: bool,
    pub distributions_done: bool,
}

// ---------------------------------------------------------------------------
// Plan-lines commit
// ---------------------------------------------------------------------------

pub struct CommitInput<'a> {
    pub plan: &'a PlanInfo,
    pub rows: &'a [PlanRowDraft],
    pub worklist: &'a Worklist,
    pub snapshot: &'a CatalogSnapshot,
    pub tree: &'a [HierarchyNode],
    pub ambiguous_dates: usize,
}

enum RowRefs {
    Resolved(BTreeMap<EntityKind, String>),
    /// At least one reference is Ignored (or vanished); the row is excluded.
    Excluded,
}

fn resolve_row_refs(
    row: &PlanRowDraft,
    worklist: &Worklist,
    snapshot: &CatalogSnapshot,
    warnings: &mut Vec<String>,
) -> RowRefs {
    let mut ids = BTreeMap::new();
    for (kind, label) in &row.labels {
        if let Some(entry) = snapshot.find_by_name(*kind, label) {
            ids.insert(*kind, entry.id.clone());
            continue;
        }
        let parent_label = kind.parent_kind().and_then(|pk| row.label(pk));
        match worklist.find(*kind, label, parent_label) {
            Some(entry) => match entry.status {
                EntityStatus::Resolved => {
                    if let Some(id) = &entry.resolved_canonical_id {
                        ids.insert(*kind, id.clone());
                    }
                }
                EntityStatus::Ignored => return RowRefs::Excluded,
                EntityStatus::Pending | EntityStatus::Creating => {
                    warnings.push(format!(
                        "row {}: {kind} '{label}' still unresolved at commit; row excluded",
                        row.row_index
                    ));
                    return RowRefs::Excluded;
                }
            },
            None => {
                warnings.push(format!(
                    "row {}: {kind} '{label}' not found in worklist or catalog; row excluded",
                    row.row_index
                ));
                return RowRefs::Excluded;
            }
        }
    }
    RowRefs::Resolved(ids)
}

/// Months covered by the span, as first-of-month dates.
fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut months = Vec::new();
    let mut current = first_of_month(start);
    let last = first_of_month(end.max(start));
    while current <= last {
        months.push(current);
        current = next_month(current);
    }
    months
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_month(month_start: NaiveDate) -> NaiveDate {
    use chrono::Datelike;
    let (year, month) = if month_start.month() == 12 {
        (month_start.year() + 1, 1)
    } else {
        (month_start.year(), month_start.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(month_start)
}

fn budget_periods_for(
    row: &PlanRowDraft,
    line_id: &str,
    plan: &PlanInfo,
    warnings: &mut Vec<String>,
) -> Vec<BudgetPeriodRecord> {
    if !row.periods.is_empty() {
        return row
            .periods
            .iter()
            .map(|p| BudgetPeriodRecord {
                line_id: line_id.to_string(),
                month: p.month,
                amount: p.amount,
            })
            .collect();
    }

    let span = match (
        row.start_date.or(plan.start_date),
        row.end_date.or(plan.end_date),
    ) {
        (Some(start), Some(end)) => (start, end),
        (Some(start), None) => (start, start),
        _ => {
            warnings.push(format!(
                "row {}: no dates on line or plan; no budget periods generated",
                row.row_index
            ));
            return Vec::new();
        }
    };

    let months = months_between(span.0, span.1);
    let amount = row.budget / months.len() as f64;
    months
        .into_iter()
        .map(|month| BudgetPeriodRecord {
            line_id: line_id.to_string(),
            month,
            amount,
        })
        .collect()
}

/// Run the plan-creation commit sequence: plan, lines, budget periods,
/// distributions. Each write happens at most once per session (see
/// `CommitCache`); a failure after the plan exists surfaces as
/// `CommitPartialFailure` carrying the created plan id and leaves the cache
/// positioned for a clean retry.
pub fn commit_plan(
    input: &CommitInput<'_>,
    cache: &mut CommitCache,
    store: &mut dyn PlanStore,
) -> Result<CommitReport, ImportError> {
    let mut warnings = Vec::new();
    let mut rows_excluded = Vec::new();
    let mut new_lines = Vec::new();
    let mut included_rows = Vec::new();

    for row in input.rows {
        match resolve_row_refs(row, input.worklist, input.snapshot, &mut warnings) {
            RowRefs::Excluded => rows_excluded.push(row.row_index),
            RowRefs::Resolved(entity_ids) => {
                let code = row
                    .code
                    .clone()
                    .unwrap_or_else(|| format!("row-{}", row.row_index + 1));
                let display_name = row.campaign.clone().unwrap_or_else(|| code.clone());
                new_lines.push(NewLine {
                    source_row: row.row_index,
                    code,
                    display_name,
                    budget: row.budget,
                    start_date: row.start_date,
                    end_date: row.end_date,
                    entity_ids,
                });
                included_rows.push(row);
            }
        }
    }

    let total_budget = input
        .plan
        .total_budget
        .unwrap_or_else(|| new_lines.iter().map(|l| l.budget).sum());

    let plan_id = match &cache.plan_id {
        Some(id) => id.clone(),
        None => {
            let id = store
                .create_plan(&NewPlan {
                    name: input.plan.name.clone(),
                    start_date: input.plan.start_date,
                    end_date: input.plan.end_date,
                    total_budget,
                })
                .map_err(|e: StoreError| ImportError::CommitFailed {
                    stage: CommitStage::Plan,
                    detail: e.to_string(),
                })?;
            cache.plan_id = Some(id.clone());
            id
        }
    };

    let partial = |stage: CommitStage, e: StoreError| ImportError::CommitPartialFailure {
        plan_id: plan_id.clone(),
        stage,
        detail: e.to_string(),
    };

    let created = match &cache.lines {
        Some(lines) => lines.clone(),
        None => {
            let created = store
                .create_lines(&plan_id, &new_lines)
                .map_err(|e| partial(CommitStage::Lines, e))?;
            cache.lines = Some(created.clone());
            created
        }
    };

    let mut period_records = Vec::new();
    for (line, created_line) in included_rows.iter().zip(&created) {
        period_records.extend(budget_periods_for(
            line,
            &created_line.id,
            input.plan,
            &mut warnings,
        ));
    }
    if !cache.budget_periods_done {
        store
            .create_budget_periods(&period_records)
            .map_err(|e| partial(CommitStage::BudgetPeriods, e))?;
        cache.budget_periods_done = true;
    }

    let distribution_nodes = count_nodes(input.tree);
    if !cache.distributions_done {
        store
            .create_distributions(&plan_id, input.tree)
            .map_err(|e| partial(CommitStage::Distributions, e))?;
        cache.distributions_done = true;
    }

    Ok(CommitReport {
        meta: CommitMeta::now(),
        plan_id,
        lines_created: created.len(),
        budget_periods_created: period_records.len(),
        distribution_nodes,
        actuals_created: 0,
        rows_excluded,
        rows_unmatched: Vec::new(),
        ambiguous_dates: input.ambiguous_dates,
        warnings,
    })
}

fn count_nodes(tree: &[HierarchyNode]) -> usize {
    tree.iter().map(|n| 1 + count_nodes(&n.children)).sum()
}

// ---------------------------------------------------------------------------
// Metrics commit
// ---------------------------------------------------------------------------

/// Persist matched metric rows against an existing plan. Unmatched rows are
/// skipped and reported, not errors. There is no plan creation here, so a
/// failure is retryable as a whole.
pub fn commit_metrics(
    plan_id: &str,
    rows: &[MetricRowDraft],
    matches: &[MatchResult],
    ambiguous_dates: usize,
    store: &mut dyn PlanStore,
) -> Result<CommitReport, ImportError> {
    let mut records = Vec::new();
    let mut rows_unmatched = Vec::new();
    let mut warnings = Vec::new();

    for row in rows {
        let matched = matches
            .iter()
            .find(|m| m.row_index == row.row_index)
            .filter(|m| m.match_kind != MatchKind::None)
            .and_then(|m| m.matched_line_id.clone());
        let Some(line_id) = matched else {
            rows_unmatched.push(row.row_index);
            continue;
        };
        let Some(period) = row.period else {
            warnings.push(format!("row {}: no period date; row skipped", row.row_index));
            rows_unmatched.push(row.row_index);
            continue;
        };
        records.push(ActualRecord {
            line_id,
            period,
            impressions: row.impressions,
            clicks: row.clicks,
            conversions: row.conversions,
            spend: row.spend,
        });
    }

    store
        .create_actuals(plan_id, &records)
        .map_err(|e| ImportError::CommitFailed {
            stage: CommitStage::Actuals,
            detail: e.to_string(),
        })?;

    Ok(CommitReport {
        meta: CommitMeta::now(),
        plan_id: plan_id.to_string(),
        lines_created: 0,
        budget_periods_created: 0,
        distribution_nodes: 0,
        actuals_created: records.len(),
        rows_excluded: Vec::new(),
        rows_unmatched,
        ambiguous_dates,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::reconcile::build_worklist;

    // In-memory store that can be told to fail at a given stage.
    #[derive(Default)]
    struct MemStore {
        fail_at: Option<CommitStage>,
        plans: Vec<NewPlan>,
        lines: Vec<NewLine>,
        periods: Vec<BudgetPeriodRecord>,
        distribution_calls: usize,
        actuals: Vec<ActualRecord>,
    }

    impl MemStore {
        fn failing(stage: CommitStage) -> Self {
            MemStore {
                fail_at: Some(stage),
                ..Default::default()
            }
        }

        fn check(&self, stage: CommitStage) -> Result<(), StoreError> {
            if self.fail_at == Some(stage) {
                Err(StoreError(format!("injected failure at {stage}")))
            } else {
                Ok(())
            }
        }
    }

    impl PlanStore for MemStore {
        fn create_plan(&mut self, plan: &NewPlan) -> Result<String, StoreError> {
            self.check(CommitStage::Plan)?;
            self.plans.push(plan.clone());
            Ok(format!("plan-{}", self.plans.len()))
        }

        fn create_lines(
            &mut self,
            _plan_id: &str,
            lines: &[NewLine],
        ) -> Result<Vec<CreatedLine>, StoreError> {
            self.check(CommitStage::Lines)?;
            self.lines.extend(lines.iter().cloned());
            Ok(lines
                .iter()
                .enumerate()
                .map(|(i, l)| CreatedLine {
                    id: format!("line-{i}"),
                    source_row: l.source_row,
                })
                .collect())
        }

        fn create_budget_periods(
            &mut self,
            records: &[BudgetPeriodRecord],
        ) -> Result<(), StoreError> {
            self.check(CommitStage::BudgetPeriods)?;
            self.periods.extend(records.iter().cloned());
            Ok(())
        }

        fn create_distributions(
            &mut self,
            _plan_id: &str,
            _tree: &[HierarchyNode],
        ) -> Result<(), StoreError> {
            self.check(CommitStage::Distributions)?;
            self.distribution_calls += 1;
            Ok(())
        }

        fn create_actuals(
            &mut self,
            _plan_id: &str,
            records: &[ActualRecord],
        ) -> Result<(), StoreError> {
            self.check(CommitStage::Actuals)?;
            self.actuals.extend(records.iter().cloned());
            Ok(())
        }
    }

    fn row(index: usize, code: &str, budget: f64, vehicle: Option<&str>) -> PlanRowDraft {
        let mut labels = BTreeMap::new();
        if let Some(v) = vehicle {
            labels.insert(EntityKind::Vehicle, v.to_string());
        }
        PlanRowDraft {
            row_index: index,
            code: Some(code.to_string()),
            campaign: None,
            labels,
            start_date: NaiveDate::from_ymd_opt(2025, 1, 10),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 20),
            budget,
            periods: Vec::new(),
        }
    }

    fn snapshot_with_google() -> CatalogSnapshot {
        let mut snapshot = CatalogSnapshot::new();
        snapshot.insert(
            EntityKind::Vehicle,
            CatalogEntry {
                id: "v1".into(),
                name: "Google".into(),
                parent_id: None,
            },
        );
        snapshot
    }

    fn plan_info() -> PlanInfo {
        PlanInfo {
            name: "Q1 Plan".into(),
            start_date: None,
            end_date: None,
            total_budget: None,
        }
    }

    #[test]
    fn commit_creates_plan_lines_and_even_monthly_periods() {
        let rows = vec![row(0, "L1", 3000.0, Some("Google"))];
        let snapshot = snapshot_with_google();
        let worklist = build_worklist(&rows, &snapshot);
        assert!(worklist.is_complete());

        let plan = plan_info();
        let input = CommitInput {
            plan: &plan,
            rows: &rows,
            worklist: &worklist,
            snapshot: &snapshot,
            tree: &[],
            ambiguous_dates: 0,
        };
        let mut cache = CommitCache::default();
        let mut store = MemStore::default();

        let report = commit_plan(&input, &mut cache, &mut store).unwrap();
        assert_eq!(report.lines_created, 1);
        assert_eq!(store.plans.len(), 1);
        assert_eq!(store.plans[0].total_budget, 3000.0);
        assert_eq!(store.lines[0].entity_ids[&EntityKind::Vehicle], "v1");

        // Jan..Mar span, evenly split
        assert_eq!(report.budget_periods_created, 3);
        assert_eq!(store.periods.len(), 3);
        assert!(store.periods.iter().all(|p| p.amount == 1000.0));
        assert_eq!(store.periods[0].month, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }

    #[test]
    fn file_provided_periods_win_over_even_distribution() {
        let mut r = row(0, "L1", 300.0, Some("Google"));
        r.periods = vec![
            crate::model::PeriodAmount {
                month: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                amount: 100.0,
            },
            crate::model::PeriodAmount {
                month: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
                amount: 200.0,
            },
        ];
        let rows = vec![r];
        let snapshot = snapshot_with_google();
        let worklist = build_worklist(&rows, &snapshot);
        let plan = plan_info();
        let input = CommitInput {
            plan: &plan,
            rows: &rows,
            worklist: &worklist,
            snapshot: &snapshot,
            tree: &[],
            ambiguous_dates: 0,
        };
        let mut store = MemStore::default();
        commit_plan(&input, &mut CommitCache::default(), &mut store).unwrap();

        assert_eq!(store.periods.len(), 2);
        assert_eq!(store.periods[1].amount, 200.0);
    }

    #[test]
    fn ignored_entity_rows_are_excluded_from_creation() {
        let rows = vec![
            row(0, "L1", 1000.0, Some("Google")),
            row(1, "L2", 2000.0, Some("Mystery")),
        ];
        let snapshot = snapshot_with_google();
        let mut worklist = build_worklist(&rows, &snapshot);
        let id = worklist.entries()[0].id;
        worklist.ignore(id).unwrap();

        let plan = plan_info();
        let input = CommitInput {
            plan: &plan,
            rows: &rows,
            worklist: &worklist,
            snapshot: &snapshot,
            tree: &[],
            ambiguous_dates: 0,
        };
        let mut store = MemStore::default();
        let report = commit_plan(&input, &mut CommitCache::default(), &mut store).unwrap();

        assert_eq!(report.lines_created, 1);
        assert_eq!(report.rows_excluded, vec![1]);
        assert_eq!(store.plans[0].total_budget, 1000.0);
    }

    #[test]
    fn retry_after_distribution_failure_does_not_duplicate() {
        let rows = vec![row(0, "L1", 3000.0, Some("Google"))];
        let snapshot = snapshot_with_google();
        let worklist = build_worklist(&rows, &snapshot);
        let plan = plan_info();
        let input = CommitInput {
            plan: &plan,
            rows: &rows,
            worklist: &worklist,
            snapshot: &snapshot,
            tree: &[],
            ambiguous_dates: 0,
        };
        let mut cache = CommitCache::default();
        let mut store = MemStore::failing(CommitStage::Distributions);

        let err = commit_plan(&input, &mut cache, &mut store).unwrap_err();
        match &err {
            ImportError::CommitPartialFailure { plan_id, stage, .. } => {
                assert_eq!(plan_id, "plan-1");
                assert_eq!(*stage, CommitStage::Distributions);
            }
            other => panic!("expected partial failure, got {other}"),
        }
        assert_eq!(store.plans.len(), 1);
        assert_eq!(store.lines.len(), 1);
        assert_eq!(store.periods.len(), 3);

        // Clear the injected failure and retry with the same cache.
        store.fail_at = None;
        let report = commit_plan(&input, &mut cache, &mut store).unwrap();
        assert_eq!(report.plan_id, "plan-1");
        assert_eq!(store.plans.len(), 1, "plan must not be duplicated");
        assert_eq!(store.lines.len(), 1, "lines must not be duplicated");
        assert_eq!(store.periods.len(), 3, "periods must not be duplicated");
        assert_eq!(store.distribution_calls, 1);
    }

    #[test]
    fn plan_failure_is_plain_and_fully_retryable() {
        let rows = vec![row(0, "L1", 100.0, Some("Google"))];
        let snapshot = snapshot_with_google();
        let worklist = build_worklist(&rows, &snapshot);
        let plan = plan_info();
        let input = CommitInput {
            plan: &plan,
            rows: &rows,
            worklist: &worklist,
            snapshot: &snapshot,
            tree: &[],
            ambiguous_dates: 0,
        };
        let mut cache = CommitCache::default();
        let mut store = MemStore::failing(CommitStage::Plan);

        let err = commit_plan(&input, &mut cache, &mut store).unwrap_err();
        assert!(matches!(
            err,
            ImportError::CommitFailed { stage: CommitStage::Plan, .. }
        ));
        assert!(cache.plan_id.is_none());
        assert!(store.plans.is_empty());
    }

    #[test]
    fn metrics_commit_skips_unmatched_rows() {
        let rows = vec![
            MetricRowDraft {
                row_index: 0,
                code: Some("L1".into()),
                campaign: None,
                period: NaiveDate::from_ymd_opt(2025, 11, 1),
                impressions: Some(100.0),
                clicks: None,
                conversions: None,
                spend: Some(50.0),
            },
            MetricRowDraft {
                row_index: 1,
                code: Some("NOPE".into()),
                campaign: None,
                period: NaiveDate::from_ymd_opt(2025, 11, 1),
                impressions: None,
                clicks: None,
                conversions: None,
                spend: None,
            },
        ];
        let matches = vec![
            MatchResult {
                row_index: 0,
                raw_key: "L1".into(),
                matched_line_id: Some("line-1".into()),
                match_kind: MatchKind::Exact,
                confidence: 100,
            },
            MatchResult {
                row_index: 1,
                raw_key: "NOPE".into(),
                matched_line_id: None,
                match_kind: MatchKind::None,
                confidence: 0,
            },
        ];
        let mut store = MemStore::default();
        let report = commit_metrics("plan-7", &rows, &matches, 0, &mut store).unwrap();

        assert_eq!(report.actuals_created, 1);
        assert_eq!(report.rows_unmatched, vec![1]);
        assert_eq!(store.actuals[0].line_id, "line-1");
    }

    #[test]
    fn month_span_covers_partial_months() {
        let months = months_between(
            NaiveDate::from_ymd_opt(2025, 11, 15).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(),
        );
        assert_eq!(
            months,
            vec![
                NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 12, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            ]
        );
    }
}
