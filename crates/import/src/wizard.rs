//! The import wizard: a linear step machine over the pipeline stages.
//!
//! Each step's output is cached on this aggregate, so stepping backward and
//! forward again replays state instead of re-deriving it; only an upstream
//! edit (new table, mapping change) invalidates what depends on it. The two
//! external fetches and the final commit are the only suspension points, and
//! every mutating call is rejected while one of them is in flight.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::allocate::{self, AllocLine, DimensionKind, HierarchyNode};
use crate::catalog::{CatalogEntry, CatalogSnapshot, LineRef};
use crate::commit::{commit_metrics, commit_plan, CommitCache, CommitInput, CommitReport, PlanStore};
use crate::error::{CatalogError, ImportError};
use crate::matcher::{apply_overrides, match_rows, MatchResult};
use crate::model::{
    DateFormatId, EntityKind, FieldId, ImportKind, MetricRowDraft, PlanInfo, PlanRowDraft,
    RawTable, WizardStep,
};
use crate::parse::{parse_metric_rows, parse_plan_rows, ParseReport};
use crate::reconcile::{build_worklist, Worklist};
use crate::schema::{MappingSet, SchemaConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum PendingFetch {
    Catalog,
    Lines,
}

/// The orchestrator's single mutable aggregate. Created empty at wizard
/// start, mutated monotonically forward, discarded on cancel or after a
/// successful commit.
#[derive(Debug, Serialize)]
pub struct ImportWizardState {
    kind: ImportKind,
    step: WizardStep,
    #[serde(skip)]
    config: SchemaConfig,

    table: Option<RawTable>,
    mappings: Option<MappingSet>,
    plan_info: Option<PlanInfo>,
    plan_rows: Option<Vec<PlanRowDraft>>,
    metric_rows: Option<Vec<MetricRowDraft>>,
    parse_report: Option<ParseReport>,

    snapshot: Option<CatalogSnapshot>,
    worklist: Option<Worklist>,

    target_plan_id: Option<String>,
    lines: Option<Vec<LineRef>>,
    matches: Option<Vec<MatchResult>>,
    manual_matches: BTreeMap<usize, String>,

    dimension_order: Vec<DimensionKind>,
    tree: Option<Vec<HierarchyNode>>,

    is_processing: bool,
    is_committing: bool,
    pending: Option<PendingFetch>,
    commit_cache: CommitCache,
}

impl ImportWizardState {
    pub fn new(kind: ImportKind) -> Self {
        Self::with_config(kind, SchemaConfig::default())
    }

    pub fn with_config(kind: ImportKind, config: SchemaConfig) -> Self {
        ImportWizardState {
            kind,
            step: WizardStep::Upload,
            config,
            table: None,
            mappings: None,
            plan_info: None,
            plan_rows: None,
            metric_rows: None,
            parse_report: None,
            snapshot: None,
            worklist: None,
            target_plan_id: None,
            lines: None,
            matches: None,
            manual_matches: BTreeMap::new(),
            dimension_order: Vec::new(),
            tree: None,
            is_processing: false,
            is_committing: false,
            pending: None,
            commit_cache: CommitCache::default(),
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn kind(&self) -> ImportKind {
        self.kind
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn is_committing(&self) -> bool {
        self.is_committing
    }

    pub fn table(&self) -> Option<&RawTable> {
        self.table.as_ref()
    }

    pub fn mappings(&self) -> Option<&MappingSet> {
        self.mappings.as_ref()
    }

    pub fn plan_info(&self) -> Option<&PlanInfo> {
        self.plan_info.as_ref()
    }

    pub fn plan_rows(&self) -> Option<&[PlanRowDraft]> {
        self.plan_rows.as_deref()
    }

    pub fn metric_rows(&self) -> Option<&[MetricRowDraft]> {
        self.metric_rows.as_deref()
    }

    pub fn parse_report(&self) -> Option<&ParseReport> {
        self.parse_report.as_ref()
    }

    pub fn snapshot(&self) -> Option<&CatalogSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn worklist(&self) -> Option<&Worklist> {
        self.worklist.as_ref()
    }

    pub fn match_results(&self) -> Option<&[MatchResult]> {
        self.matches.as_deref()
    }

    pub fn dimension_order(&self) -> &[DimensionKind] {
        &self.dimension_order
    }

    pub fn tree(&self) -> Option<&[HierarchyNode]> {
        self.tree.as_deref()
    }

    // -- guards ------------------------------------------------------------

    fn guard_idle(&self) -> Result<(), ImportError> {
        if self.is_processing || self.is_committing {
            return Err(ImportError::ActionInFlight);
        }
        Ok(())
    }

    fn guard_step(&self, expected: WizardStep) -> Result<(), ImportError> {
        if self.step != expected {
            return Err(ImportError::StepGuard {
                step: self.step,
                reason: format!("operation belongs to step '{expected}'"),
            });
        }
        Ok(())
    }

    fn guard(&self, reason: &str) -> ImportError {
        ImportError::StepGuard {
            step: self.step,
            reason: reason.to_string(),
        }
    }

    // -- upload ------------------------------------------------------------

    /// Attach a freshly decoded table. Only valid at Upload; everything
    /// derived from a previous table is dropped.
    pub fn attach_table(&mut self, table: RawTable) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Upload)?;
        self.table = Some(table);
        self.mappings = None;
        self.invalidate_parsed();
        self.commit_cache = CommitCache::default();
        Ok(())
    }

    fn invalidate_parsed(&mut self) {
        self.plan_rows = None;
        self.metric_rows = None;
        self.parse_report = None;
        self.snapshot = None;
        self.worklist = None;
        self.lines = None;
        self.matches = None;
        self.manual_matches.clear();
        self.tree = None;
    }

    // -- mapping edits -----------------------------------------------------

    pub fn set_mapping(&mut self, column: usize, target: Option<FieldId>) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Mapping)?;
        let mappings = self.mappings.as_mut().ok_or_else(|| {
            ImportError::StepGuard {
                step: self.step,
                reason: "no mappings inferred yet".into(),
            }
        })?;
        mappings.set_mapping(column, target)?;
        self.invalidate_parsed();
        Ok(())
    }

    pub fn set_date_format(&mut self, column: usize, format: DateFormatId) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Mapping)?;
        let mappings = self.mappings.as_mut().ok_or_else(|| {
            ImportError::StepGuard {
                step: self.step,
                reason: "no mappings inferred yet".into(),
            }
        })?;
        mappings.set_date_format(column, format)?;
        self.invalidate_parsed();
        Ok(())
    }

    /// Explicit "re-detect": discards overrides and re-runs inference.
    pub fn redetect_mappings(&mut self) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Mapping)?;
        let table = self.table.as_ref().ok_or_else(|| self.guard("no table"))?;
        self.mappings = Some(MappingSet::infer(table, self.kind, &self.config));
        self.invalidate_parsed();
        Ok(())
    }

    // -- plan info ---------------------------------------------------------

    pub fn set_plan_info(&mut self, info: PlanInfo) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::PlanInfo)?;
        self.plan_info = Some(info);
        // A changed budget or date span feeds the tree and the commit.
        self.tree = None;
        Ok(())
    }

    // -- forward / backward ------------------------------------------------

    /// Advance one step. Guards are checked against cached state; a
    /// transition whose output must be fetched externally (catalog snapshot,
    /// canonical lines) fails here with a pointer to the begin/complete pair
    /// unless that output is already cached from an earlier pass.
    pub fn advance(&mut self) -> Result<WizardStep, ImportError> {
        self.guard_idle()?;
        match (self.kind, self.step) {
            (_, WizardStep::Upload) => {
                let Some(table) = self.table.as_ref() else {
                    return Err(self.guard("no table was read"));
                };
                if self.mappings.is_none() {
                    self.mappings = Some(MappingSet::infer(table, self.kind, &self.config));
                }
                self.step = WizardStep::Mapping;
            }
            (ImportKind::PlanLines, WizardStep::Mapping) => {
                self.ensure_parsed()?;
                self.step = WizardStep::PlanInfo;
            }
            (ImportKind::Metrics, WizardStep::Mapping) => {
                self.ensure_parsed()?;
                if self.matches.is_none() {
                    return Err(self.guard(
                        "canonical lines not fetched; use begin_line_fetch/complete_line_fetch",
                    ));
                }
                self.step = WizardStep::Matching;
            }
            (ImportKind::PlanLines, WizardStep::PlanInfo) => {
                let name_ok = self
                    .plan_info
                    .as_ref()
                    .map(|p| !p.name.trim().is_empty())
                    .unwrap_or(false);
                if !name_ok {
                    return Err(self.guard("plan name is required"));
                }
                if self.worklist.is_none() {
                    return Err(self.guard(
                        "catalog not fetched; use begin_catalog_fetch/complete_catalog_fetch",
                    ));
                }
                self.step = WizardStep::EntityResolution;
            }
            (ImportKind::PlanLines, WizardStep::EntityResolution) => {
                let complete = self.worklist.as_ref().map(|w| w.is_complete()).unwrap_or(false);
                if !complete {
                    return Err(self.guard("worklist has pending entries"));
                }
                self.step = WizardStep::HierarchyConfig;
            }
            (ImportKind::PlanLines, WizardStep::HierarchyConfig) => {
                // A zero-length dimension order is valid ("no breakdown").
                if self.tree.is_none() {
                    self.rebuild_tree()?;
                }
                self.step = WizardStep::Confirm;
            }
            (ImportKind::Metrics, WizardStep::Matching) => {
                self.step = WizardStep::Confirm;
            }
            (_, WizardStep::Confirm) => {
                return Err(self.guard("use commit() to finish"));
            }
            (_, WizardStep::Committed) => {
                return Err(self.guard("wizard already committed"));
            }
            (kind, step) => {
                return Err(ImportError::StepGuard {
                    step,
                    reason: format!("step unreachable for {kind} import"),
                });
            }
        }
        Ok(self.step)
    }

    /// Step back to the previous step. Cached outputs are kept, so moving
    /// forward again is cheap.
    pub fn back(&mut self) -> Result<WizardStep, ImportError> {
        self.guard_idle()?;
        let sequence = self.sequence();
        let position = sequence.iter().position(|s| *s == self.step);
        match position {
            Some(0) | None => Err(self.guard("nothing before this step")),
            Some(_) if self.step == WizardStep::Committed => {
                Err(self.guard("wizard already committed"))
            }
            Some(i) => {
                self.step = sequence[i - 1];
                Ok(self.step)
            }
        }
    }

    fn sequence(&self) -> &'static [WizardStep] {
        match self.kind {
            ImportKind::PlanLines => &[
                WizardStep::Upload,
                WizardStep::Mapping,
                WizardStep::PlanInfo,
                WizardStep::EntityResolution,
                WizardStep::HierarchyConfig,
                WizardStep::Confirm,
                WizardStep::Committed,
            ],
            ImportKind::Metrics => &[
                WizardStep::Upload,
                WizardStep::Mapping,
                WizardStep::Matching,
                WizardStep::Confirm,
                WizardStep::Committed,
            ],
        }
    }

    fn ensure_parsed(&mut self) -> Result<(), ImportError> {
        let table = self.table.as_ref().ok_or_else(|| ImportError::StepGuard {
            step: self.step,
            reason: "no table was read".into(),
        })?;
        let mappings = self.mappings.as_ref().ok_or_else(|| ImportError::StepGuard {
            step: self.step,
            reason: "no mappings inferred".into(),
        })?;
        mappings.validate(self.kind)?;

        match self.kind {
            ImportKind::PlanLines => {
                if self.plan_rows.is_none() {
                    let out = parse_plan_rows(table, mappings);
                    self.plan_rows = Some(out.rows);
                    self.parse_report = Some(out.report);
                }
            }
            ImportKind::Metrics => {
                if self.metric_rows.is_none() {
                    let out = parse_metric_rows(table, mappings);
                    self.metric_rows = Some(out.rows);
                    self.parse_report = Some(out.report);
                }
            }
        }
        Ok(())
    }

    // -- catalog fetch (suspension point) ----------------------------------

    /// Start the catalog fetch for the PlanInfo → EntityResolution
    /// transition. Returns the kinds the caller must fetch. Until
    /// `complete_catalog_fetch` or `cancel_fetch`, every mutating call is
    /// rejected.
    pub fn begin_catalog_fetch(&mut self) -> Result<Vec<EntityKind>, ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::PlanInfo)?;
        let name_ok = self
            .plan_info
            .as_ref()
            .map(|p| !p.name.trim().is_empty())
            .unwrap_or(false);
        if !name_ok {
            return Err(self.guard("plan name is required"));
        }
        let rows = self
            .plan_rows
            .as_ref()
            .ok_or_else(|| self.guard("rows not parsed"))?;

        let mut kinds: Vec<EntityKind> = Vec::new();
        for row in rows {
            for kind in row.labels.keys() {
                if !kinds.contains(kind) {
                    kinds.push(*kind);
                }
                if let Some(parent) = kind.parent_kind() {
                    if !kinds.contains(&parent) {
                        kinds.push(parent);
                    }
                }
            }
        }
        kinds.sort();

        self.is_processing = true;
        self.pending = Some(PendingFetch::Catalog);
        Ok(kinds)
    }

    /// Apply the catalog fetch result. Success builds the worklist and
    /// enters EntityResolution; failure surfaces `CatalogFetchFailed` and
    /// leaves the wizard exactly where it was.
    pub fn complete_catalog_fetch(
        &mut self,
        result: Result<CatalogSnapshot, CatalogError>,
    ) -> Result<(), ImportError> {
        if self.pending != Some(PendingFetch::Catalog) {
            return Err(self.guard("no catalog fetch in flight"));
        }
        self.is_processing = false;
        self.pending = None;

        let snapshot = result.map_err(|e| ImportError::CatalogFetchFailed(e.to_string()))?;
        let rows = self
            .plan_rows
            .as_ref()
            .ok_or_else(|| self.guard("rows not parsed"))?;
        self.worklist = Some(build_worklist(rows, &snapshot));
        self.snapshot = Some(snapshot);
        self.step = WizardStep::EntityResolution;
        Ok(())
    }

    /// Abandon an in-flight fetch; the wizard stays at its last-good step.
    pub fn cancel_fetch(&mut self) {
        self.is_processing = false;
        self.pending = None;
    }

    // -- entity resolution -------------------------------------------------

    pub fn resolve_entity(&mut self, entity_id: Uuid, canonical_id: &str) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::EntityResolution)?;
        let snapshot = self
            .snapshot
            .as_ref()
            .ok_or_else(|| self.guard("no catalog snapshot"))?;
        let worklist = self
            .worklist
            .as_mut()
            .ok_or(ImportError::UnknownWorklistEntry(entity_id))?;
        worklist.resolve(entity_id, canonical_id, snapshot)?;
        self.tree = None;
        Ok(())
    }

    pub fn ignore_entity(&mut self, entity_id: Uuid) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::EntityResolution)?;
        let worklist = self
            .worklist
            .as_mut()
            .ok_or(ImportError::UnknownWorklistEntry(entity_id))?;
        worklist.ignore(entity_id)?;
        self.tree = None;
        Ok(())
    }

    pub fn unignore_entity(&mut self, entity_id: Uuid) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::EntityResolution)?;
        let worklist = self
            .worklist
            .as_mut()
            .ok_or(ImportError::UnknownWorklistEntry(entity_id))?;
        worklist.unignore(entity_id)?;
        self.tree = None;
        Ok(())
    }

    /// Flag an entry while the caller runs the external create. Entity
    /// creation is per-entry and does not lock the whole wizard; the
    /// Creating status itself blocks the completeness gate.
    pub fn mark_entity_creating(&mut self, entity_id: Uuid) -> Result<(), ImportError> {
        self.guard_step(WizardStep::EntityResolution)?;
        self.worklist
            .as_mut()
            .ok_or(ImportError::UnknownWorklistEntry(entity_id))?
            .mark_creating(entity_id)
    }

    /// Canonical id the caller should pass as `parent_id` when creating this
    /// entry externally (a channel's vehicle, already canonical or resolved).
    pub fn entity_parent_id(&self, entity_id: Uuid) -> Option<String> {
        let worklist = self.worklist.as_ref()?;
        let snapshot = self.snapshot.as_ref()?;
        worklist.effective_parent_id(entity_id, snapshot)
    }

    /// Apply the external create result. Success feeds the new entity into
    /// the session catalog and resolves the entry; failure returns it to
    /// Pending, other entries unaffected.
    pub fn complete_entity_creation(
        &mut self,
        entity_id: Uuid,
        result: Result<CatalogEntry, CatalogError>,
    ) -> Result<(), ImportError> {
        self.guard_step(WizardStep::EntityResolution)?;
        let worklist = self
            .worklist
            .as_mut()
            .ok_or(ImportError::UnknownWorklistEntry(entity_id))?;
        let entry = worklist
            .get(entity_id)
            .ok_or(ImportError::UnknownWorklistEntry(entity_id))?;
        let kind = entry.kind;
        let label = entry.raw_label.clone();

        match result {
            Ok(created) => {
                let snapshot = self
                    .snapshot
                    .as_mut()
                    .ok_or_else(|| ImportError::CatalogFetchFailed("no snapshot".into()))?;
                snapshot.add_created_entity(kind, created.clone());
                // Re-borrow: resolve validates against the updated snapshot.
                let worklist = self
                    .worklist
                    .as_mut()
                    .ok_or(ImportError::UnknownWorklistEntry(entity_id))?;
                worklist.resolve(entity_id, &created.id, snapshot)?;
                self.tree = None;
                Ok(())
            }
            Err(e) => {
                worklist.unmark_creating(entity_id)?;
                Err(ImportError::EntityCreationFailed {
                    label,
                    detail: e.to_string(),
                })
            }
        }
    }

    // -- hierarchy config --------------------------------------------------

    /// Choose the breakdown order (0–3 dimensions) and build the tree.
    pub fn set_dimension_order(&mut self, order: Vec<DimensionKind>) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::HierarchyConfig)?;
        self.dimension_order = order;
        self.rebuild_tree()
    }

    /// Rebuild the allocation tree from the current rows and order. This is
    /// how a source-budget change reaches the tree; per-node planned edits
    /// never propagate by themselves.
    pub fn rebuild_tree(&mut self) -> Result<(), ImportError> {
        let rows = self
            .plan_rows
            .as_ref()
            .ok_or_else(|| self.guard("rows not parsed"))?;
        let alloc_lines: Vec<AllocLine> = self
            .included_plan_rows(rows)
            .iter()
            .map(|row| AllocLine {
                budget: row.budget,
                subdivision: row.label(EntityKind::Subdivision).map(|s| s.to_string()),
                moment: row.label(EntityKind::Moment).map(|s| s.to_string()),
                funnel_stage: row.label(EntityKind::FunnelStage).map(|s| s.to_string()),
            })
            .collect();
        let total = self.total_budget(rows);
        self.tree = Some(allocate::build_tree(&alloc_lines, &self.dimension_order, total)?);
        Ok(())
    }

    fn included_plan_rows<'a>(&self, rows: &'a [PlanRowDraft]) -> Vec<&'a PlanRowDraft> {
        match (&self.worklist, &self.snapshot) {
            (Some(worklist), Some(snapshot)) => rows
                .iter()
                .filter(|row| !worklist.row_excluded(row, snapshot))
                .collect(),
            _ => rows.iter().collect(),
        }
    }

    fn total_budget(&self, rows: &[PlanRowDraft]) -> f64 {
        self.plan_info
            .as_ref()
            .and_then(|p| p.total_budget)
            .unwrap_or_else(|| {
                self.included_plan_rows(rows)
                    .iter()
                    .map(|r| r.budget)
                    .sum()
            })
    }

    /// Edit one distribution node's planned amount.
    pub fn set_node_planned(&mut self, distribution_id: Uuid, value: f64) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::HierarchyConfig)?;
        let rows = self
            .plan_rows
            .as_ref()
            .ok_or_else(|| self.guard("rows not parsed"))?;
        let total = self.total_budget(rows);
        let tree = self
            .tree
            .as_mut()
            .ok_or_else(|| ImportError::StepGuard {
                step: WizardStep::HierarchyConfig,
                reason: "no tree built".into(),
            })?;
        if !allocate::set_planned(tree, distribution_id, value, total) {
            return Err(ImportError::StepGuard {
                step: WizardStep::HierarchyConfig,
                reason: format!("no node '{distribution_id}' or negative amount"),
            });
        }
        Ok(())
    }

    // -- line fetch + matching (metrics variant) ---------------------------

    /// Start the canonical-line fetch for the Mapping → Matching transition.
    pub fn begin_line_fetch(&mut self, plan_id: &str) -> Result<(), ImportError> {
        self.guard_idle()?;
        if self.kind != ImportKind::Metrics {
            return Err(self.guard("line fetch applies to metrics imports"));
        }
        self.guard_step(WizardStep::Mapping)?;
        self.ensure_parsed()?;
        self.target_plan_id = Some(plan_id.to_string());
        self.is_processing = true;
        self.pending = Some(PendingFetch::Lines);
        Ok(())
    }

    /// Apply the line fetch result: run the cascade and enter Matching.
    pub fn complete_line_fetch(
        &mut self,
        result: Result<Vec<LineRef>, CatalogError>,
    ) -> Result<(), ImportError> {
        if self.pending != Some(PendingFetch::Lines) {
            return Err(self.guard("no line fetch in flight"));
        }
        self.is_processing = false;
        self.pending = None;

        let lines = result.map_err(|e| ImportError::LineFetchFailed(e.to_string()))?;
        let rows = self
            .metric_rows
            .as_ref()
            .ok_or_else(|| self.guard("rows not parsed"))?;
        self.matches = Some(apply_overrides(
            match_rows(rows, &lines),
            &self.manual_matches,
        ));
        self.lines = Some(lines);
        self.step = WizardStep::Matching;
        Ok(())
    }

    /// Manually bind one row to a line. Replaces the cascade's answer for
    /// that row and survives cascade re-runs.
    pub fn set_manual_match(&mut self, row_index: usize, line_id: &str) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Matching)?;
        let known = self
            .lines
            .as_ref()
            .map(|lines| lines.iter().any(|l| l.id == line_id))
            .unwrap_or(false);
        if !known {
            return Err(ImportError::UnknownLineId(line_id.to_string()));
        }
        self.manual_matches.insert(row_index, line_id.to_string());
        self.rerun_matching()
    }

    pub fn clear_manual_match(&mut self, row_index: usize) -> Result<(), ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Matching)?;
        self.manual_matches.remove(&row_index);
        self.rerun_matching()
    }

    /// Re-run the cascade over the cached rows and lines, then re-apply
    /// manual picks.
    pub fn rerun_matching(&mut self) -> Result<(), ImportError> {
        let rows = self
            .metric_rows
            .as_ref()
            .ok_or_else(|| self.guard("rows not parsed"))?;
        let lines = self
            .lines
            .as_ref()
            .ok_or_else(|| self.guard("lines not fetched"))?;
        self.matches = Some(apply_overrides(
            match_rows(rows, lines),
            &self.manual_matches,
        ));
        Ok(())
    }

    // -- commit ------------------------------------------------------------

    /// The Confirm → Committed transition: the one place external mutation
    /// happens. On failure the step stays Confirm, state is intact, and a
    /// retry resumes from the first write that did not happen (see
    /// `CommitCache`).
    pub fn commit(&mut self, store: &mut dyn PlanStore) -> Result<CommitReport, ImportError> {
        self.guard_idle()?;
        self.guard_step(WizardStep::Confirm)?;
        self.is_committing = true;
        let result = self.run_commit(store);
        self.is_committing = false;
        if result.is_ok() {
            self.step = WizardStep::Committed;
        }
        result
    }

    fn run_commit(&mut self, store: &mut dyn PlanStore) -> Result<CommitReport, ImportError> {
        let ambiguous_dates = self
            .parse_report
            .as_ref()
            .map(|r| r.ambiguous_dates)
            .unwrap_or(0);

        match self.kind {
            ImportKind::PlanLines => {
                let plan = self
                    .plan_info
                    .as_ref()
                    .ok_or_else(|| self.guard("no plan info"))?;
                let rows = self
                    .plan_rows
                    .as_ref()
                    .ok_or_else(|| self.guard("rows not parsed"))?;
                let worklist = self
                    .worklist
                    .as_ref()
                    .ok_or_else(|| self.guard("no worklist"))?;
                let snapshot = self
                    .snapshot
                    .as_ref()
                    .ok_or_else(|| self.guard("no catalog snapshot"))?;
                let input = CommitInput {
                    plan,
                    rows,
                    worklist,
                    snapshot,
                    tree: self.tree.as_deref().unwrap_or(&[]),
                    ambiguous_dates,
                };
                commit_plan(&input, &mut self.commit_cache, store)
            }
            ImportKind::Metrics => {
                let plan_id = self
                    .target_plan_id
                    .as_ref()
                    .ok_or_else(|| self.guard("no target plan"))?;
                let rows = self
                    .metric_rows
                    .as_ref()
                    .ok_or_else(|| self.guard("rows not parsed"))?;
                let matches = self
                    .matches
                    .as_ref()
                    .ok_or_else(|| self.guard("matching not run"))?;
                commit_metrics(plan_id, rows, matches, ambiguous_dates, store)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scalar;

    fn plan_table() -> RawTable {
        fn text(s: &str) -> Scalar {
            Scalar::Text(s.into())
        }
        RawTable {
            headers: vec![
                "Codigo".into(),
                "Veiculo".into(),
                "Orcamento".into(),
            ],
            rows: vec![
                vec![text("L1"), text("Google"), Scalar::Number(1000.0)],
                vec![text("L2"), text("Meta"), Scalar::Number(2000.0)],
            ],
        }
    }

    fn wizard_at_plan_info() -> ImportWizardState {
        let mut wizard = ImportWizardState::new(ImportKind::PlanLines);
        wizard.attach_table(plan_table()).unwrap();
        wizard.advance().unwrap();
        wizard.advance().unwrap();
        wizard
            .set_plan_info(PlanInfo {
                name: "Plan".into(),
                start_date: None,
                end_date: None,
                total_budget: None,
            })
            .unwrap();
        wizard
    }

    #[test]
    fn actions_are_rejected_while_a_fetch_is_in_flight() {
        let mut wizard = wizard_at_plan_info();
        wizard.begin_catalog_fetch().unwrap();
        assert!(wizard.is_processing());

        let err = wizard
            .set_plan_info(PlanInfo::default())
            .unwrap_err();
        assert!(matches!(err, ImportError::ActionInFlight));
        assert!(matches!(wizard.back().unwrap_err(), ImportError::ActionInFlight));
        assert!(matches!(
            wizard.begin_catalog_fetch().unwrap_err(),
            ImportError::ActionInFlight
        ));
    }

    #[test]
    fn cancelling_a_fetch_restores_the_last_good_state() {
        let mut wizard = wizard_at_plan_info();
        wizard.begin_catalog_fetch().unwrap();
        wizard.cancel_fetch();

        assert!(!wizard.is_processing());
        assert_eq!(wizard.step(), WizardStep::PlanInfo);
        // A completion after cancel has nothing to apply to.
        let err = wizard
            .complete_catalog_fetch(Ok(CatalogSnapshot::new()))
            .unwrap_err();
        assert!(matches!(err, ImportError::StepGuard { .. }));
        // The fetch can simply be started again.
        wizard.begin_catalog_fetch().unwrap();
        wizard
            .complete_catalog_fetch(Ok(CatalogSnapshot::new()))
            .unwrap();
        assert_eq!(wizard.step(), WizardStep::EntityResolution);
    }

    #[test]
    fn mapping_edits_invalidate_downstream_caches() {
        let mut wizard = wizard_at_plan_info();
        wizard.begin_catalog_fetch().unwrap();
        wizard
            .complete_catalog_fetch(Ok(CatalogSnapshot::new()))
            .unwrap();
        assert!(wizard.worklist().is_some());

        wizard.back().unwrap();
        wizard.back().unwrap();
        assert_eq!(wizard.step(), WizardStep::Mapping);
        wizard.set_mapping(1, None).unwrap();

        // Parsed rows and the worklist derived from them are gone; the
        // plan-level info survives (it does not depend on the mapping).
        assert!(wizard.plan_rows().is_none());
        assert!(wizard.worklist().is_none());
        assert!(wizard.plan_info().is_some());
    }

    #[test]
    fn step_scoped_operations_reject_the_wrong_step() {
        let mut wizard = ImportWizardState::new(ImportKind::PlanLines);
        let err = wizard.set_mapping(0, None).unwrap_err();
        assert!(matches!(err, ImportError::StepGuard { .. }));
        let err = wizard.advance().unwrap_err();
        assert!(matches!(err, ImportError::StepGuard { .. }));
        assert_eq!(wizard.step(), WizardStep::Upload);
    }

    #[test]
    fn metrics_wizard_has_no_catalog_fetch() {
        let mut wizard = ImportWizardState::new(ImportKind::Metrics);
        wizard.attach_table(plan_table()).unwrap();
        wizard.advance().unwrap();
        let err = wizard.begin_catalog_fetch().unwrap_err();
        assert!(matches!(err, ImportError::StepGuard { .. }));
    }
}
