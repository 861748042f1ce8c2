use std::fmt;

use uuid::Uuid;

use crate::model::{EntityKind, FieldId, WizardStep};

/// Which external write of the commit sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStage {
    Plan,
    Lines,
    BudgetPeriods,
    Distributions,
    Actuals,
}

impl fmt::Display for CommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Lines => write!(f, "lines"),
            Self::BudgetPeriods => write!(f, "budget_periods"),
            Self::Distributions => write!(f, "distributions"),
            Self::Actuals => write!(f, "actuals"),
        }
    }
}

#[derive(Debug)]
pub enum ImportError {
    /// TOML parse / deserialization error in a schema config.
    ConfigParse(String),
    /// Schema config validation error (unknown field name, empty family, etc.).
    ConfigValidation(String),
    /// A field required for this import kind has no non-ignore mapping.
    MissingRequiredMapping { field: FieldId },
    /// Metrics imports need at least one row-identifying mapping.
    MissingRowIdentifier,
    /// Column index outside the header row.
    UnknownColumn(usize),
    /// A date format was set on a column not mapped to a date-valued field.
    NotDateColumn(usize),
    /// A transition guard rejected the requested step change.
    StepGuard { step: WizardStep, reason: String },
    /// A mutating action was requested while another is in flight.
    ActionInFlight,
    /// Catalog snapshot fetch failed. Transient; wizard state is untouched.
    CatalogFetchFailed(String),
    /// Canonical line fetch failed. Transient; wizard state is untouched.
    LineFetchFailed(String),
    /// External entity creation failed; the entry is Pending again.
    EntityCreationFailed { label: String, detail: String },
    /// No worklist entry with this id.
    UnknownWorklistEntry(Uuid),
    /// Resolution referenced a canonical id absent from the session catalog.
    UnknownCanonicalId { kind: EntityKind, id: String },
    /// Manual match referenced a line id absent from the fetched lines.
    UnknownLineId(String),
    /// Dimension order contains a repeated dimension.
    InvalidDimensionOrder(String),
    /// Commit failed before the plan record existed. Safe to retry whole.
    CommitFailed { stage: CommitStage, detail: String },
    /// Plan and lines exist but a later write failed. Retry completes the
    /// remainder without duplicating; the created plan survives.
    CommitPartialFailure { plan_id: String, stage: CommitStage, detail: String },
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "schema config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "schema config validation error: {msg}"),
            Self::MissingRequiredMapping { field } => {
                write!(f, "required field '{field}' has no mapped column")
            }
            Self::MissingRowIdentifier => {
                write!(f, "metrics import needs a line code or campaign name column")
            }
            Self::UnknownColumn(idx) => write!(f, "no source column at index {idx}"),
            Self::NotDateColumn(idx) => {
                write!(f, "column {idx} is not mapped to a date-valued field")
            }
            Self::StepGuard { step, reason } => {
                write!(f, "cannot leave step '{step}': {reason}")
            }
            Self::ActionInFlight => write!(f, "another action is still in flight"),
            Self::CatalogFetchFailed(msg) => write!(f, "catalog fetch failed: {msg}"),
            Self::LineFetchFailed(msg) => write!(f, "line fetch failed: {msg}"),
            Self::EntityCreationFailed { label, detail } => {
                write!(f, "creating entity '{label}' failed: {detail}")
            }
            Self::UnknownWorklistEntry(id) => write!(f, "no worklist entry {id}"),
            Self::UnknownCanonicalId { kind, id } => {
                write!(f, "no canonical {kind} with id '{id}'")
            }
            Self::UnknownLineId(id) => write!(f, "no canonical line with id '{id}'"),
            Self::InvalidDimensionOrder(msg) => write!(f, "invalid dimension order: {msg}"),
            Self::CommitFailed { stage, detail } => {
                write!(f, "commit failed at stage '{stage}': {detail}")
            }
            Self::CommitPartialFailure { plan_id, stage, detail } => {
                write!(
                    f,
                    "commit partially applied (plan '{plan_id}' created); stage '{stage}' failed: {detail}"
                )
            }
        }
    }
}

impl std::error::Error for ImportError {}

/// Error from a `CatalogSource` or `LineSource` implementation.
#[derive(Debug, Clone)]
pub struct CatalogError(pub String);

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CatalogError {}

/// Error from a `PlanStore` implementation.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}
