//! `planline-import` — Plan import & reconciliation pipeline engine.
//!
//! Pure engine crate: receives pre-decoded tables, returns structured results.
//! No CLI or IO dependencies. External reads and writes go through the
//! `CatalogSource`, `LineSource` and `PlanStore` traits, implemented by the
//! caller.

pub mod allocate;
pub mod catalog;
pub mod commit;
pub mod dates;
pub mod error;
pub mod matcher;
pub mod model;
pub mod parse;
pub mod reconcile;
pub mod schema;
pub mod wizard;

pub use catalog::{CatalogSnapshot, CatalogSource, LineSource};
pub use commit::{CommitReport, PlanStore};
pub use error::ImportError;
pub use model::{ImportKind, RawTable, Scalar};
pub use schema::SchemaConfig;
pub use wizard::ImportWizardState;
