use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::CatalogError;
use crate::model::EntityKind;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One canonical entity as the external catalog knows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

/// Attributes for a catalog create, fed back via `add_created_entity`.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub name: String,
    pub parent_id: Option<String>,
}

/// Session-scoped view of the canonical catalog.
///
/// One snapshot belongs to exactly one import session. Entities created
/// mid-session are appended here so later lookups (a channel created right
/// after its vehicle) succeed without re-fetching the external catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogSnapshot {
    entries: BTreeMap<EntityKind, Vec<CatalogEntry>>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EntityKind, entry: CatalogEntry) {
        self.entries.entry(kind).or_default().push(entry);
    }

    /// Append an entity created during this session.
    pub fn add_created_entity(&mut self, kind: EntityKind, entry: CatalogEntry) {
        self.insert(kind, entry);
    }

    pub fn entries(&self, kind: EntityKind) -> &[CatalogEntry] {
        self.entries.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Case-insensitive exact name lookup (labels are trimmed first).
    pub fn find_by_name(&self, kind: EntityKind, label: &str) -> Option<&CatalogEntry> {
        let needle = label.trim().to_lowercase();
        self.entries(kind)
            .iter()
            .find(|e| e.name.trim().to_lowercase() == needle)
    }

    pub fn find_by_id(&self, kind: EntityKind, id: &str) -> Option<&CatalogEntry> {
        self.entries(kind).iter().find(|e| e.id == id)
    }

    pub fn contains_id(&self, kind: EntityKind, id: &str) -> bool {
        self.find_by_id(kind, id).is_some()
    }
}

// ---------------------------------------------------------------------------
// External interfaces
// ---------------------------------------------------------------------------

/// Read/write access to the canonical catalog. Implemented by the caller;
/// the engine only sees pre-fetched snapshots and explicit create results.
pub trait CatalogSource {
    /// All non-deleted canonical entities of the requested kinds.
    fn fetch_catalog(&self, kinds: &[EntityKind]) -> Result<CatalogSnapshot, CatalogError>;

    fn create_entity(&mut self, kind: EntityKind, entity: &NewEntity)
        -> Result<CatalogEntry, CatalogError>;
}

/// A canonical plan line as needed by the metrics matcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineRef {
    pub id: String,
    pub code: String,
    pub secondary_key: Option<String>,
    pub display_name: String,
}

/// Read access to an existing plan's lines (metrics-import variant).
pub trait LineSource {
    fn fetch_lines(&self, plan_id: &str) -> Result<Vec<LineRef>, CatalogError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str) -> CatalogEntry {
        CatalogEntry {
            id: id.into(),
            name: name.into(),
            parent_id: None,
        }
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let mut snapshot = CatalogSnapshot::new();
        snapshot.insert(EntityKind::Vehicle, entry("v1", "Google"));

        assert_eq!(
            snapshot.find_by_name(EntityKind::Vehicle, "google ").map(|e| e.id.as_str()),
            Some("v1")
        );
        assert!(snapshot.find_by_name(EntityKind::Channel, "google").is_none());
    }

    #[test]
    fn created_entities_are_visible_to_later_lookups() {
        let mut snapshot = CatalogSnapshot::new();
        snapshot.add_created_entity(EntityKind::Vehicle, entry("v9", "Meta"));
        assert!(snapshot.contains_id(EntityKind::Vehicle, "v9"));
        assert!(snapshot.find_by_name(EntityKind::Vehicle, "meta").is_some());
    }
}
