use serde::Serialize;
use uuid::Uuid;

use crate::catalog::CatalogSnapshot;
use crate::error::ImportError;
use crate::model::{EntityKind, PlanRowDraft};

// ---------------------------------------------------------------------------
// Worklist entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Pending,
    Resolved,
    Ignored,
    /// An external "create new entity" call is in flight. Transient; does
    /// not itself resolve the entry.
    Creating,
}

/// The parent a nested entity was referenced under (a channel's vehicle).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentContext {
    pub kind: EntityKind,
    pub raw_label: String,
    /// Set when the parent label was already canonical at worklist build.
    pub canonical_id: Option<String>,
}

/// One free-text label that could not be matched to the canonical catalog,
/// with the rows that referenced it.
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedEntity {
    pub id: Uuid,
    pub kind: EntityKind,
    /// Original casing of the first occurrence.
    pub raw_label: String,
    /// Exactly the row indices whose label equals `raw_label`
    /// case-insensitively (and shares the parent, for nested kinds).
    pub affected_rows: Vec<usize>,
    pub status: EntityStatus,
    pub resolved_canonical_id: Option<String>,
    pub parent: Option<ParentContext>,
}

// ---------------------------------------------------------------------------
// Worklist build
// ---------------------------------------------------------------------------

/// Collect the unresolved labels referenced by the parsed rows.
///
/// Labels are deduplicated case-insensitively per kind; for nested kinds the
/// parent label is part of the dedup key, so the same channel name under two
/// vehicles yields two entries. Labels with a case-insensitive exact match
/// in the snapshot never enter the worklist.
pub fn build_worklist(rows: &[PlanRowDraft], snapshot: &CatalogSnapshot) -> Worklist {
    let mut entries: Vec<UnresolvedEntity> = Vec::new();

    for kind in EntityKind::ALL {
        for row in rows {
            let Some(label) = row.label(kind) else { continue };
            if snapshot.find_by_name(kind, label).is_some() {
                continue;
            }

            let parent_label = kind.parent_kind().and_then(|pk| row.label(pk));
            let label_key = label.trim().to_lowercase();
            let parent_key = parent_label.map(|p| p.trim().to_lowercase());

            let existing = entries.iter_mut().find(|e| {
                e.kind == kind
                    && e.raw_label.trim().to_lowercase() == label_key
                    && e.parent.as_ref().map(|p| p.raw_label.trim().to_lowercase()) == parent_key
            });

            match existing {
                Some(entry) => {
                    if !entry.affected_rows.contains(&row.row_index) {
                        entry.affected_rows.push(row.row_index);
                    }
                }
                None => {
                    let parent = match (kind.parent_kind(), parent_label) {
                        (Some(parent_kind), Some(raw)) => Some(ParentContext {
                            kind: parent_kind,
                            raw_label: raw.trim().to_string(),
                            canonical_id: snapshot
                                .find_by_name(parent_kind, raw)
                                .map(|e| e.id.clone()),
                        }),
                        _ => None,
                    };
                    entries.push(UnresolvedEntity {
                        id: Uuid::new_v4(),
                        kind,
                        raw_label: label.trim().to_string(),
                        affected_rows: vec![row.row_index],
                        status: EntityStatus::Pending,
                        resolved_canonical_id: None,
                        parent,
                    });
                }
            }
        }
    }

    Worklist { entries }
}

// ---------------------------------------------------------------------------
// Worklist operations
// ---------------------------------------------------------------------------

/// The reconciliation worklist and its resolution state. All operations are
/// idempotent: repeating a call with the same arguments leaves the entry in
/// the same final state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Worklist {
    entries: Vec<UnresolvedEntity>,
}

impl Worklist {
    pub fn entries(&self) -> &[UnresolvedEntity] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&UnresolvedEntity> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut UnresolvedEntity, ImportError> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(ImportError::UnknownWorklistEntry(id))
    }

    /// Bind an entry to a canonical entity. The id must exist in the session
    /// snapshot (which includes entities created earlier in this session).
    pub fn resolve(
        &mut self,
        id: Uuid,
        canonical_id: &str,
        snapshot: &CatalogSnapshot,
    ) -> Result<(), ImportError> {
        let kind = self.get_mut(id)?.kind;
        if !snapshot.contains_id(kind, canonical_id) {
            return Err(ImportError::UnknownCanonicalId {
                kind,
                id: canonical_id.to_string(),
            });
        }
        let entry = self.get_mut(id)?;
        entry.status = EntityStatus::Resolved;
        entry.resolved_canonical_id = Some(canonical_id.to_string());
        Ok(())
    }

    /// Flag an entry while an external create is in flight. No-op on an
    /// already-resolved entry.
    pub fn mark_creating(&mut self, id: Uuid) -> Result<(), ImportError> {
        let entry = self.get_mut(id)?;
        if entry.status != EntityStatus::Resolved {
            entry.status = EntityStatus::Creating;
        }
        Ok(())
    }

    /// Return a `Creating` entry to `Pending` (the create failed or was
    /// abandoned). Other statuses are untouched.
    pub fn unmark_creating(&mut self, id: Uuid) -> Result<(), ImportError> {
        let entry = self.get_mut(id)?;
        if entry.status == EntityStatus::Creating {
            entry.status = EntityStatus::Pending;
        }
        Ok(())
    }

    /// Exclude this entry's rows from final creation (unless those rows have
    /// other unresolved references, which still block).
    pub fn ignore(&mut self, id: Uuid) -> Result<(), ImportError> {
        let entry = self.get_mut(id)?;
        entry.status = EntityStatus::Ignored;
        entry.resolved_canonical_id = None;
        Ok(())
    }

    pub fn unignore(&mut self, id: Uuid) -> Result<(), ImportError> {
        let entry = self.get_mut(id)?;
        if entry.status == EntityStatus::Ignored {
            entry.status = EntityStatus::Pending;
        }
        Ok(())
    }

    /// The gate for leaving entity resolution: every entry Resolved or
    /// Ignored. Pending and Creating both block.
    pub fn is_complete(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.status, EntityStatus::Resolved | EntityStatus::Ignored))
    }

    /// Entry for a raw label, honoring the nested-kind dedup key.
    pub fn find(
        &self,
        kind: EntityKind,
        label: &str,
        parent_label: Option<&str>,
    ) -> Option<&UnresolvedEntity> {
        let label_key = label.trim().to_lowercase();
        let parent_key = parent_label.map(|p| p.trim().to_lowercase());
        self.entries.iter().find(|e| {
            e.kind == kind
                && e.raw_label.trim().to_lowercase() == label_key
                && (e.kind.parent_kind().is_none()
                    || e.parent.as_ref().map(|p| p.raw_label.trim().to_lowercase()) == parent_key)
        })
    }

    /// Whether a row is excluded from creation: at least one of its
    /// references stayed Ignored. Rows with Pending or Creating references
    /// are not excluded here; they block at the completeness gate instead.
    pub fn row_excluded(&self, row: &PlanRowDraft, snapshot: &CatalogSnapshot) -> bool {
        row.labels.iter().any(|(kind, label)| {
            if snapshot.find_by_name(*kind, label).is_some() {
                return false;
            }
            let parent_label = kind.parent_kind().and_then(|pk| row.label(pk));
            matches!(
                self.find(*kind, label, parent_label).map(|e| e.status),
                Some(EntityStatus::Ignored)
            )
        })
    }

    /// Canonical id of an entry's parent: the context's id when the parent
    /// was already canonical, otherwise the resolution of the parent's own
    /// worklist entry.
    pub fn effective_parent_id(&self, id: Uuid, snapshot: &CatalogSnapshot) -> Option<String> {
        let entry = self.get(id)?;
        let parent = entry.parent.as_ref()?;
        if let Some(canonical) = &parent.canonical_id {
            return Some(canonical.clone());
        }
        if let Some(found) = snapshot.find_by_name(parent.kind, &parent.raw_label) {
            return Some(found.id.clone());
        }
        self.find(parent.kind, &parent.raw_label, None)
            .and_then(|p| p.resolved_canonical_id.clone())
    }
}
