use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ImportError;
use crate::model::EntityKind;

/// Label of the sentinel node collecting lines without a value for the
/// grouping dimension. Those lines are grouped, never dropped.
pub const UNASSIGNED_LABEL: &str = "(não atribuído)";

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// Budget-breakdown axes a plan may be sliced by, in user-chosen order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Subdivision,
    Moment,
    FunnelStage,
}

impl DimensionKind {
    pub fn entity_kind(self) -> EntityKind {
        match self {
            Self::Subdivision => EntityKind::Subdivision,
            Self::Moment => EntityKind::Moment,
            Self::FunnelStage => EntityKind::FunnelStage,
        }
    }
}

impl std::fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subdivision => write!(f, "subdivision"),
            Self::Moment => write!(f, "moment"),
            Self::FunnelStage => write!(f, "funnel_stage"),
        }
    }
}

/// A line as the allocator sees it: a budget plus its dimension assignments.
#[derive(Debug, Clone, Serialize)]
pub struct AllocLine {
    pub budget: f64,
    pub subdivision: Option<String>,
    pub moment: Option<String>,
    pub funnel_stage: Option<String>,
}

impl AllocLine {
    fn dimension(&self, kind: DimensionKind) -> Option<&str> {
        match kind {
            DimensionKind::Subdivision => self.subdivision.as_deref(),
            DimensionKind::Moment => self.moment.as_deref(),
            DimensionKind::FunnelStage => self.funnel_stage.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// One node of the allocation tree: one dimension value at one level.
///
/// `planned` starts as the sum of the node's line budgets and is the value
/// the user may edit afterwards; `allocated` always remains the exact sum of
/// the line budgets under the node. A gap between the two is the signal
/// surfaced to the user, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyNode {
    pub dimension: DimensionKind,
    pub distribution_id: Uuid,
    pub label: String,
    pub planned: f64,
    pub allocated: f64,
    pub percentage_of_parent: f64,
    /// `allocated` exceeds the parent's `planned` (the total budget, for
    /// roots). A warning; never blocks building or committing.
    pub over_allocated: bool,
    pub children: Vec<HierarchyNode>,
    /// Indexes into the input line slice; populated on leaves only.
    pub line_indexes: Vec<usize>,
}

/// Build the allocation tree for a dimension order of length 0 to 3.
///
/// Groups keep first-appearance order. An empty order means "no breakdown"
/// and yields an empty tree. The allocator is a pure projection: input lines
/// are never mutated, and rebuilding from updated lines is the only way a
/// source-budget change reaches the tree.
pub fn build_tree(
    lines: &[AllocLine],
    dimension_order: &[DimensionKind],
    total_budget: f64,
) -> Result<Vec<HierarchyNode>, ImportError> {
    for (i, dim) in dimension_order.iter().enumerate() {
        if dimension_order[..i].contains(dim) {
            return Err(ImportError::InvalidDimensionOrder(format!(
                "dimension '{dim}' appears twice"
            )));
        }
    }
    if dimension_order.is_empty() {
        return Ok(Vec::new());
    }

    let all_indexes: Vec<usize> = (0..lines.len()).collect();
    let mut tree = build_level(lines, &all_indexes, dimension_order, 0);
    refresh(&mut tree, total_budget);
    Ok(tree)
}

fn build_level(
    lines: &[AllocLine],
    indexes: &[usize],
    order: &[DimensionKind],
    depth: usize,
) -> Vec<HierarchyNode> {
    let dimension = order[depth];

    // Group by dimension value, first appearance first, sentinel for blanks.
    let mut groups: Vec<(String, String, Vec<usize>)> = Vec::new();
    for &index in indexes {
        let label = lines[index]
            .dimension(dimension)
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .unwrap_or(UNASSIGNED_LABEL);
        let key = label.to_lowercase();
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, members)) => members.push(index),
            None => groups.push((key, label.to_string(), vec![index])),
        }
    }

    groups
        .into_iter()
        .map(|(_, label, members)| {
            let planned: f64 = members.iter().map(|&i| lines[i].budget).sum();
            let is_leaf = depth + 1 >= order.len();
            let children = if is_leaf {
                Vec::new()
            } else {
                build_level(lines, &members, order, depth + 1)
            };
            let allocated = if is_leaf {
                planned
            } else {
                children.iter().map(|c| c.allocated).sum()
            };
            HierarchyNode {
                dimension,
                distribution_id: Uuid::new_v4(),
                label,
                planned,
                allocated,
                percentage_of_parent: 0.0,
                over_allocated: false,
                children,
                line_indexes: if is_leaf { members } else { Vec::new() },
            }
        })
        .collect()
}

/// Recompute percentages and over-allocation flags against the parent
/// planned amounts (the total budget for roots).
pub fn refresh(tree: &mut [HierarchyNode], total_budget: f64) {
    refresh_level(tree, total_budget);
}

fn refresh_level(nodes: &mut [HierarchyNode], parent_planned: f64) {
    for node in nodes {
        node.percentage_of_parent = if parent_planned > 0.0 {
            node.planned / parent_planned
        } else {
            0.0
        };
        node.over_allocated = node.allocated > parent_planned;
        refresh_level(&mut node.children, node.planned);
    }
}

/// Edit one node's planned amount and refresh the derived fields. Does not
/// propagate to ancestors and never touches the input lines. Returns false
/// for an unknown id or a negative value.
pub fn set_planned(
    tree: &mut [HierarchyNode],
    distribution_id: Uuid,
    value: f64,
    total_budget: f64,
) -> bool {
    if value < 0.0 {
        return false;
    }
    if !assign_planned(tree, distribution_id, value) {
        return false;
    }
    refresh(tree, total_budget);
    true
}

fn assign_planned(nodes: &mut [HierarchyNode], id: Uuid, value: f64) -> bool {
    for node in nodes {
        if node.distribution_id == id {
            node.planned = value;
            return true;
        }
        if assign_planned(&mut node.children, id, value) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Flattening for tabular display
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatCell {
    pub dimension: DimensionKind,
    pub distribution_id: Uuid,
    pub label: String,
    pub planned: f64,
    pub allocated: f64,
    pub percentage_of_parent: f64,
    pub over_allocated: bool,
}

/// One display row per leaf, carrying a cell per level. Consecutive rows
/// sharing a `distribution_id` at a level form that level's rowspan group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatRow {
    pub cells: Vec<FlatCell>,
}

/// Flatten depth-first, preserving parent→child order, so that re-grouping
/// consecutive rows by `distribution_id` per level reconstructs the tree
/// exactly.
pub fn flatten(tree: &[HierarchyNode]) -> Vec<FlatRow> {
    let mut rows = Vec::new();
    let mut path = Vec::new();
    flatten_into(tree, &mut path, &mut rows);
    rows
}

fn flatten_into(nodes: &[HierarchyNode], path: &mut Vec<FlatCell>, rows: &mut Vec<FlatRow>) {
    for node in nodes {
        path.push(FlatCell {
            dimension: node.dimension,
            distribution_id: node.distribution_id,
            label: node.label.clone(),
            planned: node.planned,
            allocated: node.allocated,
            percentage_of_parent: node.percentage_of_parent,
            over_allocated: node.over_allocated,
        });
        if node.children.is_empty() {
            rows.push(FlatRow { cells: path.clone() });
        } else {
            flatten_into(&node.children, path, rows);
        }
        path.pop();
    }
}
