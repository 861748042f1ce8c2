use std::collections::BTreeMap;

use serde::Serialize;

use crate::catalog::LineRef;
use crate::model::MetricRowDraft;

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    SecondaryKey,
    Similarity,
    Manual,
    None,
}

/// Binding of one imported metrics row to a canonical line.
///
/// `matched_line_id` is `None` exactly when `match_kind` is `None`, exactly
/// when `confidence` is 0. Many rows may bind to the same line (one row per
/// reporting period is the normal case).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub row_index: usize,
    /// The row value the match was attempted on (line code when present,
    /// otherwise the campaign name).
    pub raw_key: String,
    pub matched_line_id: Option<String>,
    pub match_kind: MatchKind,
    /// 0..=100, display/triage only.
    pub confidence: u8,
}

impl MatchResult {
    fn none(row_index: usize, raw_key: String) -> Self {
        MatchResult {
            row_index,
            raw_key,
            matched_line_id: None,
            match_kind: MatchKind::None,
            confidence: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Cascade
// ---------------------------------------------------------------------------

/// Match each metrics row against the canonical lines, one result per row in
/// input order.
///
/// Strategy cascade, first hit wins:
/// 1. line code equals a line's code, case-sensitive (confidence 100)
/// 2. campaign name equals a line's secondary key (confidence 90)
/// 3. case-insensitive substring containment either direction between the
///    campaign name and a line's display name (confidence 70); the first
///    line in iteration order wins the tie
/// 4. no match (confidence 0)
///
/// Deterministic for fixed inputs; the only ordering dependency is the
/// documented canonical-line iteration order in tier 3.
pub fn match_rows(rows: &[MetricRowDraft], lines: &[LineRef]) -> Vec<MatchResult> {
    rows.iter().map(|row| match_row(row, lines)).collect()
}

fn match_row(row: &MetricRowDraft, lines: &[LineRef]) -> MatchResult {
    let raw_key = row
        .code
        .clone()
        .or_else(|| row.campaign.clone())
        .unwrap_or_default();

    if let Some(code) = &row.code {
        if let Some(line) = lines.iter().find(|l| &l.code == code) {
            return MatchResult {
                row_index: row.row_index,
                raw_key,
                matched_line_id: Some(line.id.clone()),
                match_kind: MatchKind::Exact,
                confidence: 100,
            };
        }
    }

    if let Some(campaign) = &row.campaign {
        if let Some(line) = lines
            .iter()
            .find(|l| l.secondary_key.as_deref() == Some(campaign.as_str()))
        {
            return MatchResult {
                row_index: row.row_index,
                raw_key,
                matched_line_id: Some(line.id.clone()),
                match_kind: MatchKind::SecondaryKey,
                confidence: 90,
            };
        }

        let needle = campaign.to_lowercase();
        if let Some(line) = lines.iter().find(|l| {
            let name = l.display_name.to_lowercase();
            name.contains(&needle) || needle.contains(&name)
        }) {
            return MatchResult {
                row_index: row.row_index,
                raw_key,
                matched_line_id: Some(line.id.clone()),
                match_kind: MatchKind::Similarity,
                confidence: 70,
            };
        }
    }

    MatchResult::none(row.row_index, raw_key)
}

/// Overlay user picks onto cascade output. A manual pick replaces whatever
/// the cascade produced for that row and survives cascade re-runs.
pub fn apply_overrides(
    mut results: Vec<MatchResult>,
    overrides: &BTreeMap<usize, String>,
) -> Vec<MatchResult> {
    for result in &mut results {
        if let Some(line_id) = overrides.get(&result.row_index) {
            result.matched_line_id = Some(line_id.clone());
            result.match_kind = MatchKind::Manual;
            result.confidence = 100;
        }
    }
    results
}
