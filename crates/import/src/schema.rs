use serde::Deserialize;

use crate::dates::{detect_format, parse_month_label};
use crate::error::ImportError;
use crate::model::{ColumnMapping, DateFormatId, FieldId, ImportKind, RawTable};

/// How many column values feed date-format detection.
const DETECTION_SAMPLES: usize = 5;

// ---------------------------------------------------------------------------
// Keyword-family config
// ---------------------------------------------------------------------------

/// One keyword family: headers containing any keyword map to `field`.
/// Families are checked in declaration order; the first match wins.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    pub field: FieldId,
    pub keywords: Vec<String>,
}

/// Header-keyword tables per import kind. TOML-loadable so deployments can
/// extend the vocabulary without a rebuild; the compiled-in default covers
/// the Portuguese and English headers seen in real plan sheets.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub plan: Vec<FieldRule>,
    pub metrics: Vec<FieldRule>,
}

impl SchemaConfig {
    pub fn from_toml(input: &str) -> Result<Self, ImportError> {
        let config: SchemaConfig =
            toml::from_str(input).map_err(|e| ImportError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        for (name, rules) in [("plan", &self.plan), ("metrics", &self.metrics)] {
            let mut seen = Vec::new();
            for rule in rules {
                if seen.contains(&rule.field) {
                    return Err(ImportError::ConfigValidation(format!(
                        "[{name}] field '{}' appears twice",
                        rule.field
                    )));
                }
                seen.push(rule.field);
                if rule.keywords.is_empty() {
                    return Err(ImportError::ConfigValidation(format!(
                        "[{name}] field '{}' has no keywords",
                        rule.field
                    )));
                }
                if rule.keywords.iter().any(|k| k.trim().is_empty()) {
                    return Err(ImportError::ConfigValidation(format!(
                        "[{name}] field '{}' has a blank keyword",
                        rule.field
                    )));
                }
            }
        }
        Ok(())
    }

    fn rules(&self, kind: ImportKind) -> &[FieldRule] {
        match kind {
            ImportKind::PlanLines => &self.plan,
            ImportKind::Metrics => &self.metrics,
        }
    }
}

fn rule(field: FieldId, keywords: &[&str]) -> FieldRule {
    FieldRule {
        field,
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            plan: vec![
                rule(FieldId::LineCode, &["codigo da linha", "cod linha", "codigo", "code"]),
                rule(FieldId::CampaignName, &["nome da campanha", "campanha", "campaign"]),
                rule(FieldId::Vehicle, &["veiculo", "vehicle"]),
                rule(FieldId::Channel, &["canal", "channel"]),
                rule(FieldId::Subdivision, &["subdivisao", "subdivision", "praca"]),
                rule(FieldId::Moment, &["momento", "moment"]),
                rule(FieldId::FunnelStage, &["etapa do funil", "funil", "funnel", "etapa"]),
                rule(FieldId::Target, &["publico-alvo", "publico", "audiencia", "target", "audience"]),
                rule(FieldId::StartDate, &["data de inicio", "data inicio", "inicio", "start"]),
                rule(FieldId::EndDate, &["data de termino", "data fim", "termino", "fim", "end"]),
                rule(
                    FieldId::Budget,
                    &["orcamento", "custo", "investimento", "verba", "budget", "cost", "spend"],
                ),
            ],
            metrics: vec![
                rule(FieldId::LineCode, &["codigo da linha", "cod linha", "codigo", "code"]),
                rule(FieldId::CampaignName, &["nome da campanha", "campanha", "campaign"]),
                rule(FieldId::Period, &["periodo", "period", "mes", "month", "data", "date"]),
                rule(FieldId::Impressions, &["impressoes", "impressions", "impr"]),
                rule(FieldId::Clicks, &["cliques", "clicks"]),
                rule(FieldId::Conversions, &["conversoes", "conversions"]),
                rule(
                    FieldId::Spend,
                    &["investimento", "custo", "valor investido", "spend", "cost"],
                ),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Header normalization
// ---------------------------------------------------------------------------

/// Lowercase, strip diacritics, trim. Applied to headers and keywords alike
/// so "Veículo" matches "veiculo".
pub fn normalize(text: &str) -> String {
    text.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_diacritic)
        .collect()
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        _ => c,
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Propose a mapping per header. Pure and deterministic: identical input
/// always yields identical output, which is what makes the wizard's caching
/// of this step safe.
pub fn infer_mappings(table: &RawTable, kind: ImportKind, config: &SchemaConfig) -> Vec<ColumnMapping> {
    let mut mappings = Vec::with_capacity(table.headers.len());
    let mut unique_taken: Vec<FieldId> = Vec::new();

    for (index, header) in table.headers.iter().enumerate() {
        let normalized = normalize(header);

        let mut target = config
            .rules(kind)
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| normalized.contains(&normalize(k)))
            })
            .map(|rule| rule.field);

        // A header that is itself a period label ("2025-01", "03/2025")
        // carries that period's budget on a plan sheet.
        if target.is_none()
            && kind == ImportKind::PlanLines
            && parse_month_label(header).is_some()
        {
            target = Some(FieldId::PeriodBudget);
        }

        // Duplicate headers may both match a unique field; only the first
        // column keeps it.
        if let Some(field) = target {
            if field.is_unique() {
                if unique_taken.contains(&field) {
                    target = None;
                } else {
                    unique_taken.push(field);
                }
            }
        }

        let date_format = target.filter(|f| f.is_date_valued()).map(|_| {
            detect_format(&table.column_samples(index, DETECTION_SAMPLES))
        });

        mappings.push(ColumnMapping {
            source_column: header.clone(),
            source_index: index,
            target,
            date_format,
        });
    }

    mappings
}

// ---------------------------------------------------------------------------
// Mapping set (inference + user overrides)
// ---------------------------------------------------------------------------

/// The mapping state the wizard holds for the Mapping step: the inferred
/// proposal plus any user overrides. Overrides are never clobbered by
/// automatic re-inference; only an explicit `redetect` starts over.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MappingSet {
    mappings: Vec<ColumnMapping>,
}

impl MappingSet {
    pub fn infer(table: &RawTable, kind: ImportKind, config: &SchemaConfig) -> Self {
        MappingSet {
            mappings: infer_mappings(table, kind, config),
        }
    }

    pub fn mappings(&self) -> &[ColumnMapping] {
        &self.mappings
    }

    /// Index of the column mapped to `field`, if any.
    pub fn column_for(&self, field: FieldId) -> Option<usize> {
        self.mappings
            .iter()
            .find(|m| m.target == Some(field))
            .map(|m| m.source_index)
    }

    /// All columns mapped to `field` (meaningful for `PeriodBudget`, which
    /// may legitimately cover several period columns).
    pub fn columns_for(&self, field: FieldId) -> Vec<usize> {
        self.mappings
            .iter()
            .filter(|m| m.target == Some(field))
            .map(|m| m.source_index)
            .collect()
    }

    /// Point a column at a target field (or ignore it with `None`).
    ///
    /// Assigning a unique field that another column already holds clears
    /// that column first, so the at-most-one invariant always holds.
    pub fn set_mapping(&mut self, column: usize, target: Option<FieldId>) -> Result<(), ImportError> {
        if column >= self.mappings.len() {
            return Err(ImportError::UnknownColumn(column));
        }

        if let Some(field) = target {
            if field.is_unique() {
                for m in &mut self.mappings {
                    if m.target == Some(field) && m.source_index != column {
                        m.target = None;
                        m.date_format = None;
                    }
                }
            }
        }

        let mapping = &mut self.mappings[column];
        mapping.target = target;
        mapping.date_format = match target {
            Some(f) if f.is_date_valued() => {
                Some(mapping.date_format.unwrap_or(DateFormatId::Auto))
            }
            _ => None,
        };
        Ok(())
    }

    pub fn set_date_format(&mut self, column: usize, format: DateFormatId) -> Result<(), ImportError> {
        let mapping = self
            .mappings
            .get_mut(column)
            .ok_or(ImportError::UnknownColumn(column))?;
        match mapping.target {
            Some(f) if f.is_date_valued() => {
                mapping.date_format = Some(format);
                Ok(())
            }
            _ => Err(ImportError::NotDateColumn(column)),
        }
    }

    /// Explicit "re-detect": discard every override and re-run inference.
    pub fn redetect(&mut self, table: &RawTable, kind: ImportKind, config: &SchemaConfig) {
        self.mappings = infer_mappings(table, kind, config);
    }

    /// Check the required-field gate for leaving the Mapping step.
    pub fn validate(&self, kind: ImportKind) -> Result<(), ImportError> {
        match kind {
            ImportKind::PlanLines => {
                for field in [FieldId::LineCode, FieldId::Budget] {
                    if self.column_for(field).is_none() {
                        return Err(ImportError::MissingRequiredMapping { field });
                    }
                }
            }
            ImportKind::Metrics => {
                if self.column_for(FieldId::Period).is_none() {
                    return Err(ImportError::MissingRequiredMapping { field: FieldId::Period });
                }
                if self.column_for(FieldId::LineCode).is_none()
                    && self.column_for(FieldId::CampaignName).is_none()
                {
                    return Err(ImportError::MissingRowIdentifier);
                }
            }
        }
        Ok(())
    }
}
