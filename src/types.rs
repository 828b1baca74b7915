use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source-document layout variant. Detection is keyword sniffing over the
/// extracted text; each variant selects its own extraction rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// EPS occupational-health evaluation certificate (remisión source).
    MedicalEvaluation,
    /// FURAT workplace accident report.
    AccidentReport,
}

/// Flat field map produced by extraction. Every canonical field declared in
/// the rule table for `kind` is present; unmatched fields hold their
/// sentinel ("N/A" or "NINGUNO"). Never mutated after extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedData {
    pub kind: DocumentKind,
    pub fields: BTreeMap<String, String>,
    /// Original PDF path (set by the processor).
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub processed_at: Option<String>,
}

impl ExtractedData {
    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or("")
    }

    /// A field counts as filled when it is non-empty and not a sentinel.
    pub fn has_value(&self, field: &str) -> bool {
        let v = self.get(field);
        !v.is_empty() && v != crate::rules::SENTINEL_NOT_FOUND && v != crate::rules::SENTINEL_NONE
    }
}

/// One level of the "5 Porqués" analysis: the cause plus the 5M categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhyLevel {
    pub causa: String,
    pub mano_de_obra: String,
    pub metodo: String,
    pub maquinaria: String,
    pub medio_ambiente: String,
    pub material: String,
}

impl WhyLevel {
    pub fn unavailable(causa: &str) -> Self {
        Self {
            causa: causa.to_string(),
            mano_de_obra: "N/A".to_string(),
            metodo: "N/A".to_string(),
            maquinaria: "N/A".to_string(),
            medio_ambiente: "N/A".to_string(),
            material: "N/A".to_string(),
        }
    }
}

/// Fixed-shape root-cause analysis: always exactly five levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiveWhysAnalysis {
    pub levels: Vec<WhyLevel>,
}

impl FiveWhysAnalysis {
    pub fn fallback() -> Self {
        Self {
            levels: (0..5)
                .map(|_| WhyLevel::unavailable("Análisis no disponible"))
                .collect(),
        }
    }
}

/// Outcome of one control-sheet upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertAction {
    Updated,
    Appended,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub item: u32,
    /// 1-based row in the workbook.
    pub row: u32,
}

/// Result of one remisión pipeline run. Document generation and the control
/// update are independent failure domains: a control error is carried
/// alongside the generated path instead of discarding it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemisionReport {
    pub data: ExtractedData,
    pub document_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccidentReport {
    pub data: ExtractedData,
    pub analysis: FiveWhysAnalysis,
    pub document_path: String,
}

/// One failed source in a batch run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDocument {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub processed: Vec<RemisionReport>,
    pub failed: Vec<FailedDocument>,
}
