//! End-to-end field extraction for one PDF: text extraction, layout-variant
//! detection, rule application, post-processing and lenient validation.

use crate::errors::Result;
use crate::pdf_text;
use crate::rules::RuleSet;
use crate::types::{DocumentKind, ExtractedData};
use chrono::Local;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Critical fields per variant: a sentinel left here after extraction is
/// reported, but the pipeline continues — partial data beats no data for a
/// human reviewing the output afterwards.
const MEDICAL_CRITICAL: &[&str] = &["No_Identificacion", "Nombre_Completo", "Fecha_Atencion"];
const ACCIDENT_CRITICAL: &[&str] = &["No_Identificacion", "Nombre_Completo", "Fecha_Accidente"];

pub struct PdfProcessor {
    /// When set, the raw extracted text of every document is dumped here.
    pub debug_text_dir: Option<PathBuf>,
}

impl PdfProcessor {
    pub fn new() -> Self {
        Self {
            debug_text_dir: None,
        }
    }

    pub fn with_debug_dir(dir: PathBuf) -> Self {
        Self {
            debug_text_dir: Some(dir),
        }
    }

    /// Pick the rule-table variant by sniffing for layout-specific header
    /// phrases. The FURAT form carries section headers the EPS certificates
    /// never do; anything else is treated as a medical evaluation, the most
    /// robust table.
    pub fn detect_kind(text: &str) -> DocumentKind {
        let upper = text.to_uppercase();
        let accident_markers = [
            "FURAT",
            "DESCRIPCIÓN DEL ACCIDENTE",
            "DESCRIPCION DEL ACCIDENTE",
            "FECHA Y HORA DEL ACCIDENTE",
        ];
        if accident_markers.iter().any(|m| upper.contains(m)) {
            DocumentKind::AccidentReport
        } else {
            DocumentKind::MedicalEvaluation
        }
    }

    /// Extract the complete field map for one document.
    ///
    /// Fails only when the file is missing or the PDF cannot be decoded;
    /// missing fields come back as sentinels, never as errors.
    pub fn extract(&self, pdf_path: &Path) -> Result<ExtractedData> {
        let text = pdf_text::extract_text(pdf_path)?;
        if let Some(dir) = &self.debug_text_dir {
            pdf_text::dump_debug_text(pdf_path, &text, dir);
        }

        let kind = Self::detect_kind(&text);
        info!(path = %pdf_path.display(), ?kind, "extracting fields");

        let rules = RuleSet::for_kind(kind);
        let mut fields = rules.apply(&text);
        post_process(&mut fields);
        validate_critical(kind, &fields, pdf_path);

        Ok(ExtractedData {
            kind,
            fields,
            source_file: Some(pdf_path.display().to_string()),
            processed_at: Some(Local::now().format("%Y-%m-%d %H:%M:%S").to_string()),
        })
    }
}

impl Default for PdfProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Field-specific cleanup for label bleed-over the patterns cannot express,
/// e.g. a name capture that swallowed the following "SEXO:" label.
fn post_process(fields: &mut BTreeMap<String, String>) {
    if let Some(nombre) = fields.get_mut("Nombre_Completo") {
        if let Some(pos) = nombre.find("SEXO:") {
            *nombre = nombre[..pos].trim().to_string();
        }
    }
}

fn validate_critical(kind: DocumentKind, fields: &BTreeMap<String, String>, pdf_path: &Path) {
    let critical = match kind {
        DocumentKind::MedicalEvaluation => MEDICAL_CRITICAL,
        DocumentKind::AccidentReport => ACCIDENT_CRITICAL,
    };
    let rules = RuleSet::for_kind(kind);
    for field in critical {
        let sentinel = rules.sentinel_for(field).unwrap_or("");
        match fields.get(*field) {
            Some(v) if v != sentinel && !v.is_empty() => {}
            _ => warn!(
                file = %pdf_path.display(),
                field,
                "critical field not found, continuing with sentinel"
            ),
        }
    }
}
