//! Per-document composition: extract → analyze → render → upsert.
//!
//! Steps inside one run are strictly sequential, each consuming the
//! previous step's output. Document generation and the control-sheet update
//! are independent failure domains: a failed upsert never discards the
//! generated document, it is reported next to it so a human can reconcile
//! the sheet. One bad document never aborts a batch.

use crate::analyzer::CauseAnalyzer;
use crate::config::Settings;
use crate::docgen::{self, DocumentGenerator};
use crate::errors::Result;
use crate::excel::ControlSheetStore;
use crate::processor::PdfProcessor;
use crate::types::{
    AccidentReport, BatchResult, ExtractedData, FailedDocument, FiveWhysAnalysis, RemisionReport,
};
use chrono::Local;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tracing::{error, info};

pub struct ReportPipeline<'a> {
    settings: &'a Settings,
    processor: PdfProcessor,
    generator: DocumentGenerator,
}

impl<'a> ReportPipeline<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        let processor = match &settings.debug_text_dir {
            Some(dir) => PdfProcessor::with_debug_dir(dir.clone()),
            None => PdfProcessor::new(),
        };
        Self {
            settings,
            processor,
            generator: DocumentGenerator::new(),
        }
    }

    /// Full remision flow for one source PDF.
    pub fn process_remision(
        &self,
        pdf_path: &Path,
        company_hint: Option<&str>,
    ) -> Result<RemisionReport> {
        let data = self.processor.extract(pdf_path)?;
        self.generate_remision(data, company_hint)
    }

    /// Remision document + control update from already-extracted data (the
    /// shell re-enters here after the user reviews the extracted fields).
    pub fn generate_remision(
        &self,
        data: ExtractedData,
        company_hint: Option<&str>,
    ) -> Result<RemisionReport> {
        let (company, profile) = match company_hint {
            Some(name) => self.settings.company(name),
            None => self.settings.resolve_company(data.get("Afiliacion")),
        };
        info!(company, "generating remision");

        let context = remision_context(&data);
        let document_path = self.generator.render(
            &context,
            &profile.plantilla_remision,
            &profile.remisiones,
            &profile.prefijo_remision,
        )?;

        let store = ControlSheetStore::new(&profile.control);
        let (control_path, control_error) = match store.upsert(&data.fields) {
            Ok(outcome) => {
                info!(item = outcome.item, row = outcome.row, "control file updated");
                (Some(profile.control.display().to_string()), None)
            }
            Err(e) => {
                error!(
                    file = %document_path.display(),
                    error = %e,
                    "control update failed, generated document kept"
                );
                (None, Some(e.to_string()))
            }
        };

        Ok(RemisionReport {
            data,
            document_path: document_path.display().to_string(),
            control_path,
            control_error,
        })
    }

    /// Full accident-investigation flow for one FURAT PDF.
    pub fn process_accident(
        &self,
        pdf_path: &Path,
        company: &str,
        contexto_adicional: &str,
        analyzer: &dyn CauseAnalyzer,
    ) -> Result<AccidentReport> {
        let data = self.processor.extract(pdf_path)?;
        let analysis = analyzer.analyze(data.get("Descripcion_Accidente"), contexto_adicional);
        self.generate_informe(data, analysis, company)
    }

    /// Investigation report from extracted data plus a finished analysis.
    pub fn generate_informe(
        &self,
        data: ExtractedData,
        analysis: FiveWhysAnalysis,
        company: &str,
    ) -> Result<AccidentReport> {
        let (company, profile) = self.settings.company(company);
        info!(company, "generating investigation report");

        let mut context = docgen::flatten_fields(&data.fields);
        docgen::flatten_analysis(&analysis, &mut context);
        let document_path = self.generator.render(
            &context,
            &profile.plantilla_investigacion,
            &profile.investigaciones,
            &profile.prefijo_investigacion,
        )?;

        Ok(AccidentReport {
            data,
            analysis,
            document_path: document_path.display().to_string(),
        })
    }

    /// Remision flow over many PDFs. Failures are collected per document
    /// with the offending filename; the batch always runs to the end.
    pub fn process_batch(&self, pdf_paths: &[PathBuf], company_hint: Option<&str>) -> BatchResult {
        let mut result = BatchResult {
            processed: Vec::new(),
            failed: Vec::new(),
        };
        for path in pdf_paths {
            match self.process_remision(path, company_hint) {
                Ok(report) => result.processed.push(report),
                Err(e) => {
                    error!(file = %path.display(), error = %e, "document failed, continuing batch");
                    result.failed.push(FailedDocument {
                        file: path.display().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }
}

/// Render context for the GI-OD-007 template: the flattened field map plus
/// the lowercase aliases the template's merge fields use.
fn remision_context(data: &ExtractedData) -> BTreeMap<String, String> {
    let mut context = docgen::flatten_fields(&data.fields);
    context.insert(
        "fecha".to_string(),
        Local::now().format("%d/%m/%Y").to_string(),
    );
    context.insert(
        "nombre_destinatario".to_string(),
        data.get("Nombre_Completo").to_string(),
    );
    context.insert("cc".to_string(), data.get("No_Identificacion").to_string());
    context.insert("cargo".to_string(), data.get("Cargo").to_string());
    context.insert(
        "evaluacion_ocupacional".to_string(),
        data.get("Evaluacion_Ocupacional").to_string(),
    );
    context.insert(
        "recomendaciones_laborales".to_string(),
        data.get("Recomendaciones_Laborales").to_string(),
    );
    context
}

/// Fire a worker thread and marshal the result back over a channel. One
/// pipeline invocation runs at a time per session; this only keeps the
/// shell's UI thread off the blocking file and analyzer I/O.
pub fn run_on_worker<T, F>(task: F) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(task());
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompanyProfile, Settings};
    use crate::docgen::test_support::write_template;
    use crate::types::DocumentKind;
    use std::collections::BTreeMap as Map;

    fn test_settings(dir: &Path) -> Settings {
        let template = dir.join("plantilla.docx");
        write_template(
            &template,
            &["Señor(a) {{nombre_destinatario}} CC {{cc}}", "{{recomendaciones_laborales}}"],
        );
        let informe = dir.join("informe.docx");
        write_template(&informe, &["{{Nombre_Completo}}", "1. {{por_que_1_causa}}"]);

        let profile = CompanyProfile {
            base: dir.to_path_buf(),
            plantilla_remision: template,
            remisiones: dir.join("remisiones"),
            control: dir.join("control.xlsx"),
            plantilla_investigacion: informe,
            investigaciones: dir.join("investigaciones"),
            base_datos_personal: None,
            correo_remitente: None,
            prefijo_remision: "GI-OD-007_REMISION_EPS".to_string(),
            prefijo_investigacion: "GI-FO-020_INVESTIGACION".to_string(),
        };
        let mut companies = std::collections::BTreeMap::new();
        companies.insert("TEMPOACTIVA".to_string(), profile);
        Settings {
            companies,
            default_company: "TEMPOACTIVA".to_string(),
            analyzer_endpoint: None,
            debug_text_dir: None,
        }
    }

    fn medical_data() -> ExtractedData {
        let mut fields: Map<String, String> = Map::new();
        for (k, v) in [
            ("No_Identificacion", "12345678"),
            ("Nombre_Completo", "ANA GOMEZ"),
            ("Fecha_Atencion", "15/08/2025"),
            ("Cargo", "OPERARIA"),
            ("Evaluacion_Ocupacional", "INGRESO"),
            ("Recomendaciones_Laborales", "PAUSAS ACTIVAS"),
            ("Afiliacion", "TEMPOACTIVA EST SAS"),
        ] {
            fields.insert(k.to_string(), v.to_string());
        }
        ExtractedData {
            kind: DocumentKind::MedicalEvaluation,
            fields,
            source_file: None,
            processed_at: None,
        }
    }

    #[test]
    fn remision_renders_document_and_updates_control() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let pipeline = ReportPipeline::new(&settings);

        let report = pipeline.generate_remision(medical_data(), None).unwrap();
        assert!(Path::new(&report.document_path).exists());
        assert!(report.control_error.is_none());
        assert!(report.control_path.is_some());

        let text = docgen::extract_document_text(Path::new(&report.document_path)).unwrap();
        assert!(text.contains("ANA GOMEZ"));
        assert!(text.contains("12345678"));
        assert!(text.contains("PAUSAS ACTIVAS"));
    }

    #[test]
    fn control_failure_keeps_generated_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        // A file where the control's parent directory should be makes the
        // workbook creation fail.
        let blocker = dir.path().join("bloqueo");
        std::fs::write(&blocker, b"archivo").unwrap();
        settings
            .companies
            .get_mut("TEMPOACTIVA")
            .unwrap()
            .control = blocker.join("control.xlsx");

        let pipeline = ReportPipeline::new(&settings);
        let report = pipeline.generate_remision(medical_data(), None).unwrap();
        assert!(Path::new(&report.document_path).exists());
        assert!(report.control_error.is_some());
        assert!(report.control_path.is_none());
    }

    #[test]
    fn informe_renders_flattened_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let pipeline = ReportPipeline::new(&settings);

        let mut data = medical_data();
        data.kind = DocumentKind::AccidentReport;
        let report = pipeline
            .generate_informe(data, FiveWhysAnalysis::fallback(), "TEMPOACTIVA")
            .unwrap();
        let text = docgen::extract_document_text(Path::new(&report.document_path)).unwrap();
        assert!(text.contains("Análisis no disponible"));
    }

    #[test]
    fn batch_collects_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let pipeline = ReportPipeline::new(&settings);

        let paths = vec![
            dir.path().join("no_existe_1.pdf"),
            dir.path().join("no_existe_2.pdf"),
        ];
        let result = pipeline.process_batch(&paths, None);
        assert!(result.processed.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert!(result.failed[0].file.contains("no_existe_1.pdf"));
        assert!(!result.failed[0].error.is_empty());
    }

    #[test]
    fn worker_thread_marshals_result_back() {
        let rx = run_on_worker(|| 41 + 1);
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
