//! CLI bridge for the desktop shell.
//!
//! Each subcommand is one workflow; the shell passes a JSON payload file
//! where the workflow needs structured input and reads exactly one JSON
//! result object from stdout. All diagnostics go to stderr so stdout stays
//! machine-parseable.

use serde::Deserialize;
use sgsst_processor::analyzer::{CauseAnalyzer, DisabledAnalyzer, MistralClient};
use sgsst_processor::config::{default_config_path, Settings};
use sgsst_processor::dispatch::{ContactDirectory, EmailSender, WhatsAppSender};
use sgsst_processor::errors::{ProcessError, Result};
use sgsst_processor::mapping;
use sgsst_processor::pipeline::ReportPipeline;
use sgsst_processor::processor::PdfProcessor;
use sgsst_processor::types::{DocumentKind, ExtractedData, FiveWhysAnalysis};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: sgsst-processor [--config <config.json>] <command> ...
commands:
  extract <pdf>                        extract fields from one PDF
  process-remision <pdf> [empresa]     extract + generate remision + update control
  batch <pdf> [<pdf> ...]              process-remision over many PDFs
  generate-remision <payload.json>     generate from reviewed data {empresa, data}
  process-accident <pdf> [empresa] [contexto]
  generate-informe <payload.json>      {empresa, data, analysis}
  map-directory <path>                 map a folder tree to JSON
  send-email <payload.json>            {empresa, docPath, data}
  send-whatsapp <payload.json>         {empresa, docPath, data}
  init-config [path]                   write an example config file";

#[derive(Deserialize)]
struct RemisionPayload {
    empresa: Option<String>,
    data: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct InformePayload {
    empresa: Option<String>,
    data: BTreeMap<String, String>,
    analysis: Option<FiveWhysAnalysis>,
}

#[derive(Deserialize)]
struct DispatchPayload {
    empresa: Option<String>,
    #[serde(rename = "docPath")]
    doc_path: PathBuf,
    data: BTreeMap<String, String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(result) => {
            println!("{result}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let result = serde_json::json!({ "success": false, "error": e.to_string() });
            println!("{result}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<serde_json::Value> {
    let mut config_path: Option<PathBuf> = None;
    let mut rest: Vec<&str> = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config_path = Some(PathBuf::from(iter.next().ok_or_else(|| {
                ProcessError::config("--config requires a path")
            })?));
        } else {
            rest.push(arg.as_str());
        }
    }
    let Some((&command, params)) = rest.split_first() else {
        return Err(ProcessError::config(USAGE));
    };
    let config_path = config_path.as_deref();

    match command {
        "extract" => {
            let pdf = param(params, 0, "pdf path")?;
            // Extraction works without a config; settings only add the
            // debug text dump location.
            let processor = match Settings::load(config_path)
                .ok()
                .and_then(|s| s.debug_text_dir)
            {
                Some(dir) => PdfProcessor::with_debug_dir(dir),
                None => PdfProcessor::new(),
            };
            let data = processor.extract(Path::new(pdf))?;
            Ok(serde_json::json!({ "success": true, "data": data }))
        }
        "process-remision" => {
            let pdf = param(params, 0, "pdf path")?;
            let settings = Settings::load(config_path)?;
            let pipeline = ReportPipeline::new(&settings);
            let report = pipeline.process_remision(Path::new(pdf), params.get(1).copied())?;
            Ok(serde_json::json!({ "success": true, "report": report }))
        }
        "batch" => {
            if params.is_empty() {
                return Err(ProcessError::config("batch requires at least one pdf path"));
            }
            let settings = Settings::load(config_path)?;
            let pipeline = ReportPipeline::new(&settings);
            let paths: Vec<PathBuf> = params.iter().map(|p| PathBuf::from(*p)).collect();
            let result = pipeline.process_batch(&paths, None);
            Ok(serde_json::json!({
                "success": result.failed.is_empty(),
                "processed": result.processed,
                "failed": result.failed,
            }))
        }
        "generate-remision" => {
            let payload: RemisionPayload = read_payload(param(params, 0, "payload path")?)?;
            let settings = Settings::load(config_path)?;
            let pipeline = ReportPipeline::new(&settings);
            let data = extracted_from(payload.data, DocumentKind::MedicalEvaluation);
            let report = pipeline.generate_remision(data, payload.empresa.as_deref())?;
            Ok(serde_json::json!({
                "success": true,
                "documentPath": report.document_path,
                "controlPath": report.control_path,
                "controlError": report.control_error,
            }))
        }
        "process-accident" => {
            let pdf = param(params, 0, "pdf path")?;
            let empresa = params.get(1).copied().unwrap_or_default();
            let contexto = params.get(2).copied().unwrap_or_default();
            let settings = Settings::load(config_path)?;

            let processor = match &settings.debug_text_dir {
                Some(dir) => PdfProcessor::with_debug_dir(dir.clone()),
                None => PdfProcessor::new(),
            };
            let data = processor.extract(Path::new(pdf))?;
            let analyzer = make_analyzer(&settings);
            let analysis = analyzer.analyze(data.get("Descripcion_Accidente"), contexto);

            let (company, profile) = settings.company(empresa);
            Ok(serde_json::json!({
                "success": true,
                "data": data,
                "analysis": analysis,
                "metadata": {
                    "pdfPath": pdf,
                    "empresa": company,
                    "templatePath": profile.plantilla_investigacion.display().to_string(),
                    "outputDir": profile.investigaciones.display().to_string(),
                    "contextoAdicional": contexto,
                },
            }))
        }
        "generate-informe" => {
            let payload: InformePayload = read_payload(param(params, 0, "payload path")?)?;
            let settings = Settings::load(config_path)?;
            let pipeline = ReportPipeline::new(&settings);
            let data = extracted_from(payload.data, DocumentKind::AccidentReport);
            let analysis = payload.analysis.unwrap_or_else(FiveWhysAnalysis::fallback);
            let empresa = payload.empresa.unwrap_or_default();
            let report = pipeline.generate_informe(data, analysis, &empresa)?;
            Ok(serde_json::json!({ "success": true, "documentPath": report.document_path }))
        }
        "map-directory" => {
            let root = param(params, 0, "directory path")?;
            let map = mapping::map_directory(Path::new(root))?;
            serde_json::to_value(&map)
                .map_err(|e| ProcessError::config(format!("could not serialize map: {e}")))
        }
        "send-email" => {
            let payload: DispatchPayload = read_payload(param(params, 0, "payload path")?)?;
            let settings = Settings::load(config_path)?;
            let (company, profile) = settings.company(&payload.empresa.unwrap_or_default());

            let cedula = non_empty(&payload.data, "No_Identificacion")
                .ok_or_else(|| ProcessError::dispatch("no identity number in payload"))?;
            let nombre = non_empty(&payload.data, "Nombre_Completo").unwrap_or("Trabajador");
            let fecha = non_empty(&payload.data, "Fecha_Atencion").unwrap_or("");

            let personnel = profile.base_datos_personal.clone().ok_or_else(|| {
                ProcessError::dispatch(format!("no personnel workbook configured for {company}"))
            })?;
            let contact = ContactDirectory::new(personnel, None)
                .lookup(cedula)?
                .ok_or_else(|| ProcessError::dispatch("contact not found in personnel workbook"))?;
            let correo = contact
                .correo
                .ok_or_else(|| ProcessError::dispatch("no email address for contact"))?;

            let remitente = profile.correo_remitente.clone().ok_or_else(|| {
                ProcessError::dispatch(format!("no sender account configured for {company}"))
            })?;
            let password = Settings::smtp_password(company).ok_or_else(|| {
                ProcessError::dispatch("SMTP password not configured in the environment")
            })?;

            EmailSender::new(company, remitente, password)
                .send(&correo, nombre, fecha, &payload.doc_path)?;
            Ok(serde_json::json!({ "success": true, "sentTo": correo }))
        }
        "send-whatsapp" => {
            let payload: DispatchPayload = read_payload(param(params, 0, "payload path")?)?;
            let settings = Settings::load(config_path)?;
            let (company, profile) = settings.company(&payload.empresa.unwrap_or_default());

            let cedula = non_empty(&payload.data, "No_Identificacion")
                .ok_or_else(|| ProcessError::dispatch("no identity number in payload"))?;
            let nombre = non_empty(&payload.data, "Nombre_Completo").unwrap_or("Trabajador");
            let fecha = non_empty(&payload.data, "Fecha_Atencion").unwrap_or("N/A");

            let personnel = profile.base_datos_personal.clone().ok_or_else(|| {
                ProcessError::dispatch(format!("no personnel workbook configured for {company}"))
            })?;
            let contact = ContactDirectory::new(personnel, None)
                .lookup(cedula)?
                .ok_or_else(|| ProcessError::dispatch("contact not found in personnel workbook"))?;
            let telefono = contact
                .telefono
                .ok_or_else(|| ProcessError::dispatch("no phone number for contact"))?;

            let mensaje = format!(
                "Hola {nombre}, te compartimos la carta de remisiones médicas del examen \
                 ocupacional del {fecha}. Por favor confirma la recepción del documento. \
                 Equipo {company}"
            );
            let url = WhatsAppSender::prepare(&telefono, &mensaje, Some(&payload.doc_path))?;
            Ok(serde_json::json!({
                "success": true,
                "phoneNumber": telefono,
                "documentPath": payload.doc_path.display().to_string(),
                "url": url,
            }))
        }
        "init-config" => {
            let path = match params.first() {
                Some(p) => PathBuf::from(p),
                None => default_config_path().ok_or_else(|| {
                    ProcessError::config("could not determine the user config directory")
                })?,
            };
            Settings::write_example(&path)?;
            Ok(serde_json::json!({ "success": true, "configPath": path.display().to_string() }))
        }
        _ => Err(ProcessError::config(format!(
            "unknown command '{command}'\n{USAGE}"
        ))),
    }
}

fn param<'a>(params: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    params
        .get(index)
        .copied()
        .ok_or_else(|| ProcessError::config(format!("missing argument: {name}\n{USAGE}")))
}

fn read_payload<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(ProcessError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| ProcessError::config(format!("invalid payload file: {e}")))
}

fn extracted_from(fields: BTreeMap<String, String>, kind: DocumentKind) -> ExtractedData {
    ExtractedData {
        kind,
        fields,
        source_file: None,
        processed_at: None,
    }
}

fn non_empty<'a>(data: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    data.get(key)
        .map(String::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn make_analyzer(settings: &Settings) -> Box<dyn CauseAnalyzer> {
    match settings.analyzer_endpoint() {
        Some(endpoint) => Box::new(MistralClient::new(endpoint)),
        None => Box::new(DisabledAnalyzer),
    }
}
