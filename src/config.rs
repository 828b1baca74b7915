//! Per-company configuration.
//!
//! The original deployment hardcoded one folder tree per company; here the
//! company → named-path mapping is a JSON file loaded at startup and passed
//! explicitly into the pipeline. Secrets (SMTP password, analyzer endpoint)
//! come from the environment or a `.env` file, never from the config file
//! itself.

use crate::errors::{ProcessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyProfile {
    /// Root of the company's SG-SST folder tree.
    pub base: PathBuf,
    /// GI-OD-007 remision template.
    pub plantilla_remision: PathBuf,
    /// Output folder for generated remisiones.
    pub remisiones: PathBuf,
    /// GI-FO-012 control workbook.
    pub control: PathBuf,
    /// GI-FO-020 accident-investigation template.
    pub plantilla_investigacion: PathBuf,
    /// Output folder for generated investigation reports.
    pub investigaciones: PathBuf,
    /// Personnel workbook used for contact lookup.
    #[serde(default)]
    pub base_datos_personal: Option<PathBuf>,
    /// Sender account for dispatch.
    #[serde(default)]
    pub correo_remitente: Option<String>,
    #[serde(default = "default_remision_prefix")]
    pub prefijo_remision: String,
    #[serde(default = "default_investigacion_prefix")]
    pub prefijo_investigacion: String,
}

fn default_remision_prefix() -> String {
    "GI-OD-007_REMISION_EPS".to_string()
}

fn default_investigacion_prefix() -> String {
    "GI-FO-020_INVESTIGACION".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub companies: BTreeMap<String, CompanyProfile>,
    pub default_company: String,
    /// Local completion endpoint for the 5-whys analyzer.
    #[serde(default)]
    pub analyzer_endpoint: Option<String>,
    /// When set, raw extracted PDF text is dumped here for troubleshooting.
    #[serde(default)]
    pub debug_text_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings from `path`, or from the default per-user location.
    /// Also loads `.env` so secrets are available to the dispatch layer.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path().ok_or_else(|| {
                ProcessError::config("could not determine the user config directory")
            })?,
        };
        if !path.exists() {
            return Err(ProcessError::config(format!(
                "config file not found: {} (run `sgsst-processor init-config` to create one)",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| ProcessError::config(format!("invalid config file: {e}")))?;
        if settings.companies.is_empty() {
            return Err(ProcessError::config("config declares no companies"));
        }
        if !settings.companies.contains_key(&settings.default_company) {
            return Err(ProcessError::config(format!(
                "default company '{}' is not declared",
                settings.default_company
            )));
        }
        info!(path = %path.display(), companies = settings.companies.len(), "settings loaded");
        Ok(settings)
    }

    /// Resolve a company from a free-text affiliation: the extracted
    /// "Afiliación" value usually embeds the company name somewhere inside.
    /// Unknown affiliations fall back to the default company with a warning.
    pub fn resolve_company(&self, afiliacion: &str) -> (&str, &CompanyProfile) {
        let upper = afiliacion.trim().to_uppercase();
        for (name, profile) in &self.companies {
            if !upper.is_empty() && upper.contains(&name.to_uppercase()) {
                return (name.as_str(), profile);
            }
        }
        warn!(
            afiliacion,
            default = %self.default_company,
            "no company matched affiliation, using default"
        );
        self.default()
    }

    /// Company by exact (case-insensitive) name, defaulting like the
    /// affiliation lookup.
    pub fn company(&self, name: &str) -> (&str, &CompanyProfile) {
        for (key, profile) in &self.companies {
            if key.eq_ignore_ascii_case(name.trim()) {
                return (key.as_str(), profile);
            }
        }
        warn!(name, default = %self.default_company, "unknown company, using default");
        self.default()
    }

    fn default(&self) -> (&str, &CompanyProfile) {
        let profile = self
            .companies
            .get(&self.default_company)
            .expect("validated at load");
        (self.default_company.as_str(), profile)
    }

    /// Analyzer endpoint: environment wins over the config file.
    pub fn analyzer_endpoint(&self) -> Option<String> {
        std::env::var("SGSST_ANALYZER_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.analyzer_endpoint.clone())
    }

    /// SMTP password for a company account, per-company variable first.
    pub fn smtp_password(company: &str) -> Option<String> {
        let company_key = company
            .to_uppercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>();
        std::env::var(format!("SGSST_SMTP_PASSWORD_{company_key}"))
            .ok()
            .or_else(|| std::env::var("SGSST_SMTP_PASSWORD").ok())
            .filter(|s| !s.trim().is_empty())
    }

    /// Commented starting point for a new deployment.
    pub fn example() -> Self {
        let base = PathBuf::from("G:/Mi unidad/SG-SST/TEMPOACTIVA");
        let salud = base.join("3. Gestión de la Salud");
        let remisiones = salud.join("3.1.6.1. Remisiones EPS");
        let investigaciones = salud.join("3.2.2 Investigación de Accidentes");
        let profile = CompanyProfile {
            plantilla_remision: remisiones.join("GI-OD-007 REMISION A EPS.docx"),
            control: remisiones.join("GI-FO-012 CONTROL DE REMISIONES.xlsx"),
            plantilla_investigacion: investigaciones.join("GI-FO-020 INVESTIGACION.docx"),
            remisiones,
            investigaciones,
            base_datos_personal: Some(base.join("Base de Datos Personal.xlsx")),
            correo_remitente: Some("tempoactivaestsas@gmail.com".to_string()),
            prefijo_remision: default_remision_prefix(),
            prefijo_investigacion: default_investigacion_prefix(),
            base,
        };
        let mut companies = BTreeMap::new();
        companies.insert("TEMPOACTIVA".to_string(), profile);
        Settings {
            companies,
            default_company: "TEMPOACTIVA".to_string(),
            analyzer_endpoint: Some("http://127.0.0.1:8080/completion".to_string()),
            debug_text_dir: None,
        }
    }

    pub fn write_example(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&Self::example())
            .map_err(|e| ProcessError::config(e.to_string()))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "example config written");
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sgsst-processor").join("config.json"))
}
