//! "5 Porqués" root-cause analysis.
//!
//! Text generation itself is an external collaborator (a locally served
//! Mistral-7B instance); this module owns the prompt, the parsing of the
//! structured response into the fixed five-level 5M shape, and the fallback
//! shape used whenever the collaborator is unavailable or answers in an
//! unexpected format. The pipeline never fails because of the analyzer.

use crate::types::{FiveWhysAnalysis, WhyLevel};
use regex::Regex;
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub trait CauseAnalyzer {
    fn analyze(&self, descripcion: &str, contexto_adicional: &str) -> FiveWhysAnalysis;
}

/// Analysis placeholder used when no inference endpoint is configured.
pub struct DisabledAnalyzer;

impl CauseAnalyzer for DisabledAnalyzer {
    fn analyze(&self, _descripcion: &str, _contexto: &str) -> FiveWhysAnalysis {
        warn!("cause analyzer disabled, using fallback analysis");
        FiveWhysAnalysis::fallback()
    }
}

const PROMPT_RULES: &str = "\
Tu rol es ser un analista experto en seguridad laboral. Tu única tarea es \
realizar un análisis '5 Porqués' para un accidente, siguiendo el formato 5M.
REGLA ABSOLUTA: Debes responder exclusivamente en español y seguir el formato \
del ejemplo al pie de la letra.

EJEMPLO DE RESPUESTA ESTRUCTURADA:
1. ¿Por qué el trabajador se cayó de la escalera? [Causa Directa]
   • Mano de Obra: El trabajador no mantuvo tres puntos de contacto.
   • Método: El procedimiento de trabajo en alturas era ambiguo.
   • Maquinaria: La escalera tenía un peldaño dañado.
   • Medio Ambiente: El suelo estaba resbaladizo por un derrame.
   • Material: N/A
2. ¿Por qué el trabajador no mantuvo tres puntos de contacto?
   • Mano de Obra: Intentaba cargar una caja mientras subía.
   • Método: No se prohibió explícitamente subir con objetos en las manos.
   • Maquinaria: N/A
   • Medio Ambiente: N/A
   • Material: La caja era pesada y voluminosa.

Ahora, realiza el análisis para el siguiente accidente, imitando el formato \
del ejemplo y siguiendo las reglas.
- Basa tu análisis en la información proporcionada.
- Completa los 5 niveles del porqué.
- Para cada nivel, analiza las 5M (Mano de Obra, Método, Maquinaria, Medio \
Ambiente, Material). Si una categoría no aplica, indica \"N/A\".
- Sé conciso y accionable.";

/// Client for a locally served completion endpoint (llama.cpp-style
/// `/completion`: prompt in, generated text out).
pub struct MistralClient {
    endpoint: String,
    client: Client,
}

impl MistralClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

    fn complete(&self, prompt: &str) -> Result<String, String> {
        let body = serde_json::json!({
            "prompt": prompt,
            "n_predict": 1024,
            "temperature": 0.7,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    "analysis model unreachable, is the local server running?".to_string()
                } else {
                    format!("analysis request failed: {e}")
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("analysis request failed ({status})"));
        }
        let json: serde_json::Value = response
            .json()
            .map_err(|e| format!("invalid analysis response: {e}"))?;
        json.get("content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| "no content in analysis response".to_string())
    }
}

impl CauseAnalyzer for MistralClient {
    fn analyze(&self, descripcion: &str, contexto_adicional: &str) -> FiveWhysAnalysis {
        let descripcion = descripcion.trim();
        if descripcion.is_empty() || descripcion == "N/A" {
            warn!("no accident description available, skipping analysis");
            return FiveWhysAnalysis::fallback();
        }

        let mut prompt = format!("{PROMPT_RULES}\n\n**Descripción del accidente:**\n{descripcion}");
        let contexto = contexto_adicional.trim();
        if !contexto.is_empty() && !contexto.contains("Añade aquí") {
            prompt.push_str(&format!("\n\n**Contexto Adicional:**\n{contexto}"));
        }
        prompt.push_str("\n\n**Análisis de 5 Porqués:**");

        info!(endpoint = %self.endpoint, "requesting 5-whys analysis");
        match self.complete(&prompt) {
            Ok(text) => {
                debug!(chars = text.len(), "analysis response received");
                parse_structured_analysis(&text)
            }
            Err(e) => {
                error!(error = %e, "5-whys analysis failed, using fallback");
                FiveWhysAnalysis::fallback()
            }
        }
    }
}

/// Parse the numbered "N. ¿Por qué ...?" blocks of a model response into the
/// fixed five-level shape. Levels the model skipped come back as
/// "Análisis no generado" with every category at N/A.
pub fn parse_structured_analysis(text: &str) -> FiveWhysAnalysis {
    let header = Regex::new(r"(?mi)^\s*([1-5])\.\s*¿?Por qu[ée]").expect("level header regex");

    let mut headers: Vec<(u8, usize, usize)> = Vec::new();
    for caps in header.captures_iter(text) {
        let whole = caps.get(0).expect("whole match");
        let level: u8 = caps[1].parse().unwrap_or(0);
        headers.push((level, whole.start(), whole.end()));
    }
    if headers.is_empty() {
        warn!("no '¿Por qué' blocks found in analysis response");
    }

    let mut levels: Vec<Option<WhyLevel>> = vec![None; 5];
    for (i, (level, _, content_start)) in headers.iter().enumerate() {
        if *level < 1 || *level > 5 {
            continue;
        }
        let content_end = headers
            .get(i + 1)
            .map(|(_, next_start, _)| *next_start)
            .unwrap_or(text.len());
        let content = &text[*content_start..content_end];
        levels[(*level - 1) as usize] = Some(parse_level_content(content));
    }

    FiveWhysAnalysis {
        levels: levels
            .into_iter()
            .map(|l| l.unwrap_or_else(|| WhyLevel::unavailable("Análisis no generado")))
            .collect(),
    }
}

/// One level block: the first line is the cause, bullet lines carry the 5M
/// categories, continuation lines extend the current category.
fn parse_level_content(content: &str) -> WhyLevel {
    let mut level = WhyLevel::unavailable("");
    level.causa = content
        .lines()
        .next()
        .map(|l| l.trim().trim_end_matches('?').trim().to_string())
        .unwrap_or_default();

    let mut current: Option<usize> = None;
    for line in content.lines().skip(1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('•').or_else(|| trimmed.strip_prefix('-')) {
            if let Some((label, value)) = rest.split_once(':') {
                let label = label.trim().to_lowercase();
                let slot = if label.contains("mano de obra") {
                    Some(0)
                } else if label.contains("método") || label.contains("metodo") {
                    Some(1)
                } else if label.contains("maquinaria") {
                    Some(2)
                } else if label.contains("medio ambiente") {
                    Some(3)
                } else if label.contains("material") {
                    Some(4)
                } else {
                    None
                };
                if let Some(idx) = slot {
                    *category_mut(&mut level, idx) = value.trim().to_string();
                    current = Some(idx);
                    continue;
                }
            }
            current = None;
        } else if let Some(idx) = current {
            let slot = category_mut(&mut level, idx);
            if !slot.is_empty() && slot != "N/A" {
                slot.push(' ');
                slot.push_str(trimmed);
            }
        }
    }
    level
}

fn category_mut(level: &mut WhyLevel, idx: usize) -> &mut String {
    match idx {
        0 => &mut level.mano_de_obra,
        1 => &mut level.metodo,
        2 => &mut level.maquinaria,
        3 => &mut level.medio_ambiente,
        _ => &mut level.material,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
1. ¿Por qué el trabajador se cayó de la escalera? [Causa Directa]
   • Mano de Obra: No mantuvo tres puntos de contacto.
   • Método: El procedimiento era ambiguo
     y no estaba publicado.
   • Maquinaria: La escalera tenía un peldaño dañado.
   • Medio Ambiente: N/A
   • Material: N/A
2. ¿Por qué no mantuvo tres puntos de contacto?
   • Mano de Obra: Cargaba una caja mientras subía.
   • Método: N/A
   • Maquinaria: N/A
   • Medio Ambiente: N/A
   • Material: La caja era voluminosa.
";

    #[test]
    fn parses_levels_and_categories() {
        let analysis = parse_structured_analysis(SAMPLE);
        assert_eq!(analysis.levels.len(), 5);
        let first = &analysis.levels[0];
        assert!(first.causa.contains("se cayó de la escalera"));
        assert_eq!(first.mano_de_obra, "No mantuvo tres puntos de contacto.");
        assert_eq!(first.maquinaria, "La escalera tenía un peldaño dañado.");
        assert_eq!(first.medio_ambiente, "N/A");
        let second = &analysis.levels[1];
        assert_eq!(second.material, "La caja era voluminosa.");
    }

    #[test]
    fn continuation_lines_extend_category() {
        let analysis = parse_structured_analysis(SAMPLE);
        assert_eq!(
            analysis.levels[0].metodo,
            "El procedimiento era ambiguo y no estaba publicado."
        );
    }

    #[test]
    fn missing_levels_are_filled() {
        let analysis = parse_structured_analysis(SAMPLE);
        for level in &analysis.levels[2..] {
            assert_eq!(level.causa, "Análisis no generado");
            assert_eq!(level.material, "N/A");
        }
    }

    #[test]
    fn garbage_response_yields_all_placeholders() {
        let analysis = parse_structured_analysis("lo siento, no puedo ayudar con eso");
        assert_eq!(analysis.levels.len(), 5);
        assert!(analysis.levels.iter().all(|l| l.causa == "Análisis no generado"));
    }

    #[test]
    fn empty_description_short_circuits_to_fallback() {
        let client = MistralClient::new("http://127.0.0.1:1/completion");
        let analysis = client.analyze("  ", "");
        assert_eq!(analysis, FiveWhysAnalysis::fallback());
        let analysis = client.analyze("N/A", "");
        assert_eq!(analysis, FiveWhysAnalysis::fallback());
    }

    #[test]
    fn disabled_analyzer_returns_fallback() {
        let analysis = DisabledAnalyzer.analyze("cualquier cosa", "");
        assert_eq!(analysis, FiveWhysAnalysis::fallback());
    }
}
