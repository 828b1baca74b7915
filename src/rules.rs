//! Data-driven extraction rule tables, one per document layout variant.
//!
//! Each rule names a canonical field, an ordered list of pattern variants
//! and a normalizer. Patterns are tried in declaration order and the first
//! match wins; the normalizer only ever sees a matched capture. Fields that
//! stay unmatched after every pattern receive their sentinel, so the
//! resulting map always contains every declared field.
//!
//! Patterns must stop at logical section boundaries (the next all-caps
//! header or a fixed follow-on label) — source documents vary in section
//! ordering and label spelling, which is why several fields carry more than
//! one pattern. Rust's regex engine has no lookaround, so boundary labels
//! are consumed by non-capturing terminator groups instead of asserted.

use crate::dates::normalize_date;
use crate::types::DocumentKind;
use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Sentinel for identity/demographic fields that could not be located.
pub const SENTINEL_NOT_FOUND: &str = "N/A";
/// Sentinel for administrative free-text fields: "none reported".
pub const SENTINEL_NONE: &str = "NINGUNO";

type Normalizer = fn(&str) -> String;

pub struct ExtractionRule {
    pub field: &'static str,
    pub patterns: &'static [&'static str],
    pub normalize: Normalizer,
    pub sentinel: &'static str,
}

fn trim(value: &str) -> String {
    value.trim().to_string()
}

fn upper(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Uppercase with internal newlines collapsed to single spaces.
fn upper_block(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Single-line free text: trim and fold newlines into spaces, keep case.
fn single_line(value: &str) -> String {
    value.trim().replace('\n', " ")
}

fn capitalize(value: &str) -> String {
    let v = value.trim();
    let mut chars = v.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn date(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }
    normalize_date(v)
}

/// The source layout sometimes runs the SVE label straight into the next
/// section header; a capture that *is* the next header is no value at all.
fn incluir_sve(value: &str) -> String {
    let v = value.trim();
    if v.to_uppercase().starts_with("RESTRICCIONES") {
        return String::new();
    }
    v.to_uppercase()
}

fn espacios_confinados(value: &str) -> String {
    let v = value.trim();
    if v.to_uppercase().starts_with("MOTIVO") {
        return String::new();
    }
    v.to_uppercase()
}

/// "Concepto Medico: LEVANTAMIENTO ..." is a different section of the form
/// bleeding through, not a medical concept.
fn concepto_medico(value: &str) -> String {
    let v = value.trim();
    if v.to_uppercase().starts_with("LEVANTAMIENTO") {
        return String::new();
    }
    v.to_uppercase()
}

/// Rule table for EPS occupational-health evaluation certificates.
pub static MEDICAL_RULES: &[ExtractionRule] = &[
    ExtractionRule {
        field: "Nombre_Completo",
        patterns: &[r"(?:Nombre\s*Completo|Paciente|Nombre)[:\s]*(.*?)(?:\n|SEXO:|DOCUMENTO|IDENTIFICACI[ÓO]N|$)"],
        normalize: upper,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "No_Identificacion",
        patterns: &[
            r"(?:Documento[:\s]*CC[:\s]*(\d+))|(?:(?:No\.|N[úu]mero)\s*(?:de)?\s*Identificaci[óo]n[:\s]*(?:CC\s*-\s*)?(\d{7,12}))|(?:(?:CC|TI|CE)[:\s-]*(\d{7,12}))|(?:(?:c[ée]dula|documento|identificaci[óo]n)[:\s]*(\d{7,12}))",
        ],
        normalize: digits,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Fecha_Nac",
        patterns: &[r"Fecha\s*(?:de)?\s*Nac(?:imiento)?[:\s]*([\d/-]+)"],
        normalize: date,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Edad",
        patterns: &[r"Edad[:\s]*(\d+)"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Sexo",
        patterns: &[r"(?:Sexo|G[ée]nero)[:\s]*([A-Za-zÁ-Úá-ú]+)"],
        normalize: capitalize,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Afiliacion",
        patterns: &[r"(?:Afiliaci[óo]n|Empresa)[:\s]*(.*?)(?:\n|$)"],
        normalize: upper,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Estado_Civil",
        patterns: &[r"Estado\s*civil[:\s]*(.*?)(?:\n|$)"],
        normalize: capitalize,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Evaluacion_Ocupacional",
        patterns: &[
            r"(?:TIPO\s*DE\s*EVALUACI[ÓO]N\s*REALIZADA|Tipo\s*de\s*Examen|Evaluaci[óo]n\s*Ocupacional)[:\s]*([^:\n]+?)(?:\s*Fecha\s*de\s*atenci[óo]n:|\n|$)",
        ],
        normalize: upper,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Fecha_Atencion",
        patterns: &[r"Fecha\s*(?:de)?\s*atenc[\w\s]*[:\s]*([\d]{1,2}[\-/][\d]{1,2}[\-/][\d]{2,4})"],
        normalize: date,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Cargo",
        patterns: &[r"Cargo[:\s]*([^:\n]+?)(?:\s*Fecha\s*de|\n|$)"],
        normalize: upper,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Examenes_Realizados",
        patterns: &[
            r"EX[ÁA]MENES\s*REALIZADOS[:\s]*(.*?)(?:\s*RECOMENDACIONES|\s*INCLUIR|\s*RESTRICCIONES|\s*MANEJO|\s*$)",
        ],
        normalize: upper_block,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Recomendaciones_Laborales",
        patterns: &[r"RECOMENDACIONES\s*LABORALES[:\s]*(.*?)(?:MANEJO\s*EPS/ARL|$)"],
        normalize: upper,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Incluir_SVE",
        patterns: &[r"Incluir\s*SVE[:\s]*([^\n:]+?)(?:\s*RESTRICCIONES|\s*Concepto|\n|$)"],
        normalize: incluir_sve,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Restricciones_Laborales",
        patterns: &[
            r"RESTRICCIONES\s*LABORALES[:\s]*(.*?)(?:\s*Para\s*la\s*revisi[óo]n|\s*INCLUIR|\s*CONCEPTO|\s*[A-ZÁ-Ú]+:|$)",
        ],
        normalize: upper,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Concepto_Medico",
        patterns: &[r"Concepto\s*M[ée]dico[:\s]*([^:\n]+)"],
        normalize: concepto_medico,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Concepto_Manipulacion_Alimento",
        patterns: &[r"Concepto\s*(?:Manipulaci[óo]n)?\s*Alimento[:\s]*(.*?)(?:\n|$)"],
        normalize: upper,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Concepto_Altura",
        patterns: &[r"Concepto\s*Altura[:\s]*(.*?)(?:\n|$)"],
        normalize: upper,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Concepto_Espacios_Confinados",
        patterns: &[
            r"Concepto\s*de\s*trabajo\s*en\s*espacios\s*confinados[:\s]*([^:\n]+?)(?:\s*MOTIVO|\n|$)",
        ],
        normalize: espacios_confinados,
        sentinel: SENTINEL_NONE,
    },
    ExtractionRule {
        field: "Motivo_Restriccion",
        patterns: &[r"MOTIVO\s*DE\s*RESTRICCI[OÓ]N[:\s]*(.*?)(?:\nFIRMA|$)"],
        normalize: upper,
        sentinel: SENTINEL_NONE,
    },
];

/// Rule table for FURAT accident reports. The form is column-oriented, so
/// most labels sit on their own line with the value on the next one.
pub static ACCIDENT_RULES: &[ExtractionRule] = &[
    ExtractionRule {
        field: "No_Identificacion",
        patterns: &[
            r"Identificaci[óo]n\s*\n.*?C\.C\.\s*(\d[\d\.\s]+)",
            r"C\.C\.\s*([\d\.\s]+)",
            r"Identificaci[oó]n\s*[:\s]*(\d[\d\.\s]+?)\s",
        ],
        normalize: digits,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Nombre_Completo",
        patterns: &[
            r"Primer Apellido\s*([\w\s]+?)\s*Segundo Apellido\s*([\w\s]+?)\s*Nombres\s*([\w\s]+?)\n",
            r"Nombre Completo\s*[:\s]*([\w\s]+?)\n",
        ],
        normalize: upper,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Fecha_Accidente",
        patterns: &[
            r"Fecha\s+y\s+Hora\s+del\s+Accidente\s*(\d{2}/\d{2}/\d{4})",
            r"Fecha\s+del\s+Accidente\s*[:\s]*(\d{2}/\d{2}/\d{4})\b",
        ],
        normalize: date,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Hora_Accidente",
        patterns: &[r"Fecha\s+y\s+Hora\s+del\s+Accidente\s.*?(\d{1,2}:\d{2}:\d{2}\s*(?:AM|PM))"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Cargo",
        patterns: &[r"Cargo\s*\n.*?\n([\w\s]+?)\n"],
        normalize: upper,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Tipo_Accidente",
        patterns: &[r"Tipo\s+de\s+Accidente\s*\n([\w\s]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Lugar_Accidente",
        patterns: &[r"Lugar\s+donde\s+Ocurrio\s+el\s+accidente\s*\n([\w\s]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Sitio_Ocurrencia",
        patterns: &[r"Sitio\s+de\s+Ocurrencia\s*\n([\w\s]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Tipo_Lesion",
        patterns: &[r"Tipo\s+de\s+Lesi[óo]n\s*\n([\w\s]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Parte_Cuerpo_Afectada",
        patterns: &[r"Parte\s+del\s+Cuerpo\s+Aparentemente\s+Afectada\s*\n([\w\s]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Agente_Accidente",
        patterns: &[r"Agente\s+del\s+Accidente\s*\n([\w\s\(\)]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Mecanismo_Accidente",
        patterns: &[r"Mecanismo\s+o\s+Forma\s+del\s+Accidente\s*\n([\w\s]+?)\n"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Descripcion_Accidente",
        patterns: &[r"IV\.\s*DESCRIPCI[ÓO]N\s+DEL\s+ACCIDENTE\s*\n(.*?)\nPersonas"],
        normalize: single_line,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Fecha_Nacimiento",
        patterns: &[r"Fecha\s+de\s+Nacimiento\s*[:\s]*([^\n]+)"],
        normalize: date,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Telefono_Domicilio",
        patterns: &[r"Tel[ée]fono\s+Domicilio\s*[:\s]*([^\n]+)"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Fecha_Ingreso_Empresa",
        patterns: &[r"Fecha\s+de\s+Ingreso\s+a\s+la\s+Empresa\s*[:\s]*([^\n]+)"],
        normalize: date,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Jornada_Trabajo",
        patterns: &[r"Jornada\s+de\s+Trabajo\s+Habitual\s*[:\s]*([^\n]+)"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Tiempo_Ocupacion",
        patterns: &[
            r"Tiempo\s+de\s+Ocupaci[óo]n\s+Habitual\s+al\s+Momento\s+del\s+Accidente\s*[:\s]*([^\n]+)",
        ],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
    ExtractionRule {
        field: "Tipo_Vinculacion",
        patterns: &[r"Tipo\s+de\s+Vinculaci[oó]n\s*[:\s]*([^\n]+)"],
        normalize: trim,
        sentinel: SENTINEL_NOT_FOUND,
    },
];

struct CompiledRule {
    field: &'static str,
    regexes: Vec<Regex>,
    normalize: Normalizer,
    sentinel: &'static str,
}

/// A compiled rule table for one layout variant.
pub struct RuleSet {
    kind: DocumentKind,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn for_kind(kind: DocumentKind) -> Self {
        let table = match kind {
            DocumentKind::MedicalEvaluation => MEDICAL_RULES,
            DocumentKind::AccidentReport => ACCIDENT_RULES,
        };
        let rules = table
            .iter()
            .map(|rule| CompiledRule {
                field: rule.field,
                regexes: rule
                    .patterns
                    .iter()
                    .map(|p| {
                        RegexBuilder::new(p)
                            .case_insensitive(true)
                            .dot_matches_new_line(true)
                            .build()
                            .expect("rule pattern")
                    })
                    .collect(),
                normalize: rule.normalize,
                sentinel: rule.sentinel,
            })
            .collect();
        Self { kind, rules }
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.field)
    }

    pub fn sentinel_for(&self, field: &str) -> Option<&'static str> {
        self.rules.iter().find(|r| r.field == field).map(|r| r.sentinel)
    }

    /// Run every rule against `text`. The returned map contains an entry for
    /// every declared field; unmatched or empty-after-normalization fields
    /// hold their sentinel.
    pub fn apply(&self, text: &str) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        for rule in &self.rules {
            let mut value = String::new();
            for (idx, re) in rule.regexes.iter().enumerate() {
                if let Some(caps) = re.captures(text) {
                    let groups: Vec<&str> = caps
                        .iter()
                        .skip(1)
                        .flatten()
                        .map(|m| m.as_str())
                        .collect();
                    // Several name patterns capture apellido/apellido/nombres
                    // triples; joined before normalization.
                    let raw = groups.join(" ");
                    value = (rule.normalize)(&raw);
                    debug!(field = rule.field, pattern = idx, %value, "field matched");
                    break;
                }
            }
            if value.is_empty() {
                warn!(field = rule.field, "field not matched, using sentinel");
                value = rule.sentinel.to_string();
            }
            data.insert(rule.field.to_string(), value);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_declared_field_present_on_empty_input() {
        for kind in [DocumentKind::MedicalEvaluation, DocumentKind::AccidentReport] {
            let rules = RuleSet::for_kind(kind);
            let data = rules.apply("");
            for field in rules.field_names() {
                let value = data.get(field).expect("field missing from map");
                assert_eq!(value, rules.sentinel_for(field).unwrap());
            }
        }
    }

    #[test]
    fn identity_strips_non_digits() {
        let rules = RuleSet::for_kind(DocumentKind::MedicalEvaluation);
        let data = rules.apply("No. Identificacion: CC - 12345678\n");
        assert_eq!(data["No_Identificacion"], "12345678");
    }

    #[test]
    fn accident_identity_first_pattern_wins() {
        let rules = RuleSet::for_kind(DocumentKind::AccidentReport);
        let text = "Identificación\nTipo C.C. 1.098.765.432 \notros\n";
        let data = rules.apply(text);
        assert_eq!(data["No_Identificacion"], "1098765432");
    }

    #[test]
    fn name_triple_is_joined_and_uppercased() {
        let rules = RuleSet::for_kind(DocumentKind::AccidentReport);
        let text = "Primer Apellido Perez Segundo Apellido Gomez Nombres Juan Carlos\n";
        let data = rules.apply(text);
        assert_eq!(data["Nombre_Completo"], "PEREZ GOMEZ JUAN CARLOS");
    }

    #[test]
    fn evaluacion_stops_before_following_label() {
        let rules = RuleSet::for_kind(DocumentKind::MedicalEvaluation);
        let text = "TIPO DE EVALUACION REALIZADA: INGRESO Fecha de atención: 15/08/2025\n";
        let data = rules.apply(text);
        assert_eq!(data["Evaluacion_Ocupacional"], "INGRESO");
        assert_eq!(data["Fecha_Atencion"], "2025/08/15");
    }

    #[test]
    fn restricciones_stops_at_next_header() {
        let rules = RuleSet::for_kind(DocumentKind::MedicalEvaluation);
        let text = "RESTRICCIONES LABORALES: evitar cargas pesadas\nCONCEPTO MEDICO: APTO\n";
        let data = rules.apply(text);
        assert_eq!(data["Restricciones_Laborales"], "EVITAR CARGAS PESADAS");
    }

    #[test]
    fn concepto_medico_rejects_levantamiento_bleed() {
        let rules = RuleSet::for_kind(DocumentKind::MedicalEvaluation);
        let data = rules.apply("Concepto Medico: LEVANTAMIENTO DE CARGAS\n");
        assert_eq!(data["Concepto_Medico"], SENTINEL_NONE);
    }

    #[test]
    fn dates_normalize_through_rules() {
        let rules = RuleSet::for_kind(DocumentKind::AccidentReport);
        let text = "Fecha y Hora del Accidente 15/08/2025 10:30:00 AM\n";
        let data = rules.apply(text);
        assert_eq!(data["Fecha_Accidente"], "2025/08/15");
        assert_eq!(data["Hora_Accidente"], "10:30:00 AM");
    }

    #[test]
    fn administrative_fields_default_to_ninguno() {
        let rules = RuleSet::for_kind(DocumentKind::MedicalEvaluation);
        let data = rules.apply("Nombre Completo: JUAN PEREZ\n");
        assert_eq!(data["Concepto_Altura"], SENTINEL_NONE);
        assert_eq!(data["Restricciones_Laborales"], SENTINEL_NONE);
        assert_eq!(data["Fecha_Nac"], SENTINEL_NOT_FOUND);
    }
}
