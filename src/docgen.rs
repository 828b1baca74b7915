//! Render a field map into a Word template and persist it uniquely.
//!
//! A `.docx` is a zip of XML parts; rendering rewrites the document body
//! (and headers/footers) replacing `{{campo}}` merge fields with context
//! values, copying every other part untouched. A merge field with no
//! matching context key is a surfaced error — a silently incomplete
//! remision or investigation document is worse than a visible failure.

use crate::errors::{ProcessError, Result};
use crate::types::FiveWhysAnalysis;
use chrono::Local;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub struct DocumentGenerator;

impl DocumentGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Render `template_path` with `context` and save it under `output_dir`
    /// as `<prefix>_<sanitized-name>_<YYYYMMDD>[_<counter>].<ext>`.
    ///
    /// The person name for the filename is taken from the
    /// `Nombre_Completo` context entry. On filename collision an
    /// incrementing counter is appended until the path is free; existing
    /// documents are never overwritten.
    pub fn render(
        &self,
        context: &BTreeMap<String, String>,
        template_path: &Path,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<PathBuf> {
        if !template_path.exists() {
            return Err(ProcessError::FileNotFound {
                path: template_path.to_path_buf(),
            });
        }
        std::fs::create_dir_all(output_dir)?;

        let render_err = |message: String| ProcessError::Render {
            template: template_path.to_path_buf(),
            message,
        };

        let file = File::open(template_path)?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| render_err(format!("invalid template: {e}")))?;

        let mut parts: Vec<(String, Vec<u8>)> = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| render_err(format!("template entry {i}: {e}")))?;
            let name = entry.name().replace('\\', "/");
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            if is_renderable_part(&name) {
                let xml = String::from_utf8_lossy(&data).into_owned();
                let rendered = substitute_fields(&xml, context)
                    .map_err(|field| render_err(format!("template field '{field}' has no value")))?;
                parts.push((name, rendered.into_bytes()));
            } else {
                parts.push((name, data));
            }
        }

        let nombre = context
            .get("Nombre_Completo")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("sin_nombre");
        let extension = template_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("docx");
        let output_path = free_output_path(output_dir, prefix, nombre, extension);

        let out_file = File::create(&output_path)?;
        let mut zip_writer = ZipWriter::new(out_file);
        let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in &parts {
            zip_writer
                .start_file(name.as_str(), opts)
                .map_err(|e| render_err(e.to_string()))?;
            zip_writer.write_all(data)?;
        }
        zip_writer
            .finish()
            .map_err(|e| render_err(e.to_string()))?;

        info!(path = %output_path.display(), "document generated");
        Ok(output_path)
    }
}

impl Default for DocumentGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn is_renderable_part(name: &str) -> bool {
    name == "word/document.xml"
        || (name.starts_with("word/header") && name.ends_with(".xml"))
        || (name.starts_with("word/footer") && name.ends_with(".xml"))
}

/// Replace every `{{campo}}` with its context value. Returns the missing
/// field name on the first reference without a value.
fn substitute_fields(
    xml: &str,
    context: &BTreeMap<String, String>,
) -> std::result::Result<String, String> {
    let field_re = Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("merge field regex");

    let referenced: BTreeSet<&str> = field_re
        .captures_iter(xml)
        .map(|c| c.get(1).expect("field group").as_str())
        .collect();
    for field in &referenced {
        if !context.contains_key(*field) {
            return Err((*field).to_string());
        }
    }

    let rendered = field_re.replace_all(xml, |caps: &regex::Captures| {
        let value = context.get(&caps[1]).map(String::as_str).unwrap_or("");
        debug!(field = &caps[1], "merge field substituted");
        xml_escape(value)
    });
    Ok(rendered.into_owned())
}

/// XML-escape a context value; newlines become real line breaks inside the
/// run so multi-line recommendations stay readable.
fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\r' => {}
            '\n' => out.push_str("</w:t><w:br/><w:t xml:space=\"preserve\">"),
            _ => out.push(c),
        }
    }
    out
}

/// Non-word characters stripped, whitespace (including embedded newlines)
/// collapsed to single underscores.
fn sanitize_filename(name: &str) -> String {
    let stripped = Regex::new(r"[^\w\s-]")
        .expect("filename strip regex")
        .replace_all(name, "");
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// First collision-free `<prefix>_<name>_<date>[_<counter>].<ext>` path.
fn free_output_path(output_dir: &Path, prefix: &str, nombre: &str, extension: &str) -> PathBuf {
    let fecha = Local::now().format("%Y%m%d");
    let base = format!("{}_{}_{}", prefix, sanitize_filename(nombre), fecha);
    let mut output_path = output_dir.join(format!("{base}.{extension}"));
    let mut counter = 1u32;
    while output_path.exists() {
        output_path = output_dir.join(format!("{base}_{counter}.{extension}"));
        counter += 1;
    }
    output_path
}

/// Build a render context from a canonical field map: keys lose periods and
/// map spaces to underscores (already true for canonical names, kept for
/// caller-supplied extras).
pub fn flatten_fields(fields: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    fields
        .iter()
        .map(|(k, v)| (k.replace('.', "").replace(' ', "_"), v.clone()))
        .collect()
}

/// Flatten the five analysis levels into per-level, per-category keys so
/// template cells can address each one independently:
/// `por_que_1_causa`, `por_que_1_mano_de_obra`, ... `por_que_5_material`.
pub fn flatten_analysis(analysis: &FiveWhysAnalysis, context: &mut BTreeMap<String, String>) {
    for (i, level) in analysis.levels.iter().enumerate() {
        let base = format!("por_que_{}", i + 1);
        context.insert(format!("{base}_causa"), level.causa.clone());
        context.insert(format!("{base}_mano_de_obra"), level.mano_de_obra.clone());
        context.insert(format!("{base}_metodo"), level.metodo.clone());
        context.insert(format!("{base}_maquinaria"), level.maquinaria.clone());
        context.insert(format!("{base}_medio_ambiente"), level.medio_ambiente.clone());
        context.insert(format!("{base}_material"), level.material.clone());
    }
}

/// Visible text of a rendered document, paragraphs separated by newlines.
/// Used to verify round-trips without opening Word.
pub fn extract_document_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ProcessError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| ProcessError::Render {
        template: path.to_path_buf(),
        message: format!("invalid document: {e}"),
    })?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ProcessError::Render {
            template: path.to_path_buf(),
            message: format!("word/document.xml missing: {e}"),
        })?
        .read_to_string(&mut xml)?;

    let mut reader = XmlReader::from_str(&xml);
    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => out.push_str(&t.unescape().unwrap_or_default()),
            Ok(Event::End(e)) if e.name().as_ref() == b"w:p" => out.push('\n'),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:br" => out.push('\n'),
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal docx with the given paragraph texts in the body.
    pub fn write_template(path: &Path, paragraphs: &[&str]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let opts = SimpleFileOptions::default();

        zip.start_file("[Content_Types].xml", opts).unwrap();
        zip.write_all(
            br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>
</Types>"#,
        )
        .unwrap();

        zip.start_file("_rels/.rels", opts).unwrap();
        zip.write_all(
            br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>
</Relationships>"#,
        )
        .unwrap();

        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{p}</w:t></w:r></w:p>"))
            .collect();
        let document = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        zip.start_file("word/document.xml", opts).unwrap();
        zip.write_all(document.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_template;
    use super::*;
    use crate::types::WhyLevel;

    fn context(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_fields_verbatim_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("plantilla.docx");
        write_template(
            &template,
            &[
                "Señor(a) {{Nombre_Completo}}, CC {{No_Identificacion}}",
                "Recomendaciones: {{Recomendaciones_Laborales}}",
            ],
        );

        let ctx = context(&[
            ("Nombre_Completo", "JUAN PÉREZ"),
            ("No_Identificacion", "12345678"),
            ("Recomendaciones_Laborales", "PAUSAS ACTIVAS CADA 2 HORAS"),
        ]);
        let path = DocumentGenerator::new()
            .render(&ctx, &template, dir.path(), "GI-OD-007_REMISION_EPS")
            .unwrap();

        let text = extract_document_text(&path).unwrap();
        assert!(text.contains("JUAN PÉREZ"));
        assert!(text.contains("12345678"));
        assert!(text.contains("PAUSAS ACTIVAS CADA 2 HORAS"));
    }

    #[test]
    fn escaped_characters_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("plantilla.docx");
        write_template(&template, &["{{Observaciones}}"]);

        let ctx = context(&[
            ("Nombre_Completo", "ANA"),
            ("Observaciones", "CARGA < 10 KG & PAUSAS"),
        ]);
        let path = DocumentGenerator::new()
            .render(&ctx, &template, dir.path(), "DOC")
            .unwrap();
        let text = extract_document_text(&path).unwrap();
        assert!(text.contains("CARGA < 10 KG & PAUSAS"));
    }

    #[test]
    fn missing_context_key_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("plantilla.docx");
        write_template(&template, &["Hola {{Campo_Inexistente}}"]);

        let err = DocumentGenerator::new()
            .render(&context(&[]), &template, dir.path(), "DOC")
            .unwrap_err();
        match err {
            ProcessError::Render { message, .. } => {
                assert!(message.contains("Campo_Inexistente"), "{message}")
            }
            other => panic!("expected Render error, got {other:?}"),
        }
    }

    #[test]
    fn missing_template_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocumentGenerator::new()
            .render(
                &context(&[]),
                &dir.path().join("no_existe.docx"),
                dir.path(),
                "DOC",
            )
            .unwrap_err();
        assert!(matches!(err, ProcessError::FileNotFound { .. }));
    }

    #[test]
    fn collision_appends_counter_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("plantilla.docx");
        write_template(&template, &["{{Nombre_Completo}}"]);
        let out = dir.path().join("salida");

        let ctx = context(&[("Nombre_Completo", "JUAN PEREZ")]);
        let generator = DocumentGenerator::new();
        let first = generator.render(&ctx, &template, &out, "DOC").unwrap();
        let second = generator.render(&ctx, &template, &out, "DOC").unwrap();

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        let stem = second.file_stem().unwrap().to_str().unwrap();
        assert!(stem.ends_with("_1"), "second file should carry a counter: {stem}");
    }

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("JUAN PEREZ"), "JUAN_PEREZ");
        assert_eq!(sanitize_filename("ANA/MARIA: GOMEZ"), "ANAMARIA_GOMEZ");
        assert_eq!(sanitize_filename("LUIS\nROJAS"), "LUIS_ROJAS");
    }

    #[test]
    fn analysis_flattens_to_per_level_keys() {
        let analysis = FiveWhysAnalysis {
            levels: (1..=5)
                .map(|i| WhyLevel {
                    causa: format!("causa {i}"),
                    ..WhyLevel::unavailable("")
                })
                .collect(),
        };
        let mut ctx = BTreeMap::new();
        flatten_analysis(&analysis, &mut ctx);
        assert_eq!(ctx["por_que_1_causa"], "causa 1");
        assert_eq!(ctx["por_que_5_causa"], "causa 5");
        assert_eq!(ctx["por_que_3_mano_de_obra"], "N/A");
        assert_eq!(ctx.len(), 30);
    }

    #[test]
    fn flatten_normalizes_keys() {
        let mut fields = BTreeMap::new();
        fields.insert("No. Identificacion".to_string(), "1".to_string());
        let flat = flatten_fields(&fields);
        assert!(flat.contains_key("No_Identificacion"));
    }
}
