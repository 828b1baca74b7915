//! PDF to plain text. The regex layer depends on accented Spanish text
//! normalizing consistently, so the full blob is NFC-normalized before it
//! leaves this module.

use crate::errors::{ProcessError, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

/// Extract the text of every page, in reading order, as one newline-joined
/// NFC-normalized string.
///
/// Fails with `FileNotFound` when the path does not exist and with
/// `Extraction` when the PDF cannot be decoded at all; missing text on a
/// page is not an error.
pub fn extract_text(pdf_path: &Path) -> Result<String> {
    if !pdf_path.exists() {
        return Err(ProcessError::FileNotFound {
            path: pdf_path.to_path_buf(),
        });
    }
    let raw = pdf_extract::extract_text(pdf_path).map_err(|e| ProcessError::Extraction {
        path: pdf_path.to_path_buf(),
        message: e.to_string(),
    })?;
    let text: String = raw.nfc().collect();
    debug!(path = %pdf_path.display(), chars = text.len(), "extracted pdf text");
    Ok(text)
}

/// Write the raw extracted text next to the pipeline logs for
/// troubleshooting (`<stem>_extracted_text.log`). Best effort: a failed dump
/// is logged, never fatal.
pub fn dump_debug_text(pdf_path: &Path, text: &str, log_dir: &Path) {
    let stem = pdf_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("documento");
    let target = log_dir.join(format!("{stem}_extracted_text.log"));
    if let Err(e) = fs::create_dir_all(log_dir).and_then(|_| fs::write(&target, text)) {
        warn!(path = %target.display(), error = %e, "could not write debug text dump");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_file_not_found() {
        let err = extract_text(Path::new("/nonexistent/archivo.pdf")).unwrap_err();
        assert!(matches!(err, ProcessError::FileNotFound { .. }));
    }

    #[test]
    fn corrupt_pdf_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roto.pdf");
        fs::write(&path, b"not a pdf at all").unwrap();
        let err = extract_text(&path).unwrap_err();
        assert!(matches!(err, ProcessError::Extraction { .. }));
    }

    #[test]
    fn debug_dump_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        dump_debug_text(Path::new("informe.pdf"), "texto crudo", dir.path());
        let dumped = fs::read_to_string(dir.path().join("informe_extracted_text.log")).unwrap();
        assert_eq!(dumped, "texto crudo");
    }
}
