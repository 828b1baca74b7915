//! Outbound dispatch of generated documents.
//!
//! Consumes a finished file path plus contact info: contact lookup against
//! the personnel workbook, SMTP mail with the document attached, and the
//! WhatsApp hand-off that opens a prefilled wa.me conversation plus the
//! document and its folder for manual attachment.

use crate::errors::{ProcessError, Result};
use calamine::{open_workbook_auto, DataType, Reader};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SMTP_SERVER: &str = "smtp.gmail.com";
const EMAIL_SUBJECT: &str = "Seguimiento a Recomendaciones Médicas Laborales";

const EMAIL_BODY: &str = "\
Estimado/a {nombre},
Conforme al resultado del examen médico ocupacional realizado el día {fecha}, \
te compartimos la carta de remisiones médicas, en la cual se detallan \
recomendaciones específicas relacionadas con tu estado de salud y tu \
actividad laboral.

Adjunto encontrarás el documento oficial con las recomendaciones.

Te solicitamos por favor:
- Leer atentamente las recomendaciones.
- Confirmar la recepción de este mensaje y del documento.
- Informarnos si ya estás realizando los controles médicos indicados (si aplica).

Estas recomendaciones serán tenidas en cuenta por el área de Seguridad y \
Salud en el Trabajo para realizar el seguimiento correspondiente, tal como lo \
establece la Resolución 0312 de 2019 y el Decreto 1072 de 2015.

Atentamente,
Equipo {empresa}
Correo: {remitente}";

#[derive(Debug, Clone, Default)]
pub struct Contact {
    pub telefono: Option<String>,
    pub correo: Option<String>,
}

/// Contact lookup against the personnel workbook. Column positions are not
/// fixed across companies, so columns are found by fuzzy header match.
pub struct ContactDirectory {
    path: PathBuf,
    sheet: Option<String>,
}

impl ContactDirectory {
    pub fn new(path: impl Into<PathBuf>, sheet: Option<String>) -> Self {
        Self {
            path: path.into(),
            sheet,
        }
    }

    pub fn lookup(&self, cedula: &str) -> Result<Option<Contact>> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "personnel workbook not found");
            return Ok(None);
        }
        let mut workbook = open_workbook_auto(&self.path)
            .map_err(|e| ProcessError::dispatch(format!("could not open personnel workbook: {e}")))?;
        let sheet_name = match &self.sheet {
            Some(s) => s.clone(),
            None => workbook
                .sheet_names()
                .first()
                .cloned()
                .ok_or_else(|| ProcessError::dispatch("personnel workbook has no worksheets"))?,
        };
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| ProcessError::dispatch(format!("sheet '{sheet_name}' not readable: {e}")))?;

        let mut rows = range.rows();
        let headers: Vec<String> = match rows.next() {
            Some(row) => row
                .iter()
                .map(|c| c.as_string().unwrap_or_default().trim().to_uppercase())
                .collect(),
            None => return Ok(None),
        };
        let col_cedula = find_column(&headers, &["CEDULA", "CÉDULA", "IDENTIFICACIÓN", "IDENTIFICACION"]);
        let col_celular = find_column(&headers, &["CELULAR", "TELÉFONO", "TELEFONO"]);
        let col_correo = find_column(&headers, &["CORREO", "EMAIL"]);
        let Some(col_cedula) = col_cedula else {
            warn!("identity column not found in personnel workbook");
            return Ok(None);
        };

        let wanted = cedula.trim().trim_end_matches(".0");
        for row in rows {
            let value = row
                .get(col_cedula)
                .and_then(|c| c.as_string())
                .unwrap_or_default();
            if value.trim().trim_end_matches(".0") != wanted {
                continue;
            }
            let pick = |col: Option<usize>| {
                col.and_then(|c| row.get(c))
                    .and_then(|c| c.as_string())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            };
            return Ok(Some(Contact {
                telefono: pick(col_celular),
                correo: pick(col_correo),
            }));
        }
        Ok(None)
    }
}

fn find_column(headers: &[String], needles: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| needles.iter().any(|n| h.contains(n)))
}

pub struct EmailSender {
    company: String,
    from_address: String,
    password: String,
}

impl EmailSender {
    pub fn new(
        company: impl Into<String>,
        from_address: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            company: company.into(),
            from_address: from_address.into(),
            password: password.into(),
        }
    }

    /// Send the remision document to `destinatario`.
    pub fn send(
        &self,
        destinatario: &str,
        nombre: &str,
        fecha_atencion: &str,
        adjunto: &Path,
    ) -> Result<()> {
        let email = self.build_message(destinatario, nombre, fecha_atencion, adjunto)?;
        let mailer = SmtpTransport::relay(SMTP_SERVER)
            .map_err(|e| ProcessError::dispatch(format!("smtp setup failed: {e}")))?
            .credentials(Credentials::new(
                self.from_address.clone(),
                self.password.clone(),
            ))
            .build();
        mailer
            .send(&email)
            .map_err(|e| ProcessError::dispatch(format!("could not send email: {e}")))?;
        info!(to = destinatario, "remision sent by email");
        Ok(())
    }

    fn build_message(
        &self,
        destinatario: &str,
        nombre: &str,
        fecha_atencion: &str,
        adjunto: &Path,
    ) -> Result<Message> {
        if !adjunto.exists() {
            return Err(ProcessError::FileNotFound {
                path: adjunto.to_path_buf(),
            });
        }
        let fecha = if fecha_atencion.trim().is_empty() {
            "N/A"
        } else {
            fecha_atencion
        };
        let body = EMAIL_BODY
            .replace("{nombre}", nombre)
            .replace("{fecha}", fecha)
            .replace("{empresa}", &self.company)
            .replace("{remitente}", &self.from_address);

        let from: Mailbox = format!("{} <{}>", self.company, self.from_address)
            .parse()
            .map_err(|e| ProcessError::dispatch(format!("invalid sender address: {e}")))?;
        let to: Mailbox = destinatario
            .trim()
            .parse()
            .map_err(|e| ProcessError::dispatch(format!("invalid recipient address: {e}")))?;

        let filename = adjunto
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("documento.docx")
            .to_string();
        let bytes = std::fs::read(adjunto)?;
        let content_type = ContentType::parse(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        )
        .unwrap_or(ContentType::parse("application/octet-stream").expect("static content type"));

        Message::builder()
            .from(from)
            .to(to)
            .subject(EMAIL_SUBJECT)
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body))
                    .singlepart(Attachment::new(filename).body(bytes, content_type)),
            )
            .map_err(|e| ProcessError::dispatch(format!("could not build email: {e}")))
    }
}

pub struct WhatsAppSender;

impl WhatsAppSender {
    /// Build the prefilled wa.me URL for a phone number and message.
    pub fn build_url(phone: &str, message: &str) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            "https://api.whatsapp.com/send",
            &[("phone", phone), ("text", message)],
        )
        .map_err(|e| ProcessError::dispatch(format!("invalid whatsapp parameters: {e}")))?;
        Ok(url.into())
    }

    /// Open the prefilled conversation in the default browser, plus the
    /// document and its folder so the user can attach it by hand (WhatsApp
    /// has no unattended attachment path).
    pub fn prepare(phone: &str, message: &str, file_path: Option<&Path>) -> Result<String> {
        let url = Self::build_url(phone, message)?;
        opener::open(&url).map_err(|e| ProcessError::dispatch(format!("could not open browser: {e}")))?;
        if let Some(path) = file_path {
            if !path.exists() {
                return Err(ProcessError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            opener::open(path)
                .map_err(|e| ProcessError::dispatch(format!("could not open document: {e}")))?;
            if let Some(folder) = path.parent() {
                let _ = opener::open(folder);
            }
        }
        info!(phone, "whatsapp conversation prepared");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_personnel_workbook(path: &Path) {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let ws = workbook.add_worksheet();
        let headers = ["NOMBRE", "CEDULA", "CELULAR", "CORREO ELECTRONICO"];
        for (col, h) in headers.iter().enumerate() {
            ws.write_string(0, col as u16, *h).unwrap();
        }
        let row = ["ANA GOMEZ", "12345678", "3001234567", "ana@example.com"];
        for (col, v) in row.iter().enumerate() {
            ws.write_string(1, col as u16, *v).unwrap();
        }
        ws.write_string(2, 0, "SIN CONTACTO").unwrap();
        ws.write_string(2, 1, "999").unwrap();
        workbook.save(path).unwrap();
    }

    #[test]
    fn lookup_finds_contact_by_cedula() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("personal.xlsx");
        write_personnel_workbook(&path);

        let directory = ContactDirectory::new(&path, None);
        let contact = directory.lookup("12345678").unwrap().unwrap();
        assert_eq!(contact.telefono.as_deref(), Some("3001234567"));
        assert_eq!(contact.correo.as_deref(), Some("ana@example.com"));
    }

    #[test]
    fn lookup_handles_missing_person_and_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("personal.xlsx");
        write_personnel_workbook(&path);

        let directory = ContactDirectory::new(&path, None);
        assert!(directory.lookup("00000000").unwrap().is_none());

        let contact = directory.lookup("999").unwrap().unwrap();
        assert!(contact.telefono.is_none());
        assert!(contact.correo.is_none());
    }

    #[test]
    fn lookup_on_missing_workbook_is_none_not_error() {
        let directory = ContactDirectory::new("/no/existe.xlsx", None);
        assert!(directory.lookup("123").unwrap().is_none());
    }

    #[test]
    fn whatsapp_url_is_percent_encoded() {
        let url = WhatsAppSender::build_url("573001234567", "Hola Ana, ¿recibiste el documento?")
            .unwrap();
        assert!(url.starts_with("https://api.whatsapp.com/send?phone=573001234567&text="));
        assert!(!url.contains(' '));
        assert!(url.contains("Hola"));
    }

    #[test]
    fn email_message_builds_with_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let adjunto = dir.path().join("remision.docx");
        std::fs::write(&adjunto, b"docx bytes").unwrap();

        let sender = EmailSender::new("TEMPOACTIVA", "tempo@example.com", "secreto");
        let message = sender
            .build_message("ana@example.com", "ANA GOMEZ", "2025/08/15", &adjunto)
            .unwrap();
        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("ana@example.com"));
        assert!(formatted.contains("remision.docx"));
    }

    #[test]
    fn email_with_missing_attachment_is_file_not_found() {
        let sender = EmailSender::new("TEMPOACTIVA", "tempo@example.com", "secreto");
        let err = sender
            .build_message("ana@example.com", "ANA", "", Path::new("/no/existe.docx"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::FileNotFound { .. }));
    }
}
