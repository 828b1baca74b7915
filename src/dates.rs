use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;

/// Canonical output shape for every date the pipeline touches.
const CANONICAL: &str = "%Y/%m/%d";

/// Date-and-time input shapes, tried before the date-only ones so a trailing
/// time-of-day does not break the parse.
const DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%Y/%m/%d"];

/// Normalize a date string to `YYYY/MM/DD`.
///
/// Formats are tried in a fixed priority order; if none matches the whole
/// string, an embedded `DD/MM/YYYY` substring is searched for. When nothing
/// parses the input is returned untouched — the document corpus has
/// inconsistent date formatting and a best-effort value beats an abort.
/// Callers log the miss.
pub fn normalize_date(date_str: &str) -> String {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return dt.format(CANONICAL).to_string();
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return d.format(CANONICAL).to_string();
        }
    }

    // Embedded date, e.g. "15/08/2025 - turno nocturno".
    let embedded = Regex::new(r"\b(\d{2}/\d{2}/\d{4})\b").expect("embedded date regex");
    if let Some(m) = embedded.find(trimmed) {
        if let Ok(d) = NaiveDate::parse_from_str(m.as_str(), "%d/%m/%Y") {
            return d.format(CANONICAL).to_string();
        }
    }

    date_str.to_string()
}

/// True when `normalize_date` actually produced the canonical shape.
pub fn is_canonical(value: &str) -> bool {
    NaiveDate::parse_from_str(value, CANONICAL).is_ok()
}
