//! Certificate issuance fields, certificate numbers and persisted records.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use uuid::Uuid;

use super::error::DomainError;

/// Prefix used when the deployment does not configure one.
pub const DEFAULT_NUMBER_PREFIX: &str = "CERT";

const SUFFIX_LEN: usize = 10;
const SUFFIX_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const MAX_NUMBER_LEN: usize = 64;
const MAX_FIELD_CHARS: usize = 200;
const ISSUE_DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[month repr:long] [day padding:none], [year]");

/// Validated subject data merged into a certificate template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateFields {
    pub subject_name: String,
    pub subject_label: String,
    pub issue_date: String,
}

impl CertificateFields {
    /// Trim and validate raw input. A blank `issue_date` falls back to `today`
    /// rendered as e.g. `January 5, 2024`.
    pub fn new(
        subject_name: &str,
        subject_label: &str,
        issue_date: Option<&str>,
        today: OffsetDateTime,
    ) -> Result<Self, DomainError> {
        let subject_name = required("name", subject_name)?;
        let subject_label = required("course", subject_label)?;

        let issue_date = match issue_date.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => bounded("date", value)?,
            None => issue_date_label(today),
        };

        Ok(Self {
            subject_name,
            subject_label,
            issue_date,
        })
    }
}

pub(crate) fn required(field: &'static str, raw: &str) -> Result<String, DomainError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(field, "must not be empty"));
    }
    bounded(field, trimmed)
}

pub(crate) fn bounded(field: &'static str, value: &str) -> Result<String, DomainError> {
    if value.chars().count() > MAX_FIELD_CHARS {
        return Err(DomainError::validation(
            field,
            format!("must be at most {MAX_FIELD_CHARS} characters"),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(DomainError::validation(
            field,
            "must not contain control characters",
        ));
    }
    Ok(value.to_string())
}

/// Human readable issue date, e.g. `January 5, 2024`.
pub fn issue_date_label(timestamp: OffsetDateTime) -> String {
    timestamp
        .date()
        .format(ISSUE_DATE_FORMAT)
        .unwrap_or_else(|_| timestamp.date().to_string())
}

/// Collision-resistant, human-legible identifier for one issued certificate.
///
/// Shape: `PREFIX-<unix millis>-<random base36>`, uppercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateNumber(String);

impl CertificateNumber {
    /// Mint a fresh number from the wall clock and the thread-local RNG.
    pub fn generate(prefix: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();

        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();

        Self(format!("{prefix}-{millis}-{suffix}").to_uppercase())
    }

    /// Accept an externally supplied number (e.g. a URL segment). Only ASCII
    /// alphanumerics and `-` are allowed, so the value is always safe to use
    /// as a file stem.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let trimmed = input.trim();
        let well_formed = !trimmed.is_empty()
            && trimmed.len() <= MAX_NUMBER_LEN
            && !trimmed.starts_with('-')
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-');

        if !well_formed {
            return Err(DomainError::MalformedIdentifier {
                input: input.to_string(),
            });
        }

        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used both on disk and in `Content-Disposition`.
    pub fn file_name(&self) -> String {
        format!("{}.pdf", self.0)
    }
}

impl fmt::Display for CertificateNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Certificate row as kept by the record store.
///
/// `artifact_path` is advisory: storage is ephemeral, so readers must
/// re-check the file before trusting it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub subject_name: String,
    pub course_name: String,
    pub certificate_number: CertificateNumber,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(skip)]
    pub artifact_path: PathBuf,
}
