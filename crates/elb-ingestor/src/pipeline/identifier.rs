//! Deterministic record identifiers
//!
//! The id is a SHA-256 digest over the record's content only, so the same log
//! line always maps to the same document no matter which file, process or
//! retry delivered it. Writing by id turns duplicate delivery into an
//! overwrite.

use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

use super::record::LogRecord;

const FIELD_SEPARATOR: u8 = 0x1f;
const RECORD_SEPARATOR: u8 = 0x1e;

/// 64 lowercase hex characters.
pub fn record_id(record: &LogRecord) -> String {
    let mut hasher = Sha256::new();

    hasher.update(
        record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .as_bytes(),
    );
    hasher.update([RECORD_SEPARATOR]);

    for (name, value) in &record.fields {
        hasher.update(name.as_bytes());
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(value.to_string().as_bytes());
        hasher.update([RECORD_SEPARATOR]);
    }

    if let Some(raw) = &record.raw_line {
        hasher.update(b"raw_line");
        hasher.update([FIELD_SEPARATOR]);
        hasher.update(raw.as_bytes());
    }

    hex::encode(hasher.finalize())
}
