//! Session export/import: a self-describing JSON document.
//!
//! `Session` already derives `Serialize`/`Deserialize` with field shapes
//! matching `spec.md` §6 ("Session export document") directly — `events`
//! ordered by insertion (via `BTreeMap` attributes and a `Vec` events
//! list), `frames` as base64 bodies, `footer` as aggregate counters. This
//! module is the thin export/parse entry point plus the recorder method.

use crate::recorder::{Session, SessionRecorder};

/// Errors from exporting or parsing a session document.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("JSON serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("JSON parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

impl SessionRecorder {
    /// Serialize the current snapshot to a JSON document. Can be called
    /// before or after sealing; callers that need the canonical immutable
    /// record should call this after `record_close`.
    pub fn export(&self) -> Result<String, ExportError> {
        export_session(&self.get_session())
    }
}

/// Serialize a [`Session`] to its JSON document form.
pub fn export_session(session: &Session) -> Result<String, ExportError> {
    serde_json::to_string_pretty(session).map_err(ExportError::Serialize)
}

/// Parse a JSON document back into a [`Session`].
///
/// `export -> parse` MUST yield an equivalent session: same event order,
/// same attribute values, same counters. Since `Session`'s field order is
/// preserved by `Vec`/`BTreeMap` and all timestamps round-trip through
/// `chrono`'s RFC 3339 serde impl, this is a direct `serde_json`
/// deserialize with no extra reconciliation step.
pub fn parse_session(json: &str) -> Result<Session, ExportError> {
    serde_json::from_str(json).map_err(ExportError::Parse)
}
