//! Error taxonomy shared by the backend bindings and the realtime core.

use serde::{Deserialize, Serialize};

/// Error body returned by PostgREST-style endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostgrestError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

/// Attempt to parse a PostgREST (or storage API) error body into a user-facing message.
/// Prefers `message`, falls back to `details`, then to a storage-style `error` field.
pub fn try_postgrest_detail(body: &str) -> Option<String> {
    if let Ok(parsed) = serde_json::from_str::<PostgrestError>(body) {
        if !parsed.message.trim().is_empty() {
            return Some(parsed.message);
        }
        if let Some(details) = parsed.details {
            if !details.trim().is_empty() {
                return Some(details);
            }
        }
    }
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.as_str())
        .filter(|e| !e.trim().is_empty())
        .map(str::to_string)
}

/// Failure talking to the backend collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("decode error: {0}")]
    Deserialize(String),
    #[error("timed out after {0}ms")]
    Timeout(u64),
    #[error("channel closed: {0}")]
    Closed(String),
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Human-readable detail, unwrapping PostgREST error bodies when present.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Http { body, .. } => {
                try_postgrest_detail(body).unwrap_or_else(|| self.to_string())
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Deserialize(err.to_string())
    }
}

/// A change-feed payload that could not be turned into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("unknown event kind `{0}`")]
    UnknownEventKind(String),
    #[error("{kind} on `{table}` is missing its row")]
    MissingRow { table: String, kind: String },
    #[error("malformed `{table}` row: {reason}")]
    MalformedRow { table: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgrest_detail_prefers_message() {
        let body = r#"{"code":"42501","message":"new row violates row-level security policy","details":null,"hint":null}"#;
        assert_eq!(
            try_postgrest_detail(body).as_deref(),
            Some("new row violates row-level security policy")
        );
    }

    #[test]
    fn storage_error_body() {
        assert_eq!(
            try_postgrest_detail(r#"{"statusCode":"413","error":"Payload too large"}"#).as_deref(),
            Some("Payload too large")
        );
        assert_eq!(try_postgrest_detail("<html>"), None);
    }

    #[test]
    fn user_message_falls_back_to_display() {
        let err = BackendError::Http {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(err.user_message(), "HTTP 502: bad gateway");
    }
}
