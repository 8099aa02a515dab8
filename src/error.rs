use thiserror::Error;

use crate::extract::ExtractionError;

/// Upstream bodies are echoed to clients; keep them short.
const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum SiftError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend returned {status}: {body}")]
    BackendProtocol { status: u16, body: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for SiftError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(0);
        }
        if e.is_connect() {
            return Self::BackendUnavailable(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::BackendProtocol {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        // Body/decode failures mid-flight: the backend went away.
        Self::BackendUnavailable(e.to_string())
    }
}

impl SiftError {
    /// HTTP status the entry point answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Extraction(e) => e.http_status(),
            Self::BackendUnavailable(_) => 503,
            Self::BackendProtocol { .. } | Self::SchemaParse(_) => 502,
            Self::Timeout(_) => 504,
            Self::Other(_) => 500,
        }
    }

    /// Stable snake_case reason, used in error bodies and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Extraction(e) => e.code(),
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendProtocol { .. } => "backend_protocol_error",
            Self::Timeout(_) => "timeout",
            Self::SchemaParse(_) => "parse_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// Message safe to hand back to HTTP clients. Does not leak the backend URL
    /// or transport internals; upstream bodies are kept but capped.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Extraction(e) => e.to_string(),
            Self::BackendUnavailable(_) => {
                "completion backend is not reachable (is ollama running?)".to_string()
            }
            Self::BackendProtocol { status, body } => {
                let preview: String = body.chars().take(MAX_DETAIL_CHARS).collect();
                let suffix = if preview.len() < body.len() { "..." } else { "" };
                format!("backend error {status}: {preview}{suffix}")
            }
            Self::Timeout(ms) if *ms > 0 => format!("backend call timed out after {ms}ms"),
            Self::Timeout(_) => "backend call timed out".to_string(),
            Self::SchemaParse(_) => "failed to parse backend response".to_string(),
            Self::Other(_) => "internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(SiftError::Validation("x".into()).http_status(), 400);
        assert_eq!(SiftError::BackendUnavailable("x".into()).http_status(), 503);
        let proto = SiftError::BackendProtocol {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(proto.http_status(), 502);
        assert_eq!(SiftError::Timeout(10).http_status(), 504);
        assert_eq!(
            SiftError::Extraction(ExtractionError::Empty).http_status(),
            400
        );
    }

    #[test]
    fn protocol_message_keeps_upstream_body() {
        let e = SiftError::BackendProtocol {
            status: 404,
            body: "model 'phi9' not found".into(),
        };
        assert_eq!(e.user_message(), "backend error 404: model 'phi9' not found");
    }

    #[test]
    fn protocol_message_caps_long_bodies() {
        let e = SiftError::BackendProtocol {
            status: 500,
            body: "x".repeat(2000),
        };
        let msg = e.user_message();
        assert!(msg.ends_with("..."));
        assert!(msg.len() < 600, "message should be capped: {}", msg.len());
    }

    #[test]
    fn unavailable_message_hides_transport_detail() {
        let e = SiftError::BackendUnavailable("tcp connect error: 127.0.0.1:11434".into());
        assert!(!e.user_message().contains("127.0.0.1"));
    }
}
