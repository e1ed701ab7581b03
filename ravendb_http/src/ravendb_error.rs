//! Error payloads sent back by the server.
use serde::Deserialize;

/// Body the server attaches to failed requests.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ServerErrorPayload {
    pub url: Option<String>,
    pub r#type: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl ServerErrorPayload {
    /// Builds a human readable message from an error body, falling back to the raw text when
    /// the body is not the usual JSON payload.
    pub fn describe(body: &[u8]) -> String {
        match serde_json::from_slice::<ServerErrorPayload>(body) {
            Ok(payload) => match (payload.r#type, payload.message) {
                (Some(kind), Some(message)) => format!("{}: {}", kind, message),
                (None, Some(message)) => message,
                (Some(kind), None) => kind,
                (None, None) => payload.error.unwrap_or_default(),
            },
            Err(_) => String::from_utf8_lossy(body).trim().to_string(),
        }
    }
}
