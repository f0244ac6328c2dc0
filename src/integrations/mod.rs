pub mod notion;
pub mod oauth;
pub mod portal;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const MAX_ERROR_LEN: usize = 240;

pub(crate) fn http_client(timeout_seconds: u64) -> Client {
    let mut builder = Client::builder();
    if timeout_seconds > 0 {
        builder = builder.timeout(Duration::from_secs(timeout_seconds));
    }
    builder.build().unwrap_or_else(|e| {
        warn!("falling back to default HTTP client: {e}");
        Client::new()
    })
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// `HTTP <status>: <summary>` from whatever error shape the body carries.
pub(crate) fn format_http_error(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {}", status);
    }

    let summary = match serde_json::from_str::<ErrorBody>(trimmed) {
        Ok(err) => {
            let label = err
                .code
                .or_else(|| match err.error {
                    Some(serde_json::Value::String(s)) => Some(s),
                    Some(other) => Some(other.to_string()),
                    None => None,
                })
                .unwrap_or_default();
            match err.message.or(err.error_description) {
                Some(detail) if !label.is_empty() => format!("{} ({})", detail, label),
                Some(detail) => detail,
                None if !label.is_empty() => label,
                None => truncate_error(trimmed),
            }
        }
        Err(_) => truncate_error(trimmed),
    };
    format!("HTTP {}: {}", status, summary)
}

fn truncate_error(message: &str) -> String {
    let mut out = message.replace(['\n', '\r'], " ");
    if out.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push_str("...");
    }
    out
}
