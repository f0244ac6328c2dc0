//! Desktop client of the companion portal, which hosts the relay and proxies
//! introspection and revocation so the client secret stays server-side.

use super::http_client;
use super::oauth::parse_introspection;
use crate::config::NotionConfig;
use crate::credential::{Authority, AuthorityError, Introspection};
use crate::relay::{RelayError, RelayMailbox, RelayMessage, Ticket};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub struct PortalClient {
    client: Client,
    server_url: String,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct PortalResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl PortalClient {
    pub fn from_config(config: &NotionConfig) -> Self {
        Self {
            client: http_client(config.request_timeout_seconds),
            server_url: config.server_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/notion/{path}", self.server_url)
    }

    fn post_token(&self, path: &str, token: &str) -> Result<PortalResponse, AuthorityError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(&TokenBody { token })
            .send()
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AuthorityError::Status(resp.status().as_u16()));
        }
        resp.json()
            .map_err(|e| AuthorityError::Malformed(e.to_string()))
    }
}

impl RelayMailbox for PortalClient {
    /// The portal deletes the entry as it answers.
    fn take(&self, ticket: &Ticket) -> Result<Option<RelayMessage>, RelayError> {
        let resp = self
            .client
            .get(self.url("status"))
            .query(&[("state", ticket.as_str())])
            .send()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            debug!("relay has no entry yet");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RelayError::Transport(format!("HTTP {status}")));
        }
        let body: PortalResponse = resp
            .json()
            .map_err(|e| RelayError::Malformed(e.to_string()))?;
        parse_status(body)
    }
}

fn parse_status(body: PortalResponse) -> Result<Option<RelayMessage>, RelayError> {
    match (body.status.as_deref(), body.data) {
        (Some("success"), Some(data)) => Ok(Some(RelayMessage::from_consumed(data))),
        (_, None) => Ok(None),
        (other, Some(_)) => Err(RelayError::Malformed(format!(
            "unexpected relay status {other:?}"
        ))),
    }
}

impl Authority for PortalClient {
    fn introspect(&self, access_token: &str) -> Result<Introspection, AuthorityError> {
        let body = self.post_token("introspect", access_token)?;
        match (body.status.as_deref(), body.data) {
            (Some("success"), Some(data)) => parse_introspection(&data),
            (status, _) => Err(AuthorityError::Malformed(format!(
                "introspection answered {status:?}"
            ))),
        }
    }

    fn revoke(&self, access_token: &str) -> Result<(), AuthorityError> {
        let body = self.post_token("revoke", access_token)?;
        match body.status.as_deref() {
            Some("success") => Ok(()),
            other => Err(AuthorityError::Malformed(format!("revoke answered {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: Value) -> PortalResponse {
        serde_json::from_value(value).expect("response")
    }

    #[test]
    fn success_with_grant_is_granted() {
        let message = parse_status(response(json!({
            "status": "success",
            "data": { "access_token": "t", "bot_id": "b" }
        })))
        .expect("parse");
        assert!(matches!(message, Some(RelayMessage::Granted(_))));
    }

    #[test]
    fn success_with_provider_error_is_denied() {
        let message = parse_status(response(json!({
            "status": "success",
            "data": { "error": "access_denied" }
        })))
        .expect("parse");
        assert_eq!(message, Some(RelayMessage::Denied("access_denied".to_string())));
    }

    #[test]
    fn unreadable_grant_ends_the_attempt() {
        let message = parse_status(response(json!({
            "status": "success",
            "data": { "token": "t" }
        })))
        .expect("parse");
        assert!(matches!(message, Some(RelayMessage::Denied(_))));
    }

    #[test]
    fn missing_data_is_pending() {
        let message = parse_status(response(json!({ "error": "No token data" }))).expect("parse");
        assert!(message.is_none());
    }

    #[test]
    fn urls_hang_off_server() {
        let config = NotionConfig {
            server_url: "https://portal.example/".to_string(),
            ..NotionConfig::default()
        };
        let portal = PortalClient::from_config(&config);
        assert_eq!(portal.url("status"), "https://portal.example/api/notion/status");
    }
}
