//! Notion OAuth endpoints called with the integration's client secret.
//! Used by the redirect handler side; desktop installs go through the portal.

use super::{format_http_error, http_client};
use crate::config::NotionConfig;
use crate::credential::{Authority, AuthorityError, Introspection};
use crate::relay::{CodeExchanger, RelayError};
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use serde_json::Value;

pub struct NotionOAuth {
    client: Client,
    api_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

impl NotionOAuth {
    pub fn from_config(config: &NotionConfig) -> Self {
        Self {
            client: http_client(config.request_timeout_seconds),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: config.resolve_client_id(),
            client_secret: config.resolve_client_secret(),
            redirect_uri: config.resolve_redirect_uri(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/v1/oauth/{name}", self.api_url)
    }

    fn post_token(&self, name: &str, token: &str) -> Result<Response, AuthorityError> {
        let resp = self
            .client
            .post(self.endpoint(name))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .json(&TokenBody { token })
            .send()
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AuthorityError::Status(resp.status().as_u16()));
        }
        Ok(resp)
    }
}

impl CodeExchanger for NotionOAuth {
    fn exchange(&self, code: &str) -> Result<Value, RelayError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(RelayError::Exchange(
                "Notion client_id/client_secret required in config.toml".to_string(),
            ));
        }
        let resp = self
            .client
            .post(self.endpoint("token"))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .json(&TokenRequest {
                grant_type: "authorization_code",
                code,
                redirect_uri: &self.redirect_uri,
            })
            .send()
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(RelayError::Exchange(format_http_error(status, &body)));
        }
        resp.json()
            .map_err(|e| RelayError::Malformed(e.to_string()))
    }
}

impl Authority for NotionOAuth {
    fn introspect(&self, access_token: &str) -> Result<Introspection, AuthorityError> {
        let body: Value = self
            .post_token("introspect", access_token)?
            .json()
            .map_err(|e| AuthorityError::Malformed(e.to_string()))?;
        parse_introspection(&body)
    }

    fn revoke(&self, access_token: &str) -> Result<(), AuthorityError> {
        self.post_token("revoke", access_token)?;
        Ok(())
    }
}

pub(crate) fn parse_introspection(body: &Value) -> Result<Introspection, AuthorityError> {
    body.get("active")
        .and_then(Value::as_bool)
        .map(|active| Introspection { active })
        .ok_or_else(|| AuthorityError::Malformed(format!("no active flag in {body}")))
}
