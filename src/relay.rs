//! One-time mailbox between the OAuth redirect handler and the polling client.
//!
//! The redirect handler writes the provider's result under the handshake
//! ticket; the client reads it once and the entry is deleted in the same step,
//! so a ticket yields at most one successful read.

use crate::models::NotionUser;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

const TICKET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Transport(String),
    #[error("relay payload malformed: {0}")]
    Malformed(String),
    #[error("authorization failed: {0}")]
    Exchange(String),
    #[error("relay storage unavailable")]
    Poisoned,
}

/// Single-use correlation token for one browser-delegated authorization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ticket(String);

impl Ticket {
    /// 32 alphanumeric characters from the thread-local CSPRNG (~190 bits).
    pub fn mint() -> Self {
        let value = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TICKET_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantOwner {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub user: Option<NotionUser>,
}

/// Token endpoint response as written into the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub workspace_icon: Option<String>,
    #[serde(default)]
    pub duplicated_template_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub owner: GrantOwner,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Clone, Debug, PartialEq)]
pub enum RelayMessage {
    Granted(Box<TokenGrant>),
    /// The provider refused the authorization (user denied, bad code).
    Denied(String),
}

impl RelayMessage {
    pub fn from_payload(payload: Value) -> Result<Self, RelayError> {
        if payload.get("access_token").is_some() {
            let grant: TokenGrant = serde_json::from_value(payload)
                .map_err(|e| RelayError::Malformed(e.to_string()))?;
            return Ok(RelayMessage::Granted(Box::new(grant)));
        }
        match payload.get("error") {
            Some(Value::String(reason)) => Ok(RelayMessage::Denied(reason.clone())),
            Some(other) => Ok(RelayMessage::Denied(other.to_string())),
            None => Err(RelayError::Malformed(
                "payload has neither access_token nor error".to_string(),
            )),
        }
    }

    /// Parses a payload whose relay entry is already deleted. An unreadable
    /// payload cannot be read again, so it ends the attempt as a denial.
    pub fn from_consumed(payload: Value) -> Self {
        Self::from_payload(payload).unwrap_or_else(|err| {
            warn!("consumed relay entry is unreadable: {err}");
            RelayMessage::Denied(format!("unreadable authorization result ({err})"))
        })
    }
}

/// Client side of the mailbox: read-then-delete.
pub trait RelayMailbox: Send + Sync {
    fn take(&self, ticket: &Ticket) -> Result<Option<RelayMessage>, RelayError>;
}

/// Server side of the mailbox, keyed by ticket.
pub trait RelayStore: Send + Sync {
    fn put(&self, ticket: &Ticket, payload: Value) -> Result<(), RelayError>;
    fn get(&self, ticket: &Ticket) -> Result<Option<Value>, RelayError>;
    fn delete(&self, ticket: &Ticket) -> Result<(), RelayError>;
}

impl<T: RelayStore> RelayMailbox for T {
    fn take(&self, ticket: &Ticket) -> Result<Option<RelayMessage>, RelayError> {
        let Some(payload) = self.get(ticket)? else {
            return Ok(None);
        };
        self.delete(ticket)?;
        Ok(Some(RelayMessage::from_consumed(payload)))
    }
}

#[derive(Default)]
pub struct MemoryRelay {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RelayStore for MemoryRelay {
    fn put(&self, ticket: &Ticket, payload: Value) -> Result<(), RelayError> {
        let mut entries = self.entries.lock().map_err(|_| RelayError::Poisoned)?;
        entries.insert(ticket.as_str().to_string(), payload);
        Ok(())
    }

    fn get(&self, ticket: &Ticket) -> Result<Option<Value>, RelayError> {
        let entries = self.entries.lock().map_err(|_| RelayError::Poisoned)?;
        Ok(entries.get(ticket.as_str()).cloned())
    }

    fn delete(&self, ticket: &Ticket) -> Result<(), RelayError> {
        let mut entries = self.entries.lock().map_err(|_| RelayError::Poisoned)?;
        entries.remove(ticket.as_str());
        Ok(())
    }
}

/// Exchanges an authorization code for the provider's raw token payload.
pub trait CodeExchanger: Send + Sync {
    fn exchange(&self, code: &str) -> Result<Value, RelayError>;
}

/// Query parameters the provider appends to the redirect URI.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RedirectParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Redirect handler: exchange the code and file the result under the ticket.
///
/// Provider errors are written to the relay too, so the waiting client can
/// fail fast instead of exhausting its poll budget.
pub fn handle_redirect(
    exchanger: &dyn CodeExchanger,
    relay: &dyn RelayStore,
    params: &RedirectParams,
) -> Result<TokenGrant, RelayError> {
    let ticket = params
        .state
        .as_deref()
        .filter(|state| !state.is_empty())
        .map(Ticket::from_raw);

    if let Some(error) = params.error.as_deref() {
        if let Some(ticket) = &ticket {
            relay.put(ticket, serde_json::json!({ "error": error }))?;
        }
        return Err(RelayError::Exchange(error.to_string()));
    }

    let Some(code) = params.code.as_deref().filter(|code| !code.is_empty()) else {
        return Err(RelayError::Exchange("no code provided".to_string()));
    };

    let payload = match exchanger.exchange(code) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("token exchange failed: {err}");
            if let Some(ticket) = &ticket {
                relay.put(ticket, serde_json::json!({ "error": err.to_string() }))?;
            }
            return Err(err);
        }
    };

    let grant: TokenGrant = serde_json::from_value(payload.clone())
        .map_err(|e| RelayError::Malformed(e.to_string()))?;
    if let Some(ticket) = &ticket {
        relay.put(ticket, payload)?;
        info!(workspace = ?grant.workspace_name, "authorization filed under ticket");
    }
    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn grant_payload() -> Value {
        json!({
            "access_token": "secret_abc",
            "token_type": "bearer",
            "bot_id": "bot-1",
            "workspace_id": "ws-1",
            "workspace_name": "Home",
            "duplicated_template_id": "db-1",
            "owner": { "type": "user", "user": { "id": "u-1", "name": "Ada" } }
        })
    }

    struct FixedExchanger(Result<Value, String>);

    impl CodeExchanger for FixedExchanger {
        fn exchange(&self, _code: &str) -> Result<Value, RelayError> {
            self.0.clone().map_err(RelayError::Exchange)
        }
    }

    #[test]
    fn minted_tickets_are_distinct() {
        let tickets: HashSet<Ticket> = (0..1000).map(|_| Ticket::mint()).collect();
        assert_eq!(tickets.len(), 1000);
        assert!(tickets.iter().all(|t| t.as_str().len() == TICKET_LEN));
    }

    #[test]
    fn take_consumes_the_entry_once() {
        let relay = MemoryRelay::new();
        let ticket = Ticket::mint();
        relay.put(&ticket, grant_payload()).expect("put");

        let first = relay.take(&ticket).expect("take");
        assert!(matches!(first, Some(RelayMessage::Granted(_))));
        assert!(relay.take(&ticket).expect("second take").is_none());
        assert!(relay.is_empty());
    }

    #[test]
    fn unreadable_entry_is_consumed_as_denial() {
        let relay = MemoryRelay::new();
        let ticket = Ticket::mint();
        relay.put(&ticket, json!({ "status": "weird" })).expect("put");

        let message = relay.take(&ticket).expect("take");
        assert!(matches!(message, Some(RelayMessage::Denied(reason)) if reason.contains("unreadable")));
        assert!(relay.is_empty());
    }

    #[test]
    fn unknown_ticket_is_unresolved() {
        let relay = MemoryRelay::new();
        assert!(relay.take(&Ticket::mint()).expect("take").is_none());
    }

    #[test]
    fn error_payload_is_denied() {
        let message = RelayMessage::from_payload(json!({ "error": "access_denied" }))
            .expect("parse");
        assert_eq!(message, RelayMessage::Denied("access_denied".to_string()));
    }

    #[test]
    fn grant_parses_optional_fields() {
        let Ok(RelayMessage::Granted(grant)) = RelayMessage::from_payload(grant_payload()) else {
            panic!("expected grant");
        };
        assert_eq!(grant.duplicated_template_id.as_deref(), Some("db-1"));
        assert_eq!(
            grant.owner.user.and_then(|user| user.name).as_deref(),
            Some("Ada")
        );
        assert!(grant.refresh_token.is_none());
    }

    #[test]
    fn redirect_files_grant_under_state() {
        let relay = MemoryRelay::new();
        let params = RedirectParams {
            code: Some("code-1".to_string()),
            state: Some("ticket-1".to_string()),
            error: None,
        };
        let grant = handle_redirect(&FixedExchanger(Ok(grant_payload())), &relay, &params)
            .expect("redirect");
        assert_eq!(grant.bot_id, "bot-1");
        assert!(relay.get(&Ticket::from_raw("ticket-1")).expect("get").is_some());
    }

    #[test]
    fn redirect_error_is_relayed_as_denial() {
        let relay = MemoryRelay::new();
        let params = RedirectParams {
            code: None,
            state: Some("ticket-2".to_string()),
            error: Some("access_denied".to_string()),
        };
        assert!(handle_redirect(&FixedExchanger(Ok(grant_payload())), &relay, &params).is_err());
        let message = relay.take(&Ticket::from_raw("ticket-2")).expect("take");
        assert_eq!(message, Some(RelayMessage::Denied("access_denied".to_string())));
    }

    #[test]
    fn redirect_without_code_writes_nothing() {
        let relay = MemoryRelay::new();
        let params = RedirectParams {
            code: None,
            state: Some("ticket-3".to_string()),
            error: None,
        };
        assert!(handle_redirect(&FixedExchanger(Ok(grant_payload())), &relay, &params).is_err());
        assert!(relay.is_empty());
    }
}
