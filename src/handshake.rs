//! Browser-delegated Notion linking.
//!
//! `begin` opens the authorization page with a fresh ticket and starts a
//! poller thread that asks the relay for the result every interval, for a
//! bounded number of attempts. The owner applies poll results with `pump`
//! (non-blocking) or `wait` (blocking); credential persistence happens there.

use crate::broadcast::{AuthBroadcast, AuthSnapshot};
use crate::config::NotionConfig;
use crate::credential::CredentialGuard;
use crate::models::{AuthState, Credential};
use crate::relay::{RelayMailbox, RelayMessage, Ticket, TokenGrant};
use reqwest::Url;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Notion is already linked; log out before linking again.")]
    AlreadyLinked,
    #[error("Notion client_id required in config.toml")]
    MissingClientId,
    #[error("invalid authorization url: {0}")]
    Url(String),
    #[error("failed to open browser: {0}")]
    Browser(#[source] io::Error),
}

/// Opens a URL outside the process. Fire-and-forget.
pub trait BrowserLauncher: Send {
    fn open(&self, url: &str) -> io::Result<()>;
}

pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        open::that(url)
    }
}

#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    pub authorize_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl HandshakeConfig {
    pub fn from_notion(config: &NotionConfig) -> Self {
        Self {
            authorize_url: config.authorize_url.clone(),
            client_id: config.resolve_client_id(),
            redirect_uri: config.resolve_redirect_uri(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_attempts: config.max_poll_attempts.max(1),
        }
    }

    pub fn authorization_url(&self, ticket: &Ticket) -> Result<String, HandshakeError> {
        if self.client_id.trim().is_empty() {
            return Err(HandshakeError::MissingClientId);
        }
        Url::parse_with_params(
            &self.authorize_url,
            [
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("owner", "user"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("state", ticket.as_str()),
            ],
        )
        .map(|url| url.to_string())
        .map_err(|e| HandshakeError::Url(e.to_string()))
    }
}

enum PollEvent {
    Pending { attempt: u32 },
    Granted(Box<TokenGrant>),
    Denied(String),
    Exhausted { attempts: u32 },
}

/// Owned handle to the single polling loop.
struct Poller {
    ticket: Ticket,
    stop: Sender<()>,
    events: Receiver<PollEvent>,
    _worker: JoinHandle<()>,
}

impl Poller {
    fn spawn(mailbox: Arc<dyn RelayMailbox>, ticket: Ticket, interval: Duration, max_attempts: u32) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let worker_ticket = ticket.clone();
        let worker = thread::spawn(move || {
            run_poll_loop(
                mailbox.as_ref(),
                &worker_ticket,
                interval,
                max_attempts,
                &stop_rx,
                &event_tx,
            );
        });
        Self {
            ticket,
            stop: stop_tx,
            events: event_rx,
            _worker: worker,
        }
    }

    fn stop(self) {
        // The worker may be mid-request; its late result lands in a dropped channel.
        let _ = self.stop.send(());
        debug!(ticket = %self.ticket, "poller stopped");
    }
}

fn run_poll_loop(
    mailbox: &dyn RelayMailbox,
    ticket: &Ticket,
    interval: Duration,
    max_attempts: u32,
    stop: &Receiver<()>,
    events: &Sender<PollEvent>,
) {
    for attempt in 1..=max_attempts {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        let event = match mailbox.take(ticket) {
            Ok(Some(RelayMessage::Granted(grant))) => {
                let _ = events.send(PollEvent::Granted(grant));
                return;
            }
            Ok(Some(RelayMessage::Denied(reason))) => {
                let _ = events.send(PollEvent::Denied(reason));
                return;
            }
            Ok(None) => PollEvent::Pending { attempt },
            Err(err) => {
                warn!(attempt, "relay poll failed: {err}");
                PollEvent::Pending { attempt }
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(PollEvent::Exhausted {
        attempts: max_attempts,
    });
}

pub struct Handshake {
    config: HandshakeConfig,
    mailbox: Arc<dyn RelayMailbox>,
    browser: Box<dyn BrowserLauncher>,
    state: AuthState,
    poller: Option<Poller>,
    last_error: Option<String>,
    broadcast: AuthBroadcast,
}

impl Handshake {
    pub fn new(
        config: HandshakeConfig,
        mailbox: Arc<dyn RelayMailbox>,
        browser: Box<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            config,
            mailbox,
            browser,
            state: AuthState::NotStarted,
            poller: None,
            last_error: None,
            broadcast: AuthBroadcast::new(AuthSnapshot {
                state: AuthState::NotStarted,
                database_id: None,
            }),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn broadcast(&mut self) -> &mut AuthBroadcast {
        &mut self.broadcast
    }

    /// Seeds the state from a startup credential check.
    pub fn restore(&mut self, state: AuthState, credential: Option<&Credential>) {
        self.stop_poller();
        self.set_state(state, credential);
    }

    /// Starts a new linking attempt. A running attempt is superseded.
    pub fn begin(&mut self) -> Result<Ticket, HandshakeError> {
        if self.state == AuthState::Success {
            return Err(HandshakeError::AlreadyLinked);
        }
        self.stop_poller();

        let ticket = Ticket::mint();
        let url = self.config.authorization_url(&ticket)?;
        self.browser.open(&url).map_err(HandshakeError::Browser)?;

        self.poller = Some(Poller::spawn(
            Arc::clone(&self.mailbox),
            ticket.clone(),
            self.config.poll_interval,
            self.config.max_attempts,
        ));
        self.last_error = None;
        self.set_state(AuthState::Waiting, None);
        info!(
            attempts = self.config.max_attempts,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "waiting for Notion authorization"
        );
        Ok(ticket)
    }

    /// Abandons the running attempt. No-op when nothing is polling.
    pub fn cancel(&mut self) {
        if self.poller.is_none() {
            return;
        }
        self.stop_poller();
        self.set_state(AuthState::NotStarted, None);
        info!("Notion authorization cancelled");
    }

    /// Marks the linked credential unusable (expired or revoked remotely).
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.stop_poller();
        self.last_error = Some(reason.into());
        self.set_state(AuthState::Failed, None);
    }

    /// Resets to `not_started` after a logout.
    pub fn reset(&mut self) {
        self.stop_poller();
        self.last_error = None;
        self.set_state(AuthState::NotStarted, None);
    }

    /// Republishes the snapshot after the credential's database changed.
    pub fn credential_changed(&mut self, credential: Option<&Credential>) {
        self.publish(credential);
    }

    /// Applies every poll result received so far. Returns the new state on change.
    pub fn pump(&mut self, guard: &mut CredentialGuard) -> Option<AuthState> {
        let before = self.state;
        loop {
            let next = match self.poller.as_ref() {
                Some(poller) => poller.events.try_recv(),
                None => break,
            };
            match next {
                Ok(event) => self.apply(event, guard),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.worker_vanished(),
            }
        }
        (self.state != before).then_some(self.state)
    }

    /// Blocks until the running attempt resolves and returns the final state.
    pub fn wait(&mut self, guard: &mut CredentialGuard) -> AuthState {
        loop {
            let next = match self.poller.as_ref() {
                Some(poller) => poller.events.recv(),
                None => return self.state,
            };
            match next {
                Ok(event) => self.apply(event, guard),
                Err(_) => self.worker_vanished(),
            }
        }
    }

    fn apply(&mut self, event: PollEvent, guard: &mut CredentialGuard) {
        match event {
            PollEvent::Pending { attempt } => {
                debug!(attempt, max = self.config.max_attempts, "authorization pending");
            }
            PollEvent::Granted(grant) => {
                self.poller = None;
                let credential = Credential::from_grant(*grant);
                match guard.persist(credential) {
                    Ok(()) => {
                        self.last_error = None;
                        self.set_state(AuthState::Success, guard.current());
                        info!("Notion linked");
                    }
                    Err(err) => {
                        warn!("failed to persist credential: {err}");
                        self.last_error = Some(err.to_string());
                        self.set_state(AuthState::Failed, None);
                    }
                }
            }
            PollEvent::Denied(reason) => {
                self.poller = None;
                warn!("Notion authorization denied: {reason}");
                self.last_error = Some(format!("Authorization denied: {reason}"));
                self.set_state(AuthState::Failed, None);
            }
            PollEvent::Exhausted { attempts } => {
                self.poller = None;
                info!(attempts, "Notion authorization timed out");
                self.last_error = Some("Authorization timed out. Please retry.".to_string());
                self.set_state(AuthState::Failed, None);
            }
        }
    }

    fn worker_vanished(&mut self) {
        self.poller = None;
        self.last_error = Some("Authorization poller stopped unexpectedly.".to_string());
        self.set_state(AuthState::Failed, None);
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }

    fn set_state(&mut self, state: AuthState, credential: Option<&Credential>) {
        self.state = state;
        self.publish(credential);
    }

    fn publish(&mut self, credential: Option<&Credential>) {
        self.broadcast.publish(AuthSnapshot {
            state: self.state,
            database_id: credential.and_then(|c| c.database_id.clone()),
        });
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.stop_poller();
    }
}
