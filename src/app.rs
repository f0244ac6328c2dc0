use crate::config::Config;
use crate::credential::{
    Authority, CredentialError, CredentialGuard, CredentialStore, FileCredentialStore, LoadOutcome,
};
use crate::handshake::{BrowserLauncher, Handshake, HandshakeConfig, HandshakeError, SystemBrowser};
use crate::integrations::notion::NotionTaskStore;
use crate::integrations::portal::PortalClient;
use crate::models::{AuthState, Credential, LocalId, StatusFilter, Task, TaskStatus, ViewKind};
use crate::relay::RelayMailbox;
use crate::sync::{SyncEngine, SyncError};
use crate::task_store::TaskStore;
use chrono::{DateTime, Duration, Local, NaiveDate};
use std::sync::Arc;
use tracing::info;

const TOAST_SECONDS: i64 = 3;
const NOTION_WEB_URL: &str = "https://www.notion.so";

/// Builds the remote task store for a linked credential.
pub type StoreFactory = Box<dyn Fn(&Credential) -> Arc<dyn TaskStore>>;

pub struct App {
    pub config: Config,
    pub guard: CredentialGuard,
    pub handshake: Handshake,
    pub engine: Option<SyncEngine>,
    store_factory: StoreFactory,

    pub view: ViewKind,
    pub filter: StatusFilter,
    pub active_date: NaiveDate,

    pub toast_message: Option<String>,
    pub toast_expiry: Option<DateTime<Local>>,
}

impl App {
    pub fn new(config: Config) -> App {
        let portal = Arc::new(PortalClient::from_config(&config.notion));
        let authority: Arc<dyn Authority> = portal.clone();
        let mailbox: Arc<dyn RelayMailbox> = portal;
        let store = FileCredentialStore::new(config.data.credential_path.clone());
        let notion = config.notion.clone();
        App::with_parts(
            config,
            Box::new(store),
            authority,
            mailbox,
            Box::new(SystemBrowser),
            Box::new(move |credential: &Credential| -> Arc<dyn TaskStore> {
                Arc::new(NotionTaskStore::new(&notion, credential))
            }),
        )
    }

    pub fn with_parts(
        config: Config,
        credentials: Box<dyn CredentialStore>,
        authority: Arc<dyn Authority>,
        mailbox: Arc<dyn RelayMailbox>,
        browser: Box<dyn BrowserLauncher>,
        store_factory: StoreFactory,
    ) -> App {
        let handshake = Handshake::new(HandshakeConfig::from_notion(&config.notion), mailbox, browser);
        App {
            guard: CredentialGuard::new(credentials, authority),
            handshake,
            engine: None,
            store_factory,
            view: ViewKind::default(),
            filter: StatusFilter::default(),
            active_date: Local::now().date_naive(),
            toast_message: None,
            toast_expiry: None,
            config,
        }
    }

    /// Loads and validates the stored credential, then opens the task list if linked.
    pub fn start(&mut self) -> AuthState {
        let outcome = self.guard.load();
        let state = outcome.auth_state();
        self.handshake.restore(state, self.guard.current());
        match outcome {
            LoadOutcome::Valid(_) => self.open_engine(),
            LoadOutcome::Invalid(_) => {
                self.toast("Notion session expired. Please log in again.");
            }
            LoadOutcome::Absent => {}
        }
        info!(state = %state, "startup auth state");
        state
    }

    pub fn auth_state(&self) -> AuthState {
        self.handshake.state()
    }

    pub fn login(&mut self) -> Result<(), HandshakeError> {
        match self.handshake.begin() {
            Ok(_) => {
                self.toast("Waiting for Notion authorization in the browser...");
                Ok(())
            }
            Err(err) => {
                self.toast(err.to_string());
                Err(err)
            }
        }
    }

    pub fn cancel_login(&mut self) {
        self.handshake.cancel();
    }

    /// Local state is dropped only after the remote revoke succeeds.
    pub fn logout(&mut self) -> Result<(), CredentialError> {
        if let Err(err) = self.guard.revoke_and_clear() {
            self.toast(err.to_string());
            return Err(err);
        }
        self.engine = None;
        self.handshake.reset();
        self.toast("Logged out of Notion.");
        Ok(())
    }

    pub fn select_database(&mut self, database_id: &str) -> Result<(), CredentialError> {
        self.guard.select_database(database_id)?;
        self.handshake.credential_changed(self.guard.current());
        if self.auth_state() == AuthState::Success {
            self.open_engine();
        }
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        self.engine.as_ref().map(SyncEngine::tasks).unwrap_or_default()
    }

    pub fn add_task(&mut self, content: &str) -> Option<LocalId> {
        let content = content.trim();
        if content.is_empty() {
            return None;
        }
        self.engine.as_mut().map(|engine| engine.add(content))
    }

    pub fn update_task(&mut self, local_id: &LocalId, task: Task) -> Result<(), SyncError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(SyncError::NotFound(local_id.clone()));
        };
        engine.update(local_id, task)
    }

    pub fn complete_task(&mut self, local_id: &LocalId) -> Result<(), SyncError> {
        let Some(mut task) = self
            .engine
            .as_ref()
            .and_then(|engine| engine.task(local_id))
            .cloned()
        else {
            return Err(SyncError::NotFound(local_id.clone()));
        };
        task.status = TaskStatus::Done;
        self.update_task(local_id, task)
    }

    pub fn change_view(&mut self, view: ViewKind, filter: StatusFilter) {
        self.view = view;
        self.filter = filter;
        self.refresh();
    }

    pub fn refresh(&mut self) {
        let window = self.view.window(self.active_date);
        if let Some(engine) = self.engine.as_mut() {
            engine.load(window, self.filter);
        }
    }

    /// Link to the linked workspace (and task database when selected).
    pub fn workspace_url(&self) -> Option<String> {
        let credential = self.guard.current()?;
        let mut url = NOTION_WEB_URL.to_string();
        if !credential.workspace_id.is_empty() {
            url.push('/');
            url.push_str(&credential.workspace_id);
        }
        if let Some(database_id) = credential.database_id.as_deref() {
            url.push('/');
            url.push_str(database_id);
        }
        Some(url)
    }

    /// True while a handshake poll or a remote task call is outstanding.
    pub fn is_busy(&self) -> bool {
        self.handshake.is_polling() || self.engine.as_ref().is_some_and(|engine| !engine.is_idle())
    }

    pub fn toast(&mut self, message: impl Into<String>) {
        self.toast_message = Some(message.into());
        self.toast_expiry = Some(Local::now() + Duration::seconds(TOAST_SECONDS));
    }

    pub(crate) fn close_engine(&mut self) {
        self.engine = None;
    }

    pub(crate) fn open_engine(&mut self) {
        let store = match self.guard.current() {
            Some(credential) if credential.is_configured() => (self.store_factory)(credential),
            _ => {
                self.engine = None;
                self.toast("Select a Notion database to store tasks.");
                return;
            }
        };
        let mut engine = SyncEngine::new(store);
        engine.load(self.view.window(self.active_date), self.filter);
        engine.refresh_tags();
        self.engine = Some(engine);
    }
}
