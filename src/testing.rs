//! In-process fakes shared by unit tests.

use crate::app::App;
use crate::config::Config;
use crate::credential::{
    Authority, AuthorityError, CredentialError, CredentialStore, Introspection,
};
use crate::handshake::BrowserLauncher;
use crate::models::{Credential, LocalId, NotionUser, StatusFilter, Task, TimeWindow};
use crate::relay::{RelayError, RelayMailbox, RelayMessage, Ticket};
use crate::task_store::{TaskStore, TaskStoreError};
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("task-reminder-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn sample_credential() -> Credential {
    Credential {
        access_token: "secret_token".to_string(),
        refresh_token: None,
        token_type: "bearer".to_string(),
        bot_id: "bot-1".to_string(),
        workspace_id: "ws1".to_string(),
        workspace_name: Some("Personal".to_string()),
        workspace_icon: None,
        database_id: Some("db1".to_string()),
        owner: Some(NotionUser {
            id: "user-1".to_string(),
            name: Some("Ada".to_string()),
            ..NotionUser::default()
        }),
        request_id: None,
    }
}

pub fn remote_task(remote_id: &str, content: &str, weight: u32) -> Task {
    let mut task = Task::new(content, weight);
    task.local_id = LocalId::from_remote(remote_id);
    task.remote_id = Some(remote_id.to_string());
    task
}

/// App wired to in-memory fakes, with a millisecond poll interval.
pub fn sample_app(
    stored: Option<Credential>,
    authority: ScriptedAuthority,
    mailbox: CountingMailbox,
    store: &ScriptedTaskStore,
) -> App {
    let mut config = Config::default();
    config.notion.client_id = "client-1".to_string();
    config.notion.poll_interval_ms = 2;
    config.notion.max_poll_attempts = 50;
    let store = store.clone();
    App::with_parts(
        config,
        Box::new(MemoryCredentialStore::new(stored)),
        Arc::new(authority),
        Arc::new(mailbox),
        Box::new(RecordingBrowser::default()),
        Box::new(move |_: &Credential| -> Arc<dyn TaskStore> { Arc::new(store.clone()) }),
    )
}

#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    slot: Arc<Mutex<Option<Credential>>>,
    failing: bool,
}

impl MemoryCredentialStore {
    pub fn new(initial: Option<Credential>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(initial)),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> Option<Credential> {
        self.slot.lock().expect("slot").clone()
    }

    fn check(&self) -> Result<(), CredentialError> {
        if self.failing {
            return Err(CredentialError::Io(io::Error::other("disk full")));
        }
        Ok(())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, CredentialError> {
        self.check()?;
        Ok(self.snapshot())
    }

    fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        self.check()?;
        *self.slot.lock().expect("slot") = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.check()?;
        *self.slot.lock().expect("slot") = None;
        Ok(())
    }
}

/// `None` makes every call fail as unreachable.
pub struct ScriptedAuthority {
    active: Option<bool>,
}

impl ScriptedAuthority {
    pub fn active(active: bool) -> Self {
        Self {
            active: Some(active),
        }
    }

    pub fn unreachable() -> Self {
        Self { active: None }
    }
}

impl Authority for ScriptedAuthority {
    fn introspect(&self, _access_token: &str) -> Result<Introspection, AuthorityError> {
        self.active
            .map(|active| Introspection { active })
            .ok_or_else(|| AuthorityError::Transport("connection refused".to_string()))
    }

    fn revoke(&self, _access_token: &str) -> Result<(), AuthorityError> {
        self.active
            .map(|_| ())
            .ok_or_else(|| AuthorityError::Transport("connection refused".to_string()))
    }
}

/// Relay fake: errors for the first `fail_first` polls, resolves from poll `resolve_at` on.
pub struct CountingMailbox {
    seen: Mutex<Vec<Ticket>>,
    fail_first: usize,
    resolve_at: Option<usize>,
    payload: Mutex<Option<Value>>,
}

impl CountingMailbox {
    pub fn never() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_first: 0,
            resolve_at: None,
            payload: Mutex::new(None),
        }
    }

    pub fn failing_then(failures: usize, payload: Value) -> Self {
        Self {
            fail_first: failures,
            resolve_at: Some(failures + 1),
            payload: Mutex::new(Some(payload)),
            ..Self::never()
        }
    }

    pub fn resolving_after(polls: usize, payload: Value) -> Self {
        Self {
            resolve_at: Some(polls.max(1)),
            payload: Mutex::new(Some(payload)),
            ..Self::never()
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().expect("seen").len()
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.seen.lock().expect("seen").clone()
    }
}

impl RelayMailbox for CountingMailbox {
    fn take(&self, ticket: &Ticket) -> Result<Option<RelayMessage>, RelayError> {
        let call = {
            let mut seen = self.seen.lock().expect("seen");
            seen.push(ticket.clone());
            seen.len()
        };
        if call <= self.fail_first {
            return Err(RelayError::Transport("relay unavailable".to_string()));
        }
        if self.resolve_at.is_some_and(|at| call >= at) {
            let payload = self.payload.lock().expect("payload").take();
            return Ok(payload.map(RelayMessage::from_consumed));
        }
        Ok(None)
    }
}

#[derive(Clone, Default)]
pub struct RecordingBrowser {
    opened: Arc<Mutex<Vec<String>>>,
    broken: bool,
}

impl RecordingBrowser {
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("opened").clone()
    }
}

impl BrowserLauncher for RecordingBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no browser"));
        }
        self.opened.lock().expect("opened").push(url.to_string());
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreCall {
    Create(Task),
    Update(Task),
    List(StatusFilter),
    Tags,
    SetTags(Vec<String>),
}

struct StoreState {
    calls: Vec<StoreCall>,
    paused: bool,
    next_id: u32,
    create_error: Option<TaskStoreError>,
    update_error: Option<TaskStoreError>,
    list: Result<Vec<Task>, TaskStoreError>,
    tags: Vec<String>,
}

/// Task store fake. `pause` holds creates and updates until `resume`.
#[derive(Clone)]
pub struct ScriptedTaskStore {
    state: Arc<(Mutex<StoreState>, Condvar)>,
}

impl ScriptedTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new((
                Mutex::new(StoreState {
                    calls: Vec::new(),
                    paused: false,
                    next_id: 1,
                    create_error: None,
                    update_error: None,
                    list: Ok(Vec::new()),
                    tags: Vec::new(),
                }),
                Condvar::new(),
            )),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.0.lock().expect("store state");
        f(&mut state)
    }

    pub fn fail_creates(&self, error: TaskStoreError) {
        self.with(|s| s.create_error = Some(error));
    }

    pub fn fail_updates(&self, error: TaskStoreError) {
        self.with(|s| s.update_error = Some(error));
    }

    pub fn set_list(&self, list: Result<Vec<Task>, TaskStoreError>) {
        self.with(|s| s.list = list);
    }

    pub fn set_tags(&self, tags: Vec<String>) {
        self.with(|s| s.tags = tags);
    }

    pub fn pause(&self) {
        self.with(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.with(|s| s.paused = false);
        self.state.1.notify_all();
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.with(|s| s.calls.clone())
    }

    pub fn wait_for_calls(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.calls().len() < count {
            assert!(Instant::now() < deadline, "store saw {:?}", self.calls());
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Records the call, then blocks while paused.
    fn mutation(&self, call: StoreCall) -> std::sync::MutexGuard<'_, StoreState> {
        let (lock, resumed) = &*self.state;
        let mut state = lock.lock().expect("store state");
        state.calls.push(call);
        while state.paused {
            state = resumed.wait(state).expect("store state");
        }
        state
    }
}

impl TaskStore for ScriptedTaskStore {
    fn create(&self, task: &Task) -> Result<String, TaskStoreError> {
        let mut state = self.mutation(StoreCall::Create(task.clone()));
        if let Some(error) = state.create_error.clone() {
            return Err(error);
        }
        let id = format!("page-{}", state.next_id);
        state.next_id += 1;
        Ok(id)
    }

    fn update(&self, task: &Task) -> Result<(), TaskStoreError> {
        let state = self.mutation(StoreCall::Update(task.clone()));
        match state.update_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn list(&self, _window: &TimeWindow, filter: StatusFilter) -> Result<Vec<Task>, TaskStoreError> {
        self.with(|s| {
            s.calls.push(StoreCall::List(filter));
            s.list.clone()
        })
    }

    fn tags(&self) -> Result<Vec<String>, TaskStoreError> {
        self.with(|s| {
            s.calls.push(StoreCall::Tags);
            Ok(s.tags.clone())
        })
    }

    fn set_tags(&self, tags: &[String]) -> Result<Vec<String>, TaskStoreError> {
        self.with(|s| {
            s.calls.push(StoreCall::SetTags(tags.to_vec()));
            s.tags = tags.to_vec();
            Ok(s.tags.clone())
        })
    }
}
