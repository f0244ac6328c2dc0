//! Optimistic, local-first task list reconciled with the remote task store.
//!
//! Every mutation is applied to the in-memory list immediately and sent to the
//! store on a worker thread. Per task at most one remote call is in flight;
//! later mutations queue behind it. A failed call restores the last value the
//! store confirmed (or removes a task that was never created) and drops the
//! mutations queued behind it.

use crate::models::{LocalId, StatusFilter, Task, TimeWindow, local_now};
use crate::task_store::{TaskStore, TaskStoreError};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

const FIRST_TASK_WEIGHT: u32 = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("task {0} not found")]
    NotFound(LocalId),
    #[error("task {0} is already done and cannot be reopened")]
    Reopen(LocalId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Created {
        local_id: LocalId,
        remote_id: String,
    },
    Updated {
        local_id: LocalId,
    },
    RolledBack {
        local_id: LocalId,
        error: TaskStoreError,
        /// Queued mutations dropped along with the failed one.
        discarded: usize,
    },
    Loaded {
        count: usize,
    },
    LoadFailed(TaskStoreError),
    TagsLoaded(Vec<String>),
    TagsFailed(TaskStoreError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DaySummary {
    pub done: usize,
    pub open: usize,
}

struct MutationQueue {
    /// Last value the store accepted; `None` until the first create succeeds.
    confirmed: Option<Task>,
    in_flight: Option<Task>,
    waiting: VecDeque<Task>,
}

impl MutationQueue {
    fn new(confirmed: Option<Task>) -> Self {
        Self {
            confirmed,
            in_flight: None,
            waiting: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }

    /// Newest local value; matches the task in the list while it is visible.
    fn latest(&self) -> Option<&Task> {
        self.waiting.back().or(self.in_flight.as_ref())
    }
}

enum Completion {
    Mutation {
        local_id: LocalId,
        result: Result<Option<String>, TaskStoreError>,
    },
    Load {
        generation: u64,
        window: TimeWindow,
        filter: StatusFilter,
        result: Result<Vec<Task>, TaskStoreError>,
    },
    Tags(Result<Vec<String>, TaskStoreError>),
}

pub struct SyncEngine {
    store: Arc<dyn TaskStore>,
    tasks: Vec<Task>,
    queues: HashMap<LocalId, MutationQueue>,
    /// Local ids of tasks created here, by remote id. Loaded pages map to them.
    created_ids: HashMap<String, LocalId>,
    sender: Sender<Completion>,
    inbox: Receiver<Completion>,
    outstanding: usize,
    load_generation: u64,
    loading: bool,
    view: Option<(TimeWindow, StatusFilter)>,
    tag_options: Vec<String>,
    revision: u64,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        let (sender, inbox) = mpsc::channel();
        Self {
            store,
            tasks: Vec::new(),
            queues: HashMap::new(),
            created_ids: HashMap::new(),
            sender,
            inbox,
            outstanding: 0,
            load_generation: 0,
            loading: false,
            view: None,
            tag_options: Vec::new(),
            revision: 0,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, local_id: &LocalId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.local_id == local_id)
    }

    /// Bumped on every observable change to the list.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding == 0
    }

    pub fn pending_mutations(&self, local_id: &LocalId) -> usize {
        self.queues.get(local_id).map(MutationQueue::len).unwrap_or(0)
    }

    pub fn view(&self) -> Option<(TimeWindow, StatusFilter)> {
        self.view
    }

    pub fn tag_options(&self) -> &[String] {
        &self.tag_options
    }

    pub fn add(&mut self, content: impl Into<String>) -> LocalId {
        let weight = if self.tasks.is_empty() {
            FIRST_TASK_WEIGHT
        } else {
            0
        };
        let task = Task::new(content, weight);
        let local_id = task.local_id.clone();
        debug!(%local_id, weight, "adding task");

        self.tasks.push(task.clone());
        self.revision += 1;
        self.reorder();

        self.queues
            .insert(local_id.clone(), MutationQueue::new(None));
        self.enqueue(&local_id, task);
        local_id
    }

    pub fn update(&mut self, local_id: &LocalId, new_state: Task) -> Result<(), SyncError> {
        let Some(pos) = self.position(local_id) else {
            return Err(SyncError::NotFound(local_id.clone()));
        };
        let current = self.tasks[pos].clone();
        if current.status.is_done() && !new_state.status.is_done() {
            return Err(SyncError::Reopen(local_id.clone()));
        }

        let mut next = new_state;
        next.local_id = local_id.clone();
        next.remote_id = current.remote_id.clone();
        if next.status.is_done() {
            if current.status.is_done() && current.time.end.is_some() {
                next.time.end = current.time.end;
            } else if next.time.end.is_none() {
                next.time.end = Some(local_now());
            }
        }
        if next == current {
            return Ok(());
        }

        let weight_changed = next.weight != current.weight;
        self.tasks[pos] = next.clone();
        self.revision += 1;
        if weight_changed {
            self.reorder();
        }

        self.queues
            .entry(local_id.clone())
            .or_insert_with(|| MutationQueue::new(current.is_persisted().then_some(current)));
        self.enqueue(local_id, next);
        Ok(())
    }

    /// Stable sort by descending weight. Returns `false` and leaves the list
    /// untouched when it is already ordered.
    pub fn reorder(&mut self) -> bool {
        let sorted = self
            .tasks
            .windows(2)
            .all(|pair| pair[0].weight >= pair[1].weight);
        if sorted {
            return false;
        }
        self.tasks.sort_by(|a, b| b.weight.cmp(&a.weight));
        self.revision += 1;
        true
    }

    /// Refreshes the list for `window`. Tasks with unconfirmed mutations keep
    /// their local value when the result is merged; only the latest load applies.
    pub fn load(&mut self, window: TimeWindow, filter: StatusFilter) {
        self.load_generation += 1;
        let generation = self.load_generation;
        self.loading = true;
        self.view = Some((window, filter));
        self.outstanding += 1;

        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        thread::spawn(move || {
            let result = store.list(&window, filter);
            let _ = sender.send(Completion::Load {
                generation,
                window,
                filter,
                result,
            });
        });
    }

    /// Reloads the last requested window, if any.
    pub fn reload(&mut self) -> bool {
        match self.view {
            Some((window, filter)) => {
                self.load(window, filter);
                true
            }
            None => false,
        }
    }

    pub fn refresh_tags(&mut self) {
        self.spawn_tags(None);
    }

    /// Adds a tag option. Returns `false` if it already exists.
    pub fn create_tag(&mut self, tag: &str) -> bool {
        let tag = tag.trim();
        if tag.is_empty() || self.tag_options.iter().any(|existing| existing == tag) {
            return false;
        }
        let mut options = self.tag_options.clone();
        options.push(tag.to_string());
        self.spawn_tags(Some(options));
        true
    }

    /// Done/open counts per local day, for calendar markers.
    pub fn day_summary(&self) -> BTreeMap<NaiveDate, DaySummary> {
        let mut summary: BTreeMap<NaiveDate, DaySummary> = BTreeMap::new();
        for task in &self.tasks {
            let entry = summary.entry(task.local_day()).or_default();
            if task.status.is_done() {
                entry.done += 1;
            } else {
                entry.open += 1;
            }
        }
        summary
    }

    /// Applies every remote result received so far without blocking.
    pub fn pump(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(completion) = self.inbox.try_recv() {
            events.extend(self.apply(completion));
        }
        events
    }

    /// Blocks until every dispatched remote call has resolved.
    pub fn wait_idle(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while self.outstanding > 0 {
            match self.inbox.recv() {
                Ok(completion) => events.extend(self.apply(completion)),
                Err(_) => break,
            }
        }
        events
    }

    fn position(&self, local_id: &LocalId) -> Option<usize> {
        self.tasks.iter().position(|task| &task.local_id == local_id)
    }

    fn enqueue(&mut self, local_id: &LocalId, task: Task) {
        if let Some(queue) = self.queues.get_mut(local_id) {
            queue.waiting.push_back(task);
        }
        self.dispatch_next(local_id);
    }

    fn dispatch_next(&mut self, local_id: &LocalId) {
        let Some(queue) = self.queues.get_mut(local_id) else {
            return;
        };
        if queue.in_flight.is_some() {
            return;
        }
        let Some(mut task) = queue.waiting.pop_front() else {
            self.queues.remove(local_id);
            return;
        };
        if !task.is_persisted() {
            task.remote_id = queue
                .confirmed
                .as_ref()
                .and_then(|confirmed| confirmed.remote_id.clone());
        }
        queue.in_flight = Some(task.clone());
        self.outstanding += 1;

        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        let local_id = local_id.clone();
        thread::spawn(move || {
            let result = if task.is_persisted() {
                store.update(&task).map(|()| None)
            } else {
                store.create(&task).map(Some)
            };
            let _ = sender.send(Completion::Mutation { local_id, result });
        });
    }

    fn spawn_tags(&mut self, replacement: Option<Vec<String>>) {
        self.outstanding += 1;
        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        thread::spawn(move || {
            let result = match replacement {
                Some(tags) => store.set_tags(&tags),
                None => store.tags(),
            };
            let _ = sender.send(Completion::Tags(result));
        });
    }

    fn apply(&mut self, completion: Completion) -> Option<SyncEvent> {
        self.outstanding = self.outstanding.saturating_sub(1);
        match completion {
            Completion::Mutation { local_id, result } => self.apply_mutation(local_id, result),
            Completion::Load {
                generation,
                window,
                filter,
                result,
            } => self.apply_load(generation, window, filter, result),
            Completion::Tags(Ok(tags)) => {
                self.tag_options = tags.clone();
                Some(SyncEvent::TagsLoaded(tags))
            }
            Completion::Tags(Err(error)) => {
                warn!("tag options request failed: {error}");
                Some(SyncEvent::TagsFailed(error))
            }
        }
    }

    fn apply_mutation(
        &mut self,
        local_id: LocalId,
        result: Result<Option<String>, TaskStoreError>,
    ) -> Option<SyncEvent> {
        let queue = self.queues.get_mut(&local_id)?;
        let mut sent = queue.in_flight.take()?;

        match result {
            Ok(created) => {
                if let Some(remote_id) = created.as_deref() {
                    sent.remote_id = Some(remote_id.to_string());
                    for waiting in queue.waiting.iter_mut() {
                        waiting.remote_id = Some(remote_id.to_string());
                    }
                    if let Some(task) = self.tasks.iter_mut().find(|t| t.local_id == local_id) {
                        task.remote_id = Some(remote_id.to_string());
                        self.revision += 1;
                    }
                }
                queue.confirmed = Some(sent);
                if let Some(remote_id) = created.as_deref() {
                    self.created_ids.insert(remote_id.to_string(), local_id.clone());
                    self.drop_duplicates(&local_id, remote_id);
                }
                self.dispatch_next(&local_id);
                Some(match created {
                    Some(remote_id) => {
                        debug!(%local_id, %remote_id, "task created remotely");
                        SyncEvent::Created {
                            local_id,
                            remote_id,
                        }
                    }
                    None => SyncEvent::Updated { local_id },
                })
            }
            Err(error) => {
                let discarded = queue.waiting.len();
                let confirmed = queue.confirmed.take();
                self.queues.remove(&local_id);
                warn!(%local_id, discarded, "remote mutation failed, rolling back: {error}");

                let pos = self.position(&local_id);
                match (confirmed, pos) {
                    (Some(previous), Some(pos)) => self.tasks[pos] = previous,
                    (Some(previous), None) if self.in_view(&previous) => self.tasks.push(previous),
                    (Some(_), None) => {}
                    (None, Some(pos)) => {
                        self.tasks.remove(pos);
                    }
                    (None, None) => {}
                }
                self.revision += 1;
                self.reorder();
                Some(SyncEvent::RolledBack {
                    local_id,
                    error,
                    discarded,
                })
            }
        }
    }

    fn apply_load(
        &mut self,
        generation: u64,
        window: TimeWindow,
        filter: StatusFilter,
        result: Result<Vec<Task>, TaskStoreError>,
    ) -> Option<SyncEvent> {
        if generation != self.load_generation {
            debug!(generation, latest = self.load_generation, "dropping stale load");
            return None;
        }
        self.loading = false;

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!("task list failed: {error}");
                return Some(SyncEvent::LoadFailed(error));
            }
        };

        // Pending work wins over the fetched copy, in current list order.
        let mut pending: Vec<Task> = self
            .queues
            .values()
            .filter_map(MutationQueue::latest)
            .cloned()
            .collect();
        pending.sort_by_key(|task| self.position(&task.local_id).unwrap_or(usize::MAX));

        let mut merged: Vec<Task> = fetched
            .into_iter()
            .filter(|task| filter.matches(task.status))
            .map(|mut task| {
                let created = task
                    .remote_id
                    .as_deref()
                    .and_then(|remote_id| self.created_ids.get(remote_id));
                if let Some(local_id) = created {
                    task.local_id = local_id.clone();
                }
                task
            })
            .collect();
        let fetched_count = merged.len();

        for local in &pending {
            let existing = merged.iter().position(|task| task.local_id == local.local_id);
            let visible = filter.matches(local.status) && window.contains(&local.time.start);
            match (existing, visible) {
                (Some(pos), true) => merged[pos] = local.clone(),
                (Some(pos), false) => {
                    merged.remove(pos);
                }
                (None, true) => merged.push(local.clone()),
                (None, false) => {}
            }
        }

        self.tasks = merged;
        self.revision += 1;
        self.reorder();
        info!(count = fetched_count, kept_local = self.queues.len(), "task list loaded");
        Some(SyncEvent::Loaded {
            count: fetched_count,
        })
    }

    /// A load that raced a create can hold the same page under another id.
    fn drop_duplicates(&mut self, local_id: &LocalId, remote_id: &str) {
        let before = self.tasks.len();
        let queues = &mut self.queues;
        self.tasks.retain(|task| {
            let duplicate =
                &task.local_id != local_id && task.remote_id.as_deref() == Some(remote_id);
            if duplicate {
                queues.remove(&task.local_id);
            }
            !duplicate
        });
        if self.tasks.len() != before {
            debug!(%local_id, %remote_id, "dropped duplicate of created task");
            self.revision += 1;
        }
    }

    fn in_view(&self, task: &Task) -> bool {
        self.view.is_none_or(|(window, filter)| {
            filter.matches(task.status) && window.contains(&task.time.start)
        })
    }
}
