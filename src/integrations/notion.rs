//! Notion database as the remote task store.
//!
//! The task template carries these page properties: `task` (title),
//! `percent` (number), `status` (status), `tags` (multi-select) and
//! `time` (date range: creation instant, completion instant).

use super::{format_http_error, http_client};
use crate::config::NotionConfig;
use crate::models::{
    Credential, LocalId, StatusFilter, Task, TaskStatus, TaskTime, TimeWindow, Timestamp,
    local_midnight, local_now,
};
use crate::task_store::{TaskStore, TaskStoreError};
use chrono::{DateTime, NaiveDate};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

const PAGE_SIZE: u32 = 100;
/// Done labels used by the localized task template.
const DONE_ALIASES: &[&str] = &["完成", "done"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusLabels {
    pub not_started: String,
    pub done: String,
}

impl StatusLabels {
    pub fn from_config(config: &NotionConfig) -> Self {
        Self {
            not_started: config.status_not_started.clone(),
            done: config.status_done.clone(),
        }
    }

    pub fn label(&self, status: TaskStatus) -> &str {
        match status {
            TaskStatus::NotStarted => &self.not_started,
            TaskStatus::Done => &self.done,
        }
    }

    /// Unknown names read as not started.
    pub fn parse(&self, name: &str) -> TaskStatus {
        let name = name.trim();
        let is_done = name.eq_ignore_ascii_case(&self.done)
            || DONE_ALIASES
                .iter()
                .any(|alias| name.eq_ignore_ascii_case(alias));
        if is_done {
            TaskStatus::Done
        } else {
            TaskStatus::NotStarted
        }
    }
}

pub struct NotionTaskStore {
    client: Client,
    api_url: String,
    notion_version: String,
    access_token: String,
    database_id: Option<String>,
    labels: StatusLabels,
}

impl NotionTaskStore {
    pub fn new(config: &NotionConfig, credential: &Credential) -> Self {
        Self {
            client: http_client(config.request_timeout_seconds),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            notion_version: config.notion_version.clone(),
            access_token: credential.access_token.clone(),
            database_id: credential.database_id.clone().filter(|id| !id.is_empty()),
            labels: StatusLabels::from_config(config),
        }
    }

    fn database_id(&self) -> Result<&str, TaskStoreError> {
        self.database_id
            .as_deref()
            .ok_or(TaskStoreError::NotConfigured)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, TaskStoreError> {
        let resp = request
            .bearer_auth(&self.access_token)
            .header("Notion-Version", self.notion_version.as_str())
            .send()
            .map_err(|e| TaskStoreError::Other(e.to_string()))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        Err(classify_error(status, &body))
    }

    fn query_page(
        &self,
        database_id: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<QueryResponse, TaskStoreError> {
        let url = format!("{}/v1/databases/{database_id}/query", self.api_url);
        let resp = self.send(self.client.post(url).json(&query_body(window, cursor)))?;
        resp.json()
            .map_err(|e| TaskStoreError::Other(e.to_string()))
    }
}

impl TaskStore for NotionTaskStore {
    fn create(&self, task: &Task) -> Result<String, TaskStoreError> {
        let database_id = self.database_id()?;
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": task_properties(task, &self.labels),
        });
        let resp = self.send(self.client.post(format!("{}/v1/pages", self.api_url)).json(&body))?;
        let created: CreatedPage = resp
            .json()
            .map_err(|e| TaskStoreError::Other(e.to_string()))?;
        debug!(page = %created.id, "created Notion page");
        Ok(created.id)
    }

    fn update(&self, task: &Task) -> Result<(), TaskStoreError> {
        let Some(page_id) = task.remote_id.as_deref().filter(|id| !id.is_empty()) else {
            return Err(TaskStoreError::Other(format!(
                "task {} has no Notion page yet",
                task.local_id
            )));
        };
        let url = format!("{}/v1/pages/{page_id}", self.api_url);
        let body = json!({ "properties": task_properties(task, &self.labels) });
        self.send(self.client.patch(url).json(&body))?;
        Ok(())
    }

    fn list(&self, window: &TimeWindow, filter: StatusFilter) -> Result<Vec<Task>, TaskStoreError> {
        let database_id = self.database_id()?;
        let mut tasks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.query_page(database_id, window, cursor.as_deref())?;
            tasks.extend(
                page.results
                    .iter()
                    .map(|page| page_to_task(page, &self.labels))
                    .filter(|task| filter.matches(task.status)),
            );
            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        debug!(count = tasks.len(), "queried Notion tasks");
        Ok(tasks)
    }

    fn tags(&self) -> Result<Vec<String>, TaskStoreError> {
        let url = format!("{}/v1/databases/{}", self.api_url, self.database_id()?);
        let resp = self.send(self.client.get(url))?;
        let database: Database = resp
            .json()
            .map_err(|e| TaskStoreError::Other(e.to_string()))?;
        database.tag_options()
    }

    fn set_tags(&self, tags: &[String]) -> Result<Vec<String>, TaskStoreError> {
        let url = format!("{}/v1/databases/{}", self.api_url, self.database_id()?);
        let options: Vec<Value> = tags.iter().map(|name| json!({ "name": name })).collect();
        let body = json!({ "properties": { "tags": { "multi_select": { "options": options } } } });
        let resp = self.send(self.client.patch(url).json(&body))?;
        let database: Database = resp
            .json()
            .map_err(|e| TaskStoreError::Other(e.to_string()))?;
        database.tag_options()
    }
}

fn classify_error(status: StatusCode, body: &str) -> TaskStoreError {
    let parsed: Option<NotionError> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().map(|err| err.code.as_str()).unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || code == "unauthorized" {
        return TaskStoreError::Unauthorized;
    }
    if matches!(code, "validation_error" | "object_not_found") {
        let message = parsed.map(|err| err.message).unwrap_or_default();
        return TaskStoreError::ValidationError(message);
    }
    TaskStoreError::Other(format_http_error(status, body))
}

fn query_body(window: &TimeWindow, cursor: Option<&str>) -> Value {
    let mut body = json!({
        "page_size": PAGE_SIZE,
        "filter": {
            "and": [
                { "property": "time", "date": { "on_or_after": window.start.to_rfc3339() } },
                { "property": "time", "date": { "before": window.end.to_rfc3339() } },
            ]
        },
        "sorts": [{ "property": "percent", "direction": "descending" }],
    });
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

fn task_properties(task: &Task, labels: &StatusLabels) -> Value {
    let tags: Vec<Value> = task.tags.iter().map(|name| json!({ "name": name })).collect();
    json!({
        "task": {
            "type": "title",
            "title": [{ "type": "text", "text": { "content": task.content } }]
        },
        "percent": { "type": "number", "number": task.weight },
        "status": { "type": "status", "status": { "name": labels.label(task.status) } },
        "tags": { "type": "multi_select", "multi_select": tags },
        "time": {
            "type": "date",
            "date": {
                "start": task.time.start.to_rfc3339(),
                "end": task.time.end.map(|end| end.to_rfc3339()),
            }
        },
    })
}

fn page_to_task(page: &Page, labels: &StatusLabels) -> Task {
    let props = &page.properties;
    let content = props
        .task
        .as_ref()
        .map(|title| {
            title
                .title
                .iter()
                .map(|part| part.plain_text.as_str())
                .collect::<String>()
        })
        .unwrap_or_default();
    let weight = props
        .percent
        .as_ref()
        .and_then(|percent| percent.number)
        .map(|n| n.clamp(0.0, u32::MAX as f64).round() as u32)
        .unwrap_or(0);
    let status = props
        .status
        .as_ref()
        .and_then(|status| status.status.as_ref())
        .map(|option| labels.parse(&option.name))
        .unwrap_or_default();
    let tags = props
        .tags
        .as_ref()
        .map(|tags| tags.multi_select.iter().map(|o| o.name.clone()).collect())
        .unwrap_or_default();

    let date = props.time.as_ref().and_then(|time| time.date.as_ref());
    let start = date
        .and_then(|date| parse_instant(&date.start))
        .or_else(|| page.created_time.as_deref().and_then(parse_instant))
        .unwrap_or_else(local_now);
    let end = date
        .and_then(|date| date.end.as_deref())
        .and_then(parse_instant);

    Task {
        local_id: LocalId::from_remote(&page.id),
        remote_id: Some(page.id.clone()),
        content,
        tags,
        status,
        weight,
        time: TaskTime { start, end },
    }
}

/// Accepts full timestamps and date-only values (local midnight).
fn parse_instant(value: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .map(local_midnight)
        })
}

#[derive(Deserialize)]
struct NotionError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct CreatedPage {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<Page>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct Page {
    id: String,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default)]
    properties: PageProperties,
}

#[derive(Deserialize, Default)]
struct PageProperties {
    #[serde(default)]
    task: Option<TitleProperty>,
    #[serde(default)]
    percent: Option<NumberProperty>,
    #[serde(default)]
    status: Option<StatusProperty>,
    #[serde(default)]
    tags: Option<MultiSelectProperty>,
    #[serde(default)]
    time: Option<DateProperty>,
}

#[derive(Deserialize)]
struct TitleProperty {
    #[serde(default)]
    title: Vec<RichText>,
}

#[derive(Deserialize)]
struct RichText {
    #[serde(default)]
    plain_text: String,
}

#[derive(Deserialize)]
struct NumberProperty {
    number: Option<f64>,
}

#[derive(Deserialize)]
struct StatusProperty {
    status: Option<NamedOption>,
}

#[derive(Deserialize)]
struct MultiSelectProperty {
    #[serde(default)]
    multi_select: Vec<NamedOption>,
}

#[derive(Deserialize)]
struct NamedOption {
    name: String,
}

#[derive(Deserialize)]
struct DateProperty {
    date: Option<DateValue>,
}

#[derive(Deserialize)]
struct DateValue {
    start: String,
    #[serde(default)]
    end: Option<String>,
}

#[derive(Deserialize)]
struct Database {
    #[serde(default)]
    properties: DatabaseProperties,
}

#[derive(Deserialize, Default)]
struct DatabaseProperties {
    #[serde(default)]
    tags: Option<TagsSchema>,
}

#[derive(Deserialize)]
struct TagsSchema {
    multi_select: TagOptions,
}

#[derive(Deserialize)]
struct TagOptions {
    #[serde(default)]
    options: Vec<NamedOption>,
}

impl Database {
    fn tag_options(self) -> Result<Vec<String>, TaskStoreError> {
        let Some(tags) = self.properties.tags else {
            return Err(TaskStoreError::ValidationError(
                "database has no tags property".to_string(),
            ));
        };
        Ok(tags
            .multi_select
            .options
            .into_iter()
            .map(|option| option.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> StatusLabels {
        StatusLabels::from_config(&NotionConfig::default())
    }

    fn page(value: Value) -> Page {
        serde_json::from_value(value).expect("page")
    }

    #[test]
    fn status_labels_accept_localized_names() {
        let labels = labels();
        assert_eq!(labels.parse("Done"), TaskStatus::Done);
        assert_eq!(labels.parse("完成"), TaskStatus::Done);
        assert_eq!(labels.parse("未开始"), TaskStatus::NotStarted);
        assert_eq!(labels.parse("In progress"), TaskStatus::NotStarted);
        assert_eq!(labels.label(TaskStatus::Done), "Done");
    }

    #[test]
    fn page_maps_to_task() {
        let task = page_to_task(
            &page(json!({
                "id": "page-1",
                "created_time": "2025-03-10T08:00:00.000Z",
                "properties": {
                    "task": { "title": [{ "plain_text": "Write " }, { "plain_text": "report" }] },
                    "percent": { "number": 70 },
                    "status": { "status": { "name": "完成" } },
                    "tags": { "multi_select": [{ "name": "work" }] },
                    "time": { "date": { "start": "2025-03-10T09:00:00+08:00", "end": "2025-03-10T18:30:00+08:00" } }
                }
            })),
            &labels(),
        );
        assert_eq!(task.local_id.as_str(), "page-1");
        assert_eq!(task.remote_id.as_deref(), Some("page-1"));
        assert_eq!(task.content, "Write report");
        assert_eq!(task.weight, 70);
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.tags, vec!["work".to_string()]);
        assert_eq!(task.time.start.to_rfc3339(), "2025-03-10T09:00:00+08:00");
        assert!(task.time.end.is_some());
    }

    #[test]
    fn sparse_page_falls_back_to_created_time() {
        let task = page_to_task(
            &page(json!({ "id": "p", "created_time": "2025-03-10T08:00:00Z", "properties": {} })),
            &labels(),
        );
        assert_eq!(task.content, "");
        assert_eq!(task.weight, 0);
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert_eq!(task.time.start.to_rfc3339(), "2025-03-10T08:00:00+00:00");
        assert!(task.time.end.is_none());
    }

    #[test]
    fn properties_carry_full_task_state() {
        let mut task = Task::new("Ship", 50);
        task.status = TaskStatus::Done;
        task.tags = vec!["home".to_string()];
        let props = task_properties(&task, &labels());
        assert_eq!(props["task"]["title"][0]["text"]["content"], "Ship");
        assert_eq!(props["percent"]["number"], 50);
        assert_eq!(props["status"]["status"]["name"], "Done");
        assert_eq!(props["tags"]["multi_select"][0]["name"], "home");
        assert!(props["time"]["date"]["end"].is_null());
    }

    #[test]
    fn query_body_pages_with_cursor() {
        let window = TimeWindow::for_day(NaiveDate::from_ymd_opt(2025, 3, 10).expect("date"));
        let first = query_body(&window, None);
        assert!(first.get("start_cursor").is_none());
        let next = query_body(&window, Some("cursor-2"));
        assert_eq!(next["start_cursor"], "cursor-2");
        assert_eq!(next["filter"]["and"][0]["date"]["on_or_after"], window.start.to_rfc3339());
    }

    #[test]
    fn errors_are_classified() {
        assert_eq!(
            classify_error(StatusCode::UNAUTHORIZED, ""),
            TaskStoreError::Unauthorized
        );
        assert_eq!(
            classify_error(
                StatusCode::BAD_REQUEST,
                r#"{"code":"validation_error","message":"percent is not a property"}"#
            ),
            TaskStoreError::ValidationError("percent is not a property".to_string())
        );
        assert!(matches!(
            classify_error(StatusCode::BAD_GATEWAY, "upstream down"),
            TaskStoreError::Other(message) if message.starts_with("HTTP 502")
        ));
    }

    #[test]
    fn store_without_database_is_not_configured() {
        let mut credential = crate::testing::sample_credential();
        credential.database_id = None;
        let store = NotionTaskStore::new(&NotionConfig::default(), &credential);
        assert_eq!(store.tags(), Err(TaskStoreError::NotConfigured));
    }

    #[test]
    fn tag_schema_is_read() {
        let database: Database = serde_json::from_value(json!({
            "properties": { "tags": { "multi_select": { "options": [{ "name": "a" }, { "name": "b" }] } } }
        }))
        .expect("database");
        assert_eq!(database.tag_options(), Ok(vec!["a".to_string(), "b".to_string()]));

        let bare: Database = serde_json::from_value(json!({ "properties": {} })).expect("database");
        assert!(matches!(bare.tag_options(), Err(TaskStoreError::ValidationError(_))));
    }
}
