//! Request/response data structures for the HTTP facade.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Priority, Task, TaskOptions, TaskStatus, TaskSubmission};

fn default_priority_weight() -> u32 {
    Priority::Normal.weight()
}

/// `POST /tasks` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSubmitRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_priority_weight")]
    pub priority: u32,
    #[serde(default)]
    pub parameters: TaskOptions,
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub on_complete_url: Option<String>,
    #[serde(default)]
    pub on_error_url: Option<String>,
}

impl TaskSubmitRequest {
    pub fn into_submission(self, default_retries: u32, default_timeout: u64) -> Result<TaskSubmission, crate::error::Error> {
        Ok(TaskSubmission {
            prompt: self.prompt,
            model_hint: self.model,
            priority: priority_from_weight(self.priority)?,
            options: self.parameters,
            extras: self.extras,
            metadata: self.metadata,
            max_retries: self.max_retries.unwrap_or(default_retries),
            timeout_secs: self.timeout.unwrap_or(default_timeout),
            on_complete_url: self.on_complete_url,
            on_error_url: self.on_error_url,
        })
    }
}

fn priority_from_weight(weight: u32) -> Result<Priority, crate::error::Error> {
    match weight {
        1 => Ok(Priority::Low),
        5 => Ok(Priority::Normal),
        10 => Ok(Priority::High),
        20 => Ok(Priority::Critical),
        other => Err(crate::error::Error::IllegalArgument(format!(
            "priority must be one of 1, 5, 10, 20; got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskBatchQuery {
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
}

fn default_batch_concurrency() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskWaitQuery {
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
}

fn default_wait_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
}

/// `POST /tasks`, `POST /tasks/batch` response shapes.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSubmitResponse {
    pub task_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskBatchResponse {
    pub task_ids: Vec<String>,
}

/// `GET /tasks` list entry — a summary, unlike the full detail view.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: String,
    pub priority: Priority,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `GET /tasks/{id}` response — full detail, prompt not truncated.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    pub task_id: String,
    pub prompt: String,
    pub status: String,
    pub priority: Priority,
    pub model: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            status: format!("{:?}", task.state).to_uppercase(),
            priority: task.priority,
            model: task.model,
            created_at: task.created_at,
        }
    }
}

impl From<Task> for TaskDetail {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            prompt: task.prompt,
            status: format!("{:?}", task.state).to_uppercase(),
            priority: task.priority,
            model: task.model,
            result: task.result,
            error: task.error,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            metadata: task.metadata,
        }
    }
}

/// `POST /models` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelRegisterRequest {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub cost_per_token: f64,
}

fn default_weight() -> u32 {
    10
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRegisterResponse {
    pub name: String,
}

/// `GET /models` list entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub provider: String,
    pub available: bool,
    pub weight: u32,
    pub avg_response_time: f64,
    pub success_rate: f64,
}

/// `POST /webhooks` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRegisterRequest {
    pub event: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// `GET /status` response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
