//! The task data model: identity, priority, status and the parameter
//! bag every submission carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque, server-assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Priority level. Declared in ascending order so the derived `Ord`
/// agrees with the numeric weights (LOW=1, NORMAL=5, HIGH=10,
/// CRITICAL=20); admission scans levels in descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL_DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn weight(self) -> u32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Critical => 20,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle state. Terminal once `Completed`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A single role/content message in the conversation fed to the
/// provider, either carried over from `options.history` or synthesized
/// by the engine (system, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Recognised, typed submission options. Everything else the caller
/// sends rides along in `extras` and is passed through to the
/// provider verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChatMessage>>,
}

/// The task entity. Mutated only by the Scheduler (`state`, timestamps)
/// and the Engine (`result`, `error`, `retry_count`, `model`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub prompt: String,
    pub model_hint: Option<String>,
    pub priority: Priority,
    pub options: TaskOptions,
    pub extras: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub state: TaskStatus,
    pub model: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,

    pub on_complete_url: Option<String>,
    pub on_error_url: Option<String>,
}

/// Parameters a caller supplies when submitting a task; validated and
/// turned into a fresh [`Task`] by [`Task::from_submission`].
#[derive(Debug, Clone, Default)]
pub struct TaskSubmission {
    pub prompt: String,
    pub model_hint: Option<String>,
    pub priority: Priority,
    pub options: TaskOptions,
    pub extras: serde_json::Map<String, serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub on_complete_url: Option<String>,
    pub on_error_url: Option<String>,
}

impl Task {
    pub fn from_submission(sub: TaskSubmission) -> Result<Self> {
        if sub.prompt.trim().is_empty() {
            return Err(Error::IllegalArgument("prompt must not be empty".into()));
        }

        Ok(Self {
            id: TaskId::new(),
            prompt: sub.prompt,
            model_hint: sub.model_hint,
            priority: sub.priority,
            options: sub.options,
            extras: sub.extras,
            metadata: sub.metadata,
            state: TaskStatus::Pending,
            model: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: sub.max_retries,
            timeout_secs: sub.timeout_secs,
            on_complete_url: sub.on_complete_url,
            on_error_url: sub.on_error_url,
        })
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.state, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Build the message sequence sent to the provider: optional prior
    /// history, then a system entry, then the user's prompt.
    pub fn build_messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.options.history.clone().unwrap_or_default();

        let system_prompt = self
            .options
            .system_prompt
            .clone()
            .unwrap_or_else(|| "You are a helpful AI assistant.".to_string());
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: system_prompt,
        });
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: self.prompt.clone(),
        });

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_prompt() {
        let sub = TaskSubmission {
            prompt: "   ".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Task::from_submission(sub),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn priority_ordering_matches_weights() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn build_messages_prepends_history_and_appends_prompt() {
        let sub = TaskSubmission {
            prompt: "hello".to_string(),
            options: TaskOptions {
                history: Some(vec![ChatMessage {
                    role: "user".to_string(),
                    content: "earlier".to_string(),
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        let task = Task::from_submission(sub).unwrap();
        let messages = task.build_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "earlier");
        assert_eq!(messages[1].role, "system");
        assert_eq!(messages[2].content, "hello");
    }

    #[test]
    fn fresh_task_is_pending_and_cancellable() {
        let task = Task::from_submission(TaskSubmission {
            prompt: "hi".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(task.state, TaskStatus::Pending);
        assert!(task.is_cancellable());
    }
}
