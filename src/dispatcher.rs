//! Callback/webhook dispatcher: delivers lifecycle events to in-process
//! handlers and outbound HTTP webhooks.
//!
//! In-process handlers run sequentially, each under a 10s timeout; a
//! handler failure is logged and never blocks the remaining handlers
//! or affects task state. Webhook delivery is fire-and-forget from the
//! caller's perspective — each matching registration gets its own
//! spawned POST with bounded retries, modeled on a claim/sign/send
//! split minus the durable claim step (there is no persistence to
//! claim against here).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskId};

const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WEBHOOK_RETRIES: u32 = 3;
const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 10.0;

/// The closed set of lifecycle events a callback or webhook may bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    OnSubmit,
    OnStart,
    OnComplete,
    OnError,
    OnCancel,
    OnProgress,
}

impl std::str::FromStr for EventName {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_submit" => Ok(Self::OnSubmit),
            "on_start" => Ok(Self::OnStart),
            "on_complete" => Ok(Self::OnComplete),
            "on_error" => Ok(Self::OnError),
            "on_cancel" => Ok(Self::OnCancel),
            "on_progress" => Ok(Self::OnProgress),
            other => Err(crate::error::Error::IllegalArgument(format!("unknown event '{other}'"))),
        }
    }
}

/// A lifecycle event, snapshotting the task fields a handler or
/// webhook body needs.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: EventName,
    pub task_id: TaskId,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn from_task(event: EventName, task: &Task) -> Self {
        Self {
            event,
            task_id: task.id,
            status: format!("{:?}", task.state).to_uppercase(),
            result: task.result.clone(),
            error: task.error.clone(),
            timestamp: Utc::now(),
            extras: task.extras.clone(),
        }
    }
}

/// An in-process lifecycle handler. Boxed so both sync closures (via
/// `Box::pin(async move {...})`) and long-running async handlers fit
/// the same slot.
pub type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered outbound webhook.
#[derive(Debug, Clone)]
pub struct WebhookRegistration {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub retry_count: u32,
    pub timeout: Duration,
}

struct Inner {
    handlers: HashMap<EventName, Vec<Handler>>,
    webhooks: HashMap<EventName, Vec<WebhookRegistration>>,
}

pub struct Dispatcher {
    inner: Mutex<Inner>,
    http_client: reqwest::Client,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { handlers: HashMap::new(), webhooks: HashMap::new() }),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn on(&self, event: EventName, handler: Handler) {
        self.inner.lock().handlers.entry(event).or_default().push(handler);
    }

    pub fn register_webhook(&self, event: EventName, registration: WebhookRegistration) {
        self.inner.lock().webhooks.entry(event).or_default().push(registration);
    }

    /// Convenience: register a webhook bound to a task's ad-hoc
    /// `on_complete_url`/`on_error_url` fields, used by the HTTP facade's
    /// `POST /tasks` submission shape.
    pub fn register_task_webhook(&self, event: EventName, url: String) {
        self.register_webhook(
            event,
            WebhookRegistration {
                url,
                headers: HashMap::new(),
                retry_count: DEFAULT_WEBHOOK_RETRIES,
                timeout: DEFAULT_WEBHOOK_TIMEOUT,
            },
        );
    }

    /// Fire `event` for `task`: run in-process handlers sequentially
    /// (outside any mutex, each under its own timeout), then spawn one
    /// fire-and-forget delivery per matching webhook registration.
    pub async fn emit(&self, event: EventName, task: &Task) {
        let event_payload = Arc::new(Event::from_task(event, task));

        let (handlers, webhooks) = {
            let inner = self.inner.lock();
            (
                inner.handlers.get(&event).cloned().unwrap_or_default(),
                inner.webhooks.get(&event).cloned().unwrap_or_default(),
            )
        };

        for handler in handlers {
            let payload = event_payload.clone();
            match tokio::time::timeout(HANDLER_TIMEOUT, handler(payload)).await {
                Ok(()) => {}
                Err(_) => {
                    tracing::warn!(?event, task_id = %task.id, "in-process lifecycle handler timed out");
                }
            }
        }

        for webhook in webhooks {
            let client = self.http_client.clone();
            let payload = event_payload.clone();
            tokio::spawn(async move {
                deliver_webhook(client, webhook, payload).await;
            });
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver_webhook(client: reqwest::Client, webhook: WebhookRegistration, event: Arc<Event>) {
    let body = serde_json::json!({
        "event": event.event,
        "task_id": event.task_id,
        "status": event.status,
        "result": event.result,
        "error": event.error,
        "timestamp": event.timestamp,
        "extras": event.extras,
    });

    let attempts = webhook.retry_count.max(1);
    for attempt in 0..attempts {
        let mut request = client.post(&webhook.url).timeout(webhook.timeout).json(&body);
        for (name, value) in &webhook.headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %webhook.url, task_id = %event.task_id, attempt, "webhook delivered");
                return;
            }
            Ok(response) => {
                tracing::warn!(url = %webhook.url, task_id = %event.task_id, status = %response.status(), attempt, "webhook delivery failed");
            }
            Err(err) => {
                tracing::warn!(url = %webhook.url, task_id = %event.task_id, error = %err, attempt, "webhook delivery transport error");
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = (BACKOFF_BASE_SECS * 2f64.powi(attempt as i32)).min(BACKOFF_CAP_SECS);
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskOptions, TaskStatus, TaskSubmission};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task() -> Task {
        Task::from_submission(TaskSubmission {
            prompt: "hi".to_string(),
            priority: Priority::Normal,
            options: TaskOptions::default(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn in_process_handler_runs_on_matching_event() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        dispatcher.on(
            EventName::OnComplete,
            Arc::new(move |_event| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let mut t = task();
        t.state = TaskStatus::Completed;
        dispatcher.emit(EventName::OnComplete, &t).await;
        dispatcher.emit(EventName::OnError, &t).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_does_not_block_later_handlers() {
        let dispatcher = Dispatcher::new();
        let second_ran = Arc::new(AtomicUsize::new(0));

        dispatcher.on(
            EventName::OnError,
            Arc::new(|_event| Box::pin(async move { tokio::time::sleep(Duration::from_secs(3600)).await })),
        );
        let second_ran_clone = second_ran.clone();
        dispatcher.on(
            EventName::OnError,
            Arc::new(move |_event| {
                let second_ran = second_ran_clone.clone();
                Box::pin(async move {
                    second_ran.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let mut t = task();
        t.state = TaskStatus::Failed;
        dispatcher.emit(EventName::OnError, &t).await;

        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn webhook_posts_task_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new();
        dispatcher.register_task_webhook(EventName::OnComplete, server.uri());

        let mut t = task();
        t.state = TaskStatus::Completed;
        t.result = Some("answer".to_string());
        dispatcher.emit(EventName::OnComplete, &t).await;

        // Delivery is fire-and-forget; give the spawned task a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.verify().await;
    }

    #[tokio::test]
    async fn webhook_retries_up_to_configured_count_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new();
        dispatcher.register_webhook(
            EventName::OnComplete,
            WebhookRegistration {
                url: server.uri(),
                headers: HashMap::new(),
                retry_count: 2,
                timeout: Duration::from_secs(5),
            },
        );

        let mut t = task();
        t.state = TaskStatus::Completed;
        dispatcher.emit(EventName::OnComplete, &t).await;

        // Delivery (and its one real backoff sleep) run in the background.
        tokio::time::sleep(Duration::from_secs(3)).await;
        server.verify().await;
    }
}
