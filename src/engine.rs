//! The execution engine: orchestrates one task from admission to
//! terminal state, and owns the admitted-task worker loop fed by the
//! [`Scheduler`]'s readiness channel.
//!
//! Two distinct retry tiers exist and must not be conflated: the
//! provider adapter retries transport-level failures internally, while
//! the retry loop here applies to *outer attempts* — each one a full
//! provider call (with its own internal retries) that either succeeds
//! or exhausts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::EventName;
use crate::error::{Error, Result};
use crate::provider::ProviderRegistry;
use crate::registry::ModelRegistry;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskId, TaskStatus, TaskSubmission};

const OUTER_BACKOFF_CAP_SECS: u64 = 60;

/// Orchestrates submission, admission-triggered execution, retry, and
/// waiting. Holds the scheduler, model registry, and provider registry
/// as explicit dependencies — no process-wide singletons.
pub struct Engine {
    scheduler: Arc<Scheduler>,
    registry: Arc<ModelRegistry>,
    providers: Arc<ProviderRegistry>,
    default_max_retries: u32,
    waiters: Mutex<HashMap<TaskId, Vec<oneshot::Sender<()>>>>,
    batch_semaphores: Mutex<HashMap<TaskId, Arc<Semaphore>>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Construct the engine and spawn its admitted-task worker loop.
    /// `ready_rx` is the scheduler's admission channel; every task id
    /// it yields is picked up here and run to a terminal state.
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        registry: Arc<ModelRegistry>,
        providers: Arc<ProviderRegistry>,
        default_max_retries: u32,
        mut ready_rx: mpsc::UnboundedReceiver<TaskId>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            scheduler,
            registry,
            providers,
            default_max_retries,
            waiters: Mutex::new(HashMap::new()),
            batch_semaphores: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        engine.register_waiter_hooks();

        let worker_engine = engine.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_engine.shutdown.cancelled() => {
                        tracing::debug!("engine worker loop shutting down");
                        break;
                    }
                    maybe_id = ready_rx.recv() => {
                        let Some(id) = maybe_id else { break };
                        let engine = worker_engine.clone();
                        tokio::spawn(async move {
                            engine.run_task(id).await;
                        });
                    }
                }
            }
        });

        engine
    }

    /// Stop admitting newly-ready tasks to new worker spawns. Tasks
    /// already running are left to finish or hit their own timeout;
    /// there's no durable state to flush on the way out.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wires a handler onto every terminal event so [`Engine::wait`]
    /// callers are notified as soon as the scheduler reaches it,
    /// without polling.
    fn register_waiter_hooks(self: &Arc<Self>) {
        for event in [EventName::OnComplete, EventName::OnError, EventName::OnCancel] {
            let engine = self.clone();
            self.scheduler.on(
                event,
                Arc::new(move |evt| {
                    let engine = engine.clone();
                    Box::pin(async move {
                        engine.notify_waiters(evt.task_id);
                    })
                }),
            );
        }
    }

    fn notify_waiters(&self, id: TaskId) {
        if let Some(senders) = self.waiters.lock().remove(&id) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }

    /// Validate, select a model, and submit. Fails synchronously with
    /// [`Error::NoAvailableModel`] if the registry has nothing to offer.
    pub async fn execute(&self, submission: TaskSubmission) -> Result<TaskId> {
        self.execute_gated(submission, None).await
    }

    /// Submit every task in `submissions`, but cap how many of them
    /// may be performing their upstream call at once to `concurrency`
    /// (coerced up to 1). This gates *starts*, not admission into the
    /// scheduler's running set — all tasks are still admitted under
    /// the normal global cap.
    pub async fn execute_batch(&self, submissions: Vec<TaskSubmission>, concurrency: usize) -> Vec<Result<TaskId>> {
        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut ids = Vec::with_capacity(submissions.len());
        for submission in submissions {
            ids.push(self.execute_gated(submission, Some(semaphore.clone())).await);
        }
        ids
    }

    /// Validate, select a model, and submit — recording `semaphore`
    /// (if any) against the assigned id *before* the task is handed to
    /// the scheduler. The registration must land before `submit` so the
    /// worker loop, which can pick the task up as soon as it's
    /// admitted, always finds its batch gate already in place.
    async fn execute_gated(&self, submission: TaskSubmission, semaphore: Option<Arc<Semaphore>>) -> Result<TaskId> {
        let mut task = Task::from_submission(submission)?;

        let model = self.registry.select(&task).ok_or(Error::NoAvailableModel)?;
        task.model = Some(model.name.clone());
        if task.max_retries == 0 && self.default_max_retries > 0 {
            task.max_retries = self.default_max_retries;
        }

        let id = task.id;
        if let Some(semaphore) = semaphore {
            self.batch_semaphores.lock().insert(id, semaphore);
        }

        self.scheduler.submit(task).await
    }

    /// Block until `id` reaches a terminal state or `timeout` elapses.
    /// A timeout never cancels the underlying task.
    pub async fn wait(&self, id: TaskId, timeout: Duration) -> Result<Task> {
        let Some(task) = self.scheduler.get(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if task.state.is_terminal() {
            return Ok(task);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(id).or_default().push(tx);

        // Re-check: the task may have finished between the first read
        // and registering the waiter.
        if let Some(task) = self.scheduler.get(id) {
            if task.state.is_terminal() {
                self.notify_waiters(id);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(self.scheduler.get(id).expect("task vanished after terminal notification")),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Per-task algorithm: call the provider, retry on failure up to
    /// `max_retries` outer attempts with `2^retry_count` second
    /// backoff, and write the terminal outcome back through the
    /// scheduler. Abandons work (no `on_complete`/`on_error`) the
    /// moment the task is observed CANCELLED.
    async fn run_task(&self, id: TaskId) {
        let Some(task) = self.scheduler.get(id) else { return };
        let Some(model_name) = task.model.clone() else {
            self.scheduler.finish(id, Err("no model assigned".to_string())).await;
            return;
        };

        self.scheduler.mark_started(id, model_name.clone()).await;

        let permit = {
            let semaphore = self.batch_semaphores.lock().get(&id).cloned();
            match semaphore {
                Some(sem) => Some(sem.acquire_owned().await.expect("batch semaphore closed")),
                None => None,
            }
        };

        loop {
            if self.is_cancelled(id) {
                tracing::debug!(task_id = %id, "task cancelled before provider call, abandoning");
                break;
            }

            let Some(model) = self.registry.get(&model_name) else {
                self.scheduler.finish(id, Err(format!("model '{model_name}' no longer registered"))).await;
                break;
            };

            let Some(current) = self.scheduler.get(id) else { break };
            let messages = current.build_messages();
            let started = Instant::now();

            let provider = self.providers.resolve(&model.provider);
            let outcome = provider
                .chat_completion(&model, &messages, &current.options, &current.extras)
                .await;
            let elapsed = started.elapsed().as_secs_f64();

            if self.is_cancelled(id) {
                tracing::debug!(task_id = %id, "task cancelled during provider call, discarding result");
                break;
            }

            match outcome {
                Ok(result) => {
                    self.registry.update_stats(&model_name, true, elapsed);
                    self.scheduler.finish(id, Ok(result)).await;
                    break;
                }
                Err(err) => {
                    self.registry.update_stats(&model_name, false, 0.0);

                    let retry_count = current.retry_count;
                    if retry_count < current.max_retries {
                        let next_retry = retry_count + 1;
                        self.scheduler.set_retry_count(id, next_retry);
                        let backoff = Duration::from_secs(2u64.saturating_pow(next_retry).min(OUTER_BACKOFF_CAP_SECS));
                        tracing::warn!(task_id = %id, attempt = next_retry, error = %err, backoff_secs = backoff.as_secs(), "outer retry after provider failure");
                        self.sleep_or_cancelled(id, backoff).await;
                        continue;
                    }

                    self.scheduler.finish(id, Err(err.to_string())).await;
                    break;
                }
            }
        }

        drop(permit);
        self.batch_semaphores.lock().remove(&id);
    }

    fn is_cancelled(&self, id: TaskId) -> bool {
        self.scheduler.get(id).map(|t| t.state == TaskStatus::Cancelled).unwrap_or(true)
    }

    /// Sleep for `duration`, but wake early if `id` is cancelled in the
    /// meantime. Rides the same waiter channel [`Engine::wait`] uses —
    /// `register_waiter_hooks` already notifies it on `on_cancel`.
    async fn sleep_or_cancelled(&self, id: TaskId, duration: Duration) {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(id).or_default().push(tx);

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = rx => {
                tracing::debug!(task_id = %id, "retry backoff interrupted by cancellation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::provider::ProviderAdapter;
    use crate::registry::{ModelRegistration, SelectionStrategy};
    use crate::task::{ChatMessage, TaskOptions};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysSucceeds;
    #[async_trait]
    impl ProviderAdapter for AlwaysSucceeds {
        async fn chat_completion(&self, _m: &crate::registry::ModelEntry, _msgs: &[ChatMessage], _o: &TaskOptions, _e: &Map<String, serde_json::Value>) -> Result<String> {
            Ok("42".to_string())
        }
    }

    struct AlwaysFails {
        attempts: AtomicU32,
    }
    #[async_trait]
    impl ProviderAdapter for AlwaysFails {
        async fn chat_completion(&self, _m: &crate::registry::ModelEntry, _msgs: &[ChatMessage], _o: &TaskOptions, _e: &Map<String, serde_json::Value>) -> Result<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::UpstreamPermanent { status: 500, body: "boom".to_string() })
        }
    }

    fn setup(provider: Arc<dyn ProviderAdapter>, max_concurrent: usize) -> (Arc<Engine>, Arc<ModelRegistry>) {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, ready_rx) = Scheduler::new(max_concurrent, dispatcher);
        let scheduler = Arc::new(scheduler);
        let registry = Arc::new(ModelRegistry::new(SelectionStrategy::Availability));
        registry.register(ModelRegistration {
            name: "gpt-x".to_string(),
            provider: "openai".to_string(),
            weight: 10,
            max_tokens: 4096,
            default_temperature: 0.7,
            ..Default::default()
        });
        let mut providers = ProviderRegistry::new();
        providers.register("openai", provider);
        let engine = Engine::spawn(scheduler, registry.clone(), Arc::new(providers), 3, ready_rx);
        (engine, registry)
    }

    #[tokio::test]
    async fn successful_task_completes_with_result() {
        let (engine, _registry) = setup(Arc::new(AlwaysSucceeds), 2);
        let id = engine.execute(TaskSubmission { prompt: "hi".to_string(), ..Default::default() }).await.unwrap();
        let task = engine.wait(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.state, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("42"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_yield_exactly_max_retries_plus_one_attempts() {
        let provider = Arc::new(AlwaysFails { attempts: AtomicU32::new(0) });
        let (engine, registry) = setup(provider.clone(), 2);
        let id = engine
            .execute(TaskSubmission { prompt: "hi".to_string(), max_retries: 2, ..Default::default() })
            .await
            .unwrap();

        let task = engine.wait(id, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(task.state, TaskStatus::Failed);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(registry.get("gpt-x").unwrap().usage_count, 3);
    }

    #[tokio::test]
    async fn no_available_model_fails_synchronously() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (scheduler, ready_rx) = Scheduler::new(2, dispatcher);
        let registry = Arc::new(ModelRegistry::new(SelectionStrategy::Availability));
        let providers = Arc::new(ProviderRegistry::new());
        let engine = Engine::spawn(Arc::new(scheduler), registry, providers, 3, ready_rx);

        let result = engine.execute(TaskSubmission { prompt: "hi".to_string(), ..Default::default() }).await;
        assert!(matches!(result, Err(Error::NoAvailableModel)));
    }

    #[tokio::test]
    async fn wait_times_out_without_cancelling_task() {
        struct Never;
        #[async_trait]
        impl ProviderAdapter for Never {
            async fn chat_completion(&self, _m: &crate::registry::ModelEntry, _msgs: &[ChatMessage], _o: &TaskOptions, _e: &Map<String, serde_json::Value>) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("late".to_string())
            }
        }

        let (engine, _registry) = setup(Arc::new(Never), 2);
        let id = engine.execute(TaskSubmission { prompt: "hi".to_string(), ..Default::default() }).await.unwrap();

        let result = engine.wait(id, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        // The task itself keeps running; wait's timeout never cancels it.
        assert_ne!(engine.scheduler.get(id).unwrap().state, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_before_provider_call_abandons_without_firing_complete() {
        let (engine, _registry) = setup(Arc::new(AlwaysSucceeds), 0);
        let id = engine.execute(TaskSubmission { prompt: "hi".to_string(), ..Default::default() }).await.unwrap();
        // max_concurrent=0 so the task stays PENDING; cancel it there.
        assert!(engine.scheduler.cancel(id).await.unwrap());
        let task = engine.scheduler.get(id).unwrap();
        assert_eq!(task.state, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn execute_batch_coerces_sub_one_concurrency_to_one() {
        let (engine, _registry) = setup(Arc::new(AlwaysSucceeds), 4);
        let submissions = vec![
            TaskSubmission { prompt: "a".to_string(), ..Default::default() },
            TaskSubmission { prompt: "b".to_string(), ..Default::default() },
        ];
        let results = engine.execute_batch(submissions, 0).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
