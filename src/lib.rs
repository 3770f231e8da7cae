//! # moltbot: priority-scheduled task dispatch for LLM generation requests
//!
//! `moltbot` accepts prompt-generation requests, selects an upstream
//! model provider per request under a pluggable strategy, executes the
//! call over HTTP with retry and backoff, and delivers the result via
//! polling, blocking wait, or outbound webhook.
//!
//! ## Architecture
//!
//! Four components, leaves first: the [`registry`] (known models plus
//! rolling health/cost counters and the selection policy), the
//! [`provider`] adapters (one upstream generation call per provider
//! tag), the [`scheduler`] (priority-ordered admission into a bounded
//! running set), and the [`engine`] (the orchestrator tying the other
//! three together, plus outer retry). A fifth collaborator, the
//! [`dispatcher`], delivers lifecycle events to in-process callbacks
//! and outbound webhooks.
//!
//! Construction wires explicit dependencies rather than process-wide
//! singletons: [`Application::new`] builds one of each component and
//! binds them once at startup.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod telemetry;

use std::str::FromStr;
use std::sync::Arc;

use tokio::net::TcpListener;

pub use config::Config;
pub use error::{Error, Result};

use dispatcher::{Dispatcher, WebhookRegistration};
use engine::Engine;
use registry::{ModelRegistration, ModelRegistry, SelectionStrategy};
use scheduler::Scheduler;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<ModelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<Config>,
}

/// Owns every long-lived component and drives the HTTP facade.
pub struct Application {
    state: AppState,
}

impl Application {
    /// Construct every component from `config`, pre-registering the
    /// models and webhooks it names, and spawn the engine's admitted-
    /// task worker loop.
    pub async fn new(config: Config) -> Result<Self> {
        let strategy = SelectionStrategy::from_str(&config.model_selection_strategy)?;
        let dispatcher = Arc::new(Dispatcher::new());
        let registry = Arc::new(ModelRegistry::new(strategy));
        let providers = Arc::new(provider::ProviderRegistry::new());

        let (scheduler, ready_rx) = Scheduler::new(config.max_concurrent_tasks, dispatcher.clone());
        let scheduler = Arc::new(scheduler);

        let engine = Engine::spawn(scheduler.clone(), registry.clone(), providers, config.retry_times, ready_rx);

        for (name, entry) in &config.models {
            registry.register(ModelRegistration {
                name: name.clone(),
                provider: entry.provider.clone(),
                credentials: entry.api_key.clone(),
                base_url: entry.base_url.clone(),
                max_tokens: entry.max_tokens,
                default_temperature: entry.temperature,
                weight: entry.weight,
                cost_per_token: 0.0,
            });
        }

        for webhook in config.webhooks.values() {
            let event = dispatcher::EventName::from_str(&webhook.event)?;
            dispatcher.register_webhook(
                event,
                WebhookRegistration {
                    url: webhook.url.clone(),
                    headers: webhook.headers.clone(),
                    retry_count: 3,
                    timeout: std::time::Duration::from_secs(10),
                },
            );
        }

        Ok(Self {
            state: AppState {
                engine,
                scheduler,
                registry,
                dispatcher,
                config: Arc::new(config),
            },
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve the HTTP facade until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        let bind_address = self.state.config.bind_address();
        let engine = self.state.engine.clone();
        let router = api::router(self.state);

        tracing::info!(%bind_address, "starting moltbot HTTP facade");
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("failed to bind {bind_address}: {e}")))?;

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("server error: {e}")));

        engine.shutdown();
        result
    }

    /// Run a single task to completion and return its result or error,
    /// for the `run` CLI subcommand.
    pub async fn run_one(&self, prompt: String, model_hint: Option<String>) -> Result<task::Task> {
        let submission = task::TaskSubmission {
            prompt,
            model_hint,
            max_retries: self.state.config.retry_times,
            timeout_secs: self.state.config.task_timeout,
            ..Default::default()
        };
        let id = self.state.engine.execute(submission).await?;
        self.state
            .engine
            .wait(id, std::time::Duration::from_secs(self.state.config.task_timeout))
            .await
    }
}
