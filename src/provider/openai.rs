//! The default, OpenAI-compatible provider adapter.
//!
//! POSTs `{base_url}/chat/completions` with an OpenAI-shaped body.
//! Transport errors and timeouts are retried internally (3 attempts,
//! base 2s/cap 10s exponential backoff with jitter); a non-2xx
//! response is raised immediately as [`Error::UpstreamPermanent`] with
//! no internal retry — the engine's own retry tier decides whether to
//! try again.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::registry::ModelEntry;
use crate::task::{ChatMessage, TaskOptions};

use super::ProviderAdapter;

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_INTERNAL_RETRIES: u32 = 3;
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 10.0;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(flatten)]
    extras: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

pub struct OpenAiAdapter {
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .expect("failed to build provider HTTP client");
        Self { client }
    }

    fn endpoint(model: &ModelEntry) -> String {
        let base = model.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    #[tracing::instrument(skip(self, messages, options, extras), fields(model = %model.name))]
    async fn chat_completion(
        &self,
        model: &ModelEntry,
        messages: &[ChatMessage],
        options: &TaskOptions,
        extras: &Map<String, Value>,
    ) -> Result<String> {
        let url = Self::endpoint(model);
        let body = ChatCompletionRequest {
            model: &model.name,
            messages,
            temperature: options.temperature.or(Some(model.default_temperature)),
            max_tokens: options.max_tokens.or(Some(model.max_tokens)),
            extras: extras.clone(),
        };

        let mut attempt = 0u32;
        loop {
            let mut request = self.client.post(&url).json(&body);
            if let Some(token) = &model.credentials {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: ChatCompletionResponse = response.json().await.map_err(Error::Http)?;
                        let content = parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.message.content)
                            .unwrap_or_default();
                        return Ok(content);
                    }

                    let status_code = status.as_u16();
                    let text = response.text().await.unwrap_or_default();
                    return Err(Error::UpstreamPermanent { status: status_code, body: text });
                }
                Err(err) => {
                    if attempt >= MAX_INTERNAL_RETRIES {
                        return Err(Error::UpstreamTransient(err.to_string()));
                    }
                    let delay = backoff_delay(attempt);
                    tracing::warn!(attempt, error = %err, delay_secs = delay.as_secs_f64(), "transient provider error, retrying internally");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = (BACKOFF_BASE_SECS * 2f64.powi(attempt as i32)).min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.0..0.25 * base);
    Duration::from_secs_f64(base + jitter)
}
