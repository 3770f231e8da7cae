//! Provider adapters: the polymorphic boundary between the engine and
//! whatever upstream generation API a model entry names.
//!
//! The engine depends only on the [`ProviderAdapter`] trait; concrete
//! providers are resolved from a tag-keyed [`ProviderRegistry`] at
//! dispatch time. An unknown tag falls back to the default
//! OpenAI-compatible adapter.

pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Map;

use crate::error::Result;
use crate::registry::ModelEntry;
use crate::task::{ChatMessage, TaskOptions};

pub use openai::OpenAiAdapter;

/// One upstream generation call, pure request/response. Implementors
/// own their own internal retry over transient transport errors; the
/// engine applies a second, outer retry tier on top (see
/// [`crate::engine`]).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn chat_completion(
        &self,
        model: &ModelEntry,
        messages: &[ChatMessage],
        options: &TaskOptions,
        extras: &Map<String, serde_json::Value>,
    ) -> Result<String>;

    /// Extension point for the embeddings capability. No core
    /// component calls this; it exists so a provider can opt in
    /// without widening the trait the engine depends on.
    async fn embeddings(
        &self,
        _model: &ModelEntry,
        _input: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        Err(crate::error::Error::IllegalArgument(
            "this provider adapter does not implement embeddings".to_string(),
        ))
    }
}

/// Maps a model's `provider` tag to the adapter that serves it.
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    default: Arc<dyn ProviderAdapter>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let openai = Arc::new(OpenAiAdapter::new());
        let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("openai".to_string(), openai.clone());
        Self { adapters, default: openai }
    }

    /// Register (or override) the adapter used for a provider tag.
    pub fn register(&mut self, tag: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(tag.into(), adapter);
    }

    /// Resolve the adapter for a tag, falling back to the default
    /// OpenAI-compatible adapter for unknown tags.
    pub fn resolve(&self, tag: &str) -> Arc<dyn ProviderAdapter> {
        self.adapters.get(tag).cloned().unwrap_or_else(|| self.default.clone())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
