//! The model registry: the set of known upstream models, their rolling
//! health/cost counters, and the policy that picks one per task.
//!
//! Entries live in a [`dashmap::DashMap`] keyed by model name: updates to
//! one model's counters never contend with reads or writes touching a
//! different model, which matters once `update_stats` is on the hot path
//! of every completed task. No I/O ever happens while an entry is held.

pub mod selection;

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::Task;
pub use selection::SelectionStrategy;

/// A registered upstream model and its rolling counters.
///
/// Mutated only by the [`ModelRegistry`] (metrics, availability);
/// `name` is unique within a registry for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub provider: String,
    #[serde(skip_serializing)]
    pub credentials: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub default_temperature: f32,
    pub available: bool,
    pub weight: u32,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub cost_per_token: f64,
    pub usage_count: u64,
    /// Registration order, used to break ties in the `load` strategy.
    pub(crate) seq: u64,
}

impl ModelEntry {
    fn score(&self) -> f64 {
        self.weight as f64 * self.success_rate - self.avg_response_time / 10.0
    }
}

/// Parameters accepted by [`ModelRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct ModelRegistration {
    pub name: String,
    pub provider: String,
    pub credentials: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub default_temperature: f32,
    pub weight: u32,
    pub cost_per_token: f64,
}

const SUCCESS_RATE_ALPHA: f64 = 0.01;

/// Holds every known model and chooses one per task under the
/// configured [`SelectionStrategy`].
pub struct ModelRegistry {
    models: DashMap<String, ModelEntry>,
    strategy: SelectionStrategy,
    seq: AtomicU64,
}

impl ModelRegistry {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            models: DashMap::new(),
            strategy,
            seq: AtomicU64::new(0),
        }
    }

    /// Upsert a model by name. Per spec, registering resets the usage
    /// counter and rolling metrics even if the name already existed.
    pub fn register(&self, reg: ModelRegistration) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = ModelEntry {
            name: reg.name.clone(),
            provider: reg.provider,
            credentials: reg.credentials,
            base_url: reg.base_url,
            max_tokens: reg.max_tokens,
            default_temperature: reg.default_temperature,
            available: true,
            weight: reg.weight.max(1),
            avg_response_time: 0.0,
            success_rate: 1.0,
            cost_per_token: reg.cost_per_token,
            usage_count: 0,
            seq,
        };
        self.models.insert(reg.name.clone(), entry);
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.models.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<ModelEntry> {
        self.models.get(name).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<ModelEntry> {
        self.models.iter().map(|e| e.clone()).collect()
    }

    pub fn set_available(&self, name: &str, available: bool) -> Result<()> {
        let mut entry = self.models.get_mut(name).ok_or_else(|| Error::NotFound(format!("model '{name}'")))?;
        entry.available = available;
        Ok(())
    }

    /// Select the model to dispatch `task` to. If the task carries a
    /// hint naming an available model, the hint wins and the policy is
    /// bypassed; an unknown or unavailable hint is treated as a
    /// preference, not a requirement, and the policy runs on the
    /// available set instead. Returns `None` if no model is available.
    pub fn select(&self, task: &Task) -> Option<ModelEntry> {
        if let Some(hint) = &task.model_hint {
            if let Some(entry) = self.models.get(hint) {
                if entry.available {
                    return Some(entry.clone());
                }
            }
        }

        let available: Vec<ModelEntry> = self.models.iter().filter(|e| e.available).map(|e| e.clone()).collect();
        let refs: Vec<&ModelEntry> = available.iter().collect();
        selection::pick(&refs, self.strategy).cloned()
    }

    /// Increment usage and update the rolling latency/success counters
    /// for one outer engine attempt. `latency_seconds` is ignored on
    /// failure per spec (recorded as `0.0`).
    pub fn update_stats(&self, name: &str, success: bool, latency_seconds: f64) {
        let Some(mut entry) = self.models.get_mut(name) else {
            return;
        };

        entry.usage_count += 1;
        let latency = if success { latency_seconds } else { 0.0 };
        entry.avg_response_time += (latency - entry.avg_response_time) / entry.usage_count as f64;

        let delta = if success { SUCCESS_RATE_ALPHA } else { -SUCCESS_RATE_ALPHA };
        entry.success_rate = (entry.success_rate * (1.0 - SUCCESS_RATE_ALPHA) + delta).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskOptions, TaskSubmission};

    fn task_with_hint(hint: Option<&str>) -> Task {
        Task::from_submission(TaskSubmission {
            prompt: "hi".to_string(),
            model_hint: hint.map(str::to_string),
            priority: Priority::Normal,
            options: TaskOptions::default(),
            ..Default::default()
        })
        .unwrap()
    }

    fn reg(name: &str, weight: u32) -> ModelRegistration {
        ModelRegistration {
            name: name.to_string(),
            provider: "openai".to_string(),
            weight,
            max_tokens: 4096,
            default_temperature: 0.7,
            ..Default::default()
        }
    }

    #[test]
    fn register_resets_counters_on_reupsert() {
        let registry = ModelRegistry::new(SelectionStrategy::Availability);
        registry.register(reg("gpt-x", 10));
        registry.update_stats("gpt-x", false, 0.0);
        registry.update_stats("gpt-x", false, 0.0);
        assert!(registry.get("gpt-x").unwrap().success_rate < 1.0);

        registry.register(reg("gpt-x", 10));
        let entry = registry.get("gpt-x").unwrap();
        assert_eq!(entry.success_rate, 1.0);
        assert_eq!(entry.usage_count, 0);
    }

    #[test]
    fn select_returns_none_with_no_models() {
        let registry = ModelRegistry::new(SelectionStrategy::Availability);
        assert!(registry.select(&task_with_hint(None)).is_none());
    }

    #[test]
    fn hint_wins_when_available() {
        let registry = ModelRegistry::new(SelectionStrategy::Availability);
        registry.register(reg("a", 10));
        registry.register(reg("b", 100));
        let task = task_with_hint(Some("a"));
        assert_eq!(registry.select(&task).unwrap().name, "a");
    }

    #[test]
    fn unavailable_hint_falls_back_to_policy() {
        let registry = ModelRegistry::new(SelectionStrategy::Load);
        registry.register(reg("a", 10));
        registry.register(reg("b", 10));
        registry.set_available("a", false).unwrap();
        let task = task_with_hint(Some("a"));
        assert_eq!(registry.select(&task).unwrap().name, "b");
    }

    #[test]
    fn success_rate_clamped_to_unit_interval() {
        let registry = ModelRegistry::new(SelectionStrategy::Availability);
        registry.register(reg("a", 10));
        for _ in 0..10_000 {
            registry.update_stats("a", true, 0.1);
        }
        let entry = registry.get("a").unwrap();
        assert!(entry.success_rate <= 1.0 && entry.success_rate >= 0.0);
    }

    #[test]
    fn deregister_removes_model() {
        let registry = ModelRegistry::new(SelectionStrategy::Availability);
        registry.register(reg("a", 10));
        assert!(registry.deregister("a"));
        assert!(registry.get("a").is_none());
    }
}
