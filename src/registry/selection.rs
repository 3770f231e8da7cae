//! Selection strategies: the policy that picks a model from the
//! available set when a task carries no binding hint.

use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::registry::ModelEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// `score = weight * success_rate - avg_response_time / 10`, sorted
    /// descending, uniform pick from the top `min(3, n)`.
    Availability,
    /// Smallest cumulative usage counter; ties by registration order.
    Load,
    /// Smallest `cost_per_token`; ties by higher weight.
    Cost,
    /// Uniform over the available set.
    Random,
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "availability" => Ok(Self::Availability),
            "load" => Ok(Self::Load),
            "cost" => Ok(Self::Cost),
            "random" => Ok(Self::Random),
            other => Err(Error::IllegalArgument(format!(
                "unknown model_selection_strategy '{other}'"
            ))),
        }
    }
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::Availability
    }
}

/// Pick one entry from `models` (assumed already filtered to
/// available) according to `strategy`. Returns `None` on an empty set.
pub fn pick<'a>(models: &[&'a ModelEntry], strategy: SelectionStrategy) -> Option<&'a ModelEntry> {
    if models.is_empty() {
        return None;
    }

    match strategy {
        SelectionStrategy::Availability => pick_availability(models),
        SelectionStrategy::Load => pick_load(models),
        SelectionStrategy::Cost => pick_cost(models),
        SelectionStrategy::Random => {
            let mut rng = rand::thread_rng();
            models.choose(&mut rng).copied()
        }
    }
}

fn pick_availability<'a>(models: &[&'a ModelEntry]) -> Option<&'a ModelEntry> {
    let mut ranked: Vec<&ModelEntry> = models.to_vec();
    ranked.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(std::cmp::Ordering::Equal));
    let k = ranked.len().min(3);
    let mut rng = rand::thread_rng();
    let idx = rng.gen_range(0..k);
    ranked.into_iter().nth(idx)
}

fn pick_load<'a>(models: &[&'a ModelEntry]) -> Option<&'a ModelEntry> {
    models
        .iter()
        .copied()
        .min_by_key(|m| (m.usage_count, m.seq))
}

fn pick_cost<'a>(models: &[&'a ModelEntry]) -> Option<&'a ModelEntry> {
    models.iter().copied().min_by(|a, b| {
        a.cost_per_token
            .partial_cmp(&b.cost_per_token)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.weight.cmp(&a.weight))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, weight: u32, success_rate: f64, avg_response_time: f64, usage_count: u64, cost: f64, seq: u64) -> ModelEntry {
        ModelEntry {
            name: name.to_string(),
            provider: "openai".to_string(),
            credentials: None,
            base_url: None,
            max_tokens: 4096,
            default_temperature: 0.7,
            available: true,
            weight,
            avg_response_time,
            success_rate,
            cost_per_token: cost,
            usage_count,
            seq,
        }
    }

    #[test]
    fn load_strategy_picks_smallest_usage_ties_by_seq() {
        let a = entry("a", 10, 1.0, 0.0, 5, 0.0, 0);
        let b = entry("b", 10, 1.0, 0.0, 2, 0.0, 1);
        let c = entry("c", 10, 1.0, 0.0, 2, 0.0, 2);
        let picked = pick(&[&a, &b, &c], SelectionStrategy::Load).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn cost_strategy_picks_cheapest_ties_by_higher_weight() {
        let a = entry("a", 10, 1.0, 0.0, 0, 0.01, 0);
        let b = entry("b", 50, 1.0, 0.0, 0, 0.01, 1);
        let c = entry("c", 10, 1.0, 0.0, 0, 0.05, 2);
        let picked = pick(&[&a, &b, &c], SelectionStrategy::Cost).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn availability_strategy_never_picks_outside_top_three() {
        let a = entry("a", 20, 1.0, 0.0, 0, 0.0, 0);
        let b = entry("b", 15, 1.0, 0.0, 0, 0.0, 1);
        let c = entry("c", 10, 1.0, 0.0, 0, 0.0, 2);
        let d = entry("d", 1, 0.1, 100.0, 0, 0.0, 3);
        let e = entry("e", 1, 0.1, 100.0, 0, 0.0, 4);
        for _ in 0..50 {
            let picked = pick(&[&a, &b, &c, &d, &e], SelectionStrategy::Availability).unwrap();
            assert!(
                matches!(picked.name.as_str(), "a" | "b" | "c"),
                "low-scoring models outside the top 3 must never be picked, got {}",
                picked.name
            );
        }
    }

    #[test]
    fn empty_set_returns_none() {
        assert!(pick(&[], SelectionStrategy::Random).is_none());
    }

    #[test]
    fn from_str_rejects_unknown_strategy() {
        assert!(SelectionStrategy::from_str("quantum").is_err());
        assert_eq!(SelectionStrategy::from_str("cost").unwrap(), SelectionStrategy::Cost);
    }
}
