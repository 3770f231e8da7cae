//! Configuration loading.
//!
//! Loads a JSON file named by the `MOLTBOT_CONFIG` environment variable
//! (default `./config.json`), overlaid with `MOLTBOT__`-prefixed
//! environment variables (double underscore splits nested keys), then
//! validates the result before any other component is constructed.
//!
//! ```ignore
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//! ```

use std::collections::HashMap;

use clap::Parser;
use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;

fn default_config_path() -> String {
    std::env::var("MOLTBOT_CONFIG").unwrap_or_else(|_| "./config.json".to_string())
}

/// CLI arguments shared by every subcommand.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Priority-scheduled LLM task dispatcher")]
pub struct Args {
    /// Path to the JSON configuration file.
    #[arg(short = 'f', long, env = "MOLTBOT_CONFIG", default_value_t = default_config_path())]
    pub config: String,

    /// Raise the log level to debug regardless of `log_level` in config.
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug, Clone)]
pub enum Command {
    /// Start the HTTP facade.
    Serve {
        /// Overrides `api_port` from the config file.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Execute a single task and print the result.
    Run {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
    },
}

/// Pre-registration entry for a model, loaded from the `models` map in
/// the config file at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfigEntry {
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

/// Pre-registration entry for a webhook, loaded from the `webhooks` map.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfigEntry {
    pub event: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// The full, validated application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent_tasks: usize,
    pub task_timeout: u64,
    pub retry_times: u32,
    pub model_selection_strategy: String,
    pub log_level: String,
    pub api_host: String,
    pub api_port: u16,
    pub models: HashMap<String, ModelConfigEntry>,
    pub webhooks: HashMap<String, WebhookConfigEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            task_timeout: 300,
            retry_times: 3,
            model_selection_strategy: "availability".to_string(),
            log_level: "info".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            models: HashMap::new(),
            webhooks: HashMap::new(),
        }
    }
}

const SELECTION_STRATEGIES: [&str; 4] = ["availability", "load", "cost", "random"];

impl Config {
    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Json::file(&args.config))
            .merge(Env::prefixed("MOLTBOT__").split("__"))
    }

    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config
            .validate()
            .map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::IllegalArgument(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.retry_times > 10 {
            return Err(Error::IllegalArgument(
                "retry_times must be at most 10".to_string(),
            ));
        }
        if !SELECTION_STRATEGIES.contains(&self.model_selection_strategy.as_str()) {
            return Err(Error::IllegalArgument(format!(
                "model_selection_strategy must be one of {:?}, got '{}'",
                SELECTION_STRATEGIES, self.model_selection_strategy
            )));
        }
        if self.api_port == 0 {
            return Err(Error::IllegalArgument("api_port must be nonzero".to_string()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}
