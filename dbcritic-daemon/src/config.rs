use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

/// Fixed allowance for GitHub round-trips within one work item, on top of
/// the inference budget. The per-item timeout must clear both.
pub const API_BUDGET_SECS: u64 = 60;

/// Configuration for the review daemon, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub github_token: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub model_path: PathBuf,
    pub llama_bin: String,
    pub db_path: PathBuf,
    pub check_interval_secs: u64,
    pub inference_timeout_secs: u64,
    pub work_item_timeout_secs: u64,
    pub engine: EngineSettings,
}

/// Performance and memory knobs for the inference engine. These trade
/// throughput against RAM; they never change review behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub context_size: u32,
    pub batch_size: u32,
    pub thread_count: u32,
}

/// RAM-budget presets for the engine knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTier {
    Small,
    Standard,
    Large,
}

impl ResourceTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Some(ResourceTier::Small),
            "standard" => Some(ResourceTier::Standard),
            "large" => Some(ResourceTier::Large),
            _ => None,
        }
    }

    pub fn settings(self) -> EngineSettings {
        match self {
            // Small fits a single-board computer with ~1 GiB free.
            ResourceTier::Small => EngineSettings {
                context_size: 512,
                batch_size: 4,
                thread_count: 2,
            },
            ResourceTier::Standard => EngineSettings {
                context_size: 2048,
                batch_size: 64,
                thread_count: 4,
            },
            ResourceTier::Large => EngineSettings {
                context_size: 4096,
                batch_size: 256,
                thread_count: 8,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required: GITHUB_TOKEN, REPO_OWNER, REPO_NAME, MODEL_PATH.
    /// Optional: LLAMA_BIN, DB_PATH, CHECK_INTERVAL, INFERENCE_TIMEOUT,
    /// WORK_ITEM_TIMEOUT, RESOURCE_TIER, and per-knob overrides
    /// CONTEXT_SIZE, BATCH_SIZE, THREAD_COUNT.
    pub fn from_env() -> Result<Self> {
        let github_token =
            env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable is required")?;
        let repo_owner =
            env::var("REPO_OWNER").context("REPO_OWNER environment variable is required")?;
        let repo_name =
            env::var("REPO_NAME").context("REPO_NAME environment variable is required")?;
        let model_path = env::var("MODEL_PATH")
            .context("MODEL_PATH environment variable is required")
            .map(PathBuf::from)?;

        let llama_bin = env::var("LLAMA_BIN").unwrap_or_else(|_| "llama-cli".to_string());
        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/pr_tracker.db"));

        let check_interval_secs = env::var("CHECK_INTERVAL")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .context("CHECK_INTERVAL must be a valid number of seconds")?;
        let inference_timeout_secs = env::var("INFERENCE_TIMEOUT")
            .unwrap_or_else(|_| "120".to_string())
            .parse::<u64>()
            .context("INFERENCE_TIMEOUT must be a valid number of seconds")?;
        let work_item_timeout_secs = env::var("WORK_ITEM_TIMEOUT")
            .unwrap_or_else(|_| "540".to_string())
            .parse::<u64>()
            .context("WORK_ITEM_TIMEOUT must be a valid number of seconds")?;
        validate_timeouts(inference_timeout_secs, work_item_timeout_secs)?;

        let tier = match env::var("RESOURCE_TIER") {
            Ok(v) => ResourceTier::parse(&v).with_context(|| {
                format!("RESOURCE_TIER must be small, standard or large (got {:?})", v)
            })?,
            Err(_) => ResourceTier::Small,
        };
        let mut engine = tier.settings();
        if let Some(v) = optional_knob("CONTEXT_SIZE")? {
            engine.context_size = v;
        }
        if let Some(v) = optional_knob("BATCH_SIZE")? {
            engine.batch_size = v;
        }
        if let Some(v) = optional_knob("THREAD_COUNT")? {
            engine.thread_count = v;
        }

        Ok(Config {
            github_token,
            repo_owner,
            repo_name,
            model_path,
            llama_bin,
            db_path,
            check_interval_secs,
            inference_timeout_secs,
            work_item_timeout_secs,
            engine,
        })
    }
}

fn optional_knob(name: &str) -> Result<Option<u32>> {
    match env::var(name) {
        Ok(v) => {
            let parsed = v
                .parse::<u32>()
                .with_context(|| format!("{} must be a valid number", name))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

/// The per-item timeout must leave room for one inference call plus the
/// GitHub round-trips, otherwise a healthy slow item would be cut off
/// every single cycle.
pub fn validate_timeouts(inference_timeout_secs: u64, work_item_timeout_secs: u64) -> Result<()> {
    if work_item_timeout_secs <= inference_timeout_secs + API_BUDGET_SECS {
        bail!(
            "WORK_ITEM_TIMEOUT ({}s) must be strictly greater than INFERENCE_TIMEOUT ({}s) plus the {}s API budget",
            work_item_timeout_secs,
            inference_timeout_secs,
            API_BUDGET_SECS
        );
    }
    Ok(())
}
