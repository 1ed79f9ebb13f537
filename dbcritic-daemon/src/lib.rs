pub mod config;
pub mod db;
pub mod github;
pub mod inference;
pub mod publisher;
pub mod reconciliation;
pub mod scheduler;
pub mod store;

use std::sync::Arc;

pub use store::MetricsStore;

use config::Config;
use github::PullRequestApi;
use inference::InferenceGate;

/// Shared state for the daemon: configuration plus the long-lived clients.
pub struct AppState {
    pub config: Config,
    pub github: Arc<dyn PullRequestApi>,
    pub gate: InferenceGate,
    pub store: MetricsStore,
}
