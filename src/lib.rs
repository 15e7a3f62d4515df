pub mod backoff;
pub mod bloom;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod identity;
pub mod keyspace;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod repo;
pub mod rest;
pub mod scheduler;
pub mod store;
pub mod subscriptions;

use std::sync::Arc;

use config::CodeqConfig;
use metrics::SharedMetrics;
use scheduler::SchedulerService;
use store::Store;
use subscriptions::SubscriptionStore;

/// Shared application state passed to every request handler and background
/// task. Everything in here is either immutable configuration or an `Arc`
/// to a component that does its own coordination — all cross-handler state
/// lives in the storage backend.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<CodeqConfig>,
    pub scheduler: Arc<SchedulerService>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub metrics: SharedMetrics,
    /// `None` when running against the in-memory repository (tests, local
    /// development) — healthz then skips the store ping.
    pub store: Option<Store>,
    pub started_at: std::time::Instant,
}
