pub mod api;
pub mod bus;
pub mod config;
pub mod github;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod proposal;
pub mod queue;
pub mod repository;
pub mod stream;
pub mod validator;
pub mod workflow;

use std::sync::Arc;

use bus::EventBus;
use config::Config;
use ingest::Ingestor;
use metrics::Metrics;
use orchestrator::Orchestrator;
use repository::RunRepository;

/// Shared state for the HTTP surface.
pub struct AppState {
    pub config: Config,
    pub repository: Arc<dyn RunRepository>,
    pub ingestor: Ingestor,
    pub orchestrator: Arc<Orchestrator>,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
}
