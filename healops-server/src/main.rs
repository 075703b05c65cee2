use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, Level};

use healops_core::{build_chat_client, InMemoryRetrieval};
use healops_server::api::router;
use healops_server::bus::{EventBus, EventRecorder};
use healops_server::config::Config;
use healops_server::github::{GitHost, GitHubClient, PrAutomation};
use healops_server::ingest::Ingestor;
use healops_server::metrics::Metrics;
use healops_server::notify::ChatNotifier;
use healops_server::orchestrator::Orchestrator;
use healops_server::proposal::ProposalGenerator;
use healops_server::queue::{spawn_workers, InProcessQueue, WORKER_COUNT};
use healops_server::repository::SqliteRepository;
use healops_server::validator::ContainerValidator;
use healops_server::workflow::{GraphWorkflow, SequentialWorkflow, WorkflowStrategy};
use healops_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting HealOps CI failure recovery service");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    let db_path = config.state_dir.join("healops-state.db");
    info!("Using state database: {}", db_path.display());
    let repository =
        Arc::new(SqliteRepository::new(&db_path).expect("Failed to initialize SQLite database"));

    let bus = EventBus::new();
    let metrics = Arc::new(Metrics::new());
    let notifier = Arc::new(ChatNotifier::new(config.chat_webhook_url.clone()));
    let events = Arc::new(EventRecorder::new(repository.clone(), bus.clone()));

    let chat = build_chat_client(config.ai_provider, config.ai_api_key.clone());
    let retrieval = Arc::new(InMemoryRetrieval::new());
    let proposer = Arc::new(ProposalGenerator::new(
        chat,
        retrieval,
        config.ai_provider.as_str().to_string(),
        config.ai_model.clone(),
        config.safe_mode,
    ));

    let validator = Arc::new(ContainerValidator::new(
        config.validation_required,
        config.validation_command.clone(),
        config.validation_workdir.clone(),
        config.validation_timeout,
    ));

    let pr = match (&config.github_enabled, &config.github_token) {
        (true, Some(token)) => {
            info!("GitHub PR automation enabled (base branch {})", config.base_branch);
            let host: Arc<dyn GitHost> = Arc::new(GitHubClient::new(token.clone()));
            PrAutomation::new(Some(host), config.base_branch.clone())
        }
        _ => {
            info!("GitHub PR automation disabled");
            PrAutomation::disabled()
        }
    };

    let sequential: Arc<dyn WorkflowStrategy> =
        Arc::new(SequentialWorkflow::new(proposer.clone(), validator.clone()));
    let graph: Option<Arc<dyn WorkflowStrategy>> = if config.workflow_engine {
        info!("Graph workflow engine enabled");
        Some(Arc::new(GraphWorkflow::new(proposer.clone(), validator)))
    } else {
        None
    };

    let (queue, queue_rx) = InProcessQueue::new();
    let queue = Arc::new(queue);

    let orchestrator = Arc::new(Orchestrator::new(
        repository.clone(),
        queue.clone(),
        sequential,
        graph,
        proposer,
        Arc::new(pr),
        events.clone(),
        metrics.clone(),
        notifier.clone(),
    ));

    spawn_workers(WORKER_COUNT, queue_rx, orchestrator.clone());

    let ingestor = Ingestor::new(
        config.enabled,
        config.webhook_secret.clone(),
        config.max_attempts,
        repository.clone(),
        queue,
        events,
        metrics.clone(),
        notifier,
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        repository,
        ingestor,
        orchestrator,
        bus,
        metrics,
    });

    let app = router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
