use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leadgen_orchestrator::config::Config;
use leadgen_orchestrator::db::Database;
use leadgen_orchestrator::db_storage::PgStore;
use leadgen_orchestrator::handlers::{self, AppState};
use leadgen_orchestrator::orchestrator::{
    recover_interrupted_flows, Collaborators, LeadGenWorkflow, TokioLauncher,
};
use leadgen_orchestrator::services::{
    HttpBillingService, HttpCrawlService, HttpLlmService, HttpScrapeService, HttpSearchService,
};
use leadgen_orchestrator::store::{FlowStore, MemoryStore};

/// Starts the lead-generation service.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - The flow store (Postgres when configured, in-memory otherwise).
/// - External collaborator clients.
/// - Relaunching flows interrupted by a previous shutdown.
/// - HTTP routes and middleware (CORS, Rate Limiting).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leadgen_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let store: Arc<dyn FlowStore> = match config.database_url {
        Some(ref url) => {
            let db = Database::new(url).await?;
            tracing::info!("Database connection pool established");
            Arc::new(PgStore::new(db.pool))
        }
        None => {
            tracing::warn!("⚠ Using in-memory store, flows will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let collaborators = Collaborators {
        search: Arc::new(HttpSearchService::new(&config)?),
        crawl: Arc::new(HttpCrawlService::new(&config)?),
        scrape: Arc::new(HttpScrapeService::new(&config)?),
        llm: Arc::new(HttpLlmService::new(&config)?),
        billing: Arc::new(HttpBillingService::new(&config)?),
    };
    tracing::info!("Collaborator clients initialized");

    let workflow = Arc::new(LeadGenWorkflow::new(
        store.clone(),
        collaborators,
        config.workflow_settings(),
        config.audit_settings(),
    ));
    let launcher = Arc::new(TokioLauncher::new(workflow.clone()));

    match recover_interrupted_flows(store.as_ref(), launcher.as_ref()).await {
        Ok(0) => tracing::info!("No interrupted flows to recover"),
        Ok(count) => tracing::info!("Recovered {} interrupted flows", count),
        Err(e) => tracing::error!("Failed to recover interrupted flows: {}", e),
    }

    let app_state = Arc::new(AppState { workflow, launcher });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    // Rate limiting and body limit apply to the API; health bypasses them
    let api = handlers::api_routes().layer(
        ServiceBuilder::new()
            .layer(handlers::body_limit())
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );
    let app = handlers::app(app_state, api);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
