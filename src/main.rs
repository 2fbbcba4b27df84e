use anyhow::{Context, Result};
use axum::Router;
use image_intake::{
    config::AppConfig,
    db,
    models::thumbnail::default_specs,
    routes::routes::{AppState, routes},
    services::{
        classifier::{ContentClassifier, VisionClient},
        counter::CounterTransaction,
        document_store::SqliteDocumentStore,
        event_filter::EventFilter,
        fan_out::ThumbnailFanOut,
        moderation::ModerationOrchestrator,
        storage_service::StorageService,
    },
    triggers::{EventBus, MOVES_COUNT_FIELD, Triggers},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        database_url = %cfg.database_url,
        classifier_endpoint = %cfg.classifier_endpoint,
        threshold = %cfg.likelihood_threshold,
        exhaustion_policy = ?cfg.exhaustion_policy,
        "starting image-intake"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Stores publish onto the trigger bus ---
    let (bus, events) = EventBus::channel();
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone()).with_events(bus.clone());
    let documents = SqliteDocumentStore::new(db.clone()).with_events(bus);

    // --- Pipeline components ---
    let store = Arc::new(storage.clone());
    let specs = default_specs();
    let vision = VisionClient::new(
        cfg.classifier_endpoint.clone(),
        cfg.classifier_api_key.clone(),
        cfg.classifier_timeout,
    )
    .context("building classifier HTTP client")?;
    let classifier = ContentClassifier::new(Arc::new(vision), cfg.likelihood_threshold);
    let fan_out = ThumbnailFanOut::new(store.clone(), specs.clone());
    let orchestrator = ModerationOrchestrator::new(store.clone(), classifier, fan_out)
        .with_blur_sigma(cfg.blur_sigma)
        .with_classifier_input(cfg.classifier_input);
    let counter = CounterTransaction::new(
        Arc::new(documents.clone()),
        MOVES_COUNT_FIELD,
        cfg.counter_max_attempts,
    );
    let triggers = Arc::new(Triggers::new(
        store,
        EventFilter::new(specs),
        orchestrator,
        counter,
        cfg.exhaustion_policy,
    ));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let dispatcher = tokio::spawn(triggers.run(events, async {
        let _ = stop_rx.await;
    }));

    // --- Build router ---
    let app: Router = routes().with_state(AppState { storage, documents });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Pipeline writes keep the bus open, so stop the dispatcher explicitly
    // and let in-flight triggers finish.
    let _ = stop_tx.send(());
    dispatcher.await.context("trigger dispatcher panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
