use flowforge_core::Result;
use flowforge_engine::{Engine, ExecutionStore, MemoryExecutionStore, MemoryWorkflowStore, WorkflowStore};
use flowforge_integration::{CredentialCipher, CredentialResolver, CredentialVault, MemoryCredentialVault};
use flowforge_scheduler::ScheduleDispatcher;
use flowforge_server::api::{AppState, router};
use flowforge_server::config::ServerConfig;
use flowforge_server::db::{PgCredentialVault, PgDatabaseClient, PgExecutionStore, PgWorkflowStore};
use flowforge_server::error::ServerError;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Stores {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    vault: Arc<dyn CredentialVault>,
}

async fn stores(config: &ServerConfig) -> Result<Stores, ServerError> {
    let Some(url) = &config.database_url else {
        tracing::warn!("no database configured, state is kept in memory");
        return Ok(Stores {
            workflows: Arc::new(MemoryWorkflowStore::new()),
            executions: Arc::new(MemoryExecutionStore::new()),
            vault: Arc::new(MemoryCredentialVault::new()),
        });
    };

    let database = |e: &dyn std::fmt::Display| ServerError::Database {
        reason: e.to_string(),
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .map_err(|e| database(&e))?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| database(&e))?;

    Ok(Stores {
        workflows: Arc::new(PgWorkflowStore::new(pool.clone())),
        executions: Arc::new(PgExecutionStore::new(pool.clone())),
        vault: Arc::new(PgCredentialVault::new(pool)),
    })
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowforge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().map_err(|e| ServerError::Config {
        reason: e.to_string(),
    })?;
    tracing::info!(listen_addr = %config.listen_addr, "Loaded configuration");

    let key = config
        .credential_key_bytes()
        .map_err(|e| ServerError::CredentialKey {
            reason: e.to_string(),
        })?;
    let cipher = CredentialCipher::new(&key).map_err(|report| ServerError::CredentialKey {
        reason: report.current_context().to_string(),
    })?;

    let stores = stores(&config).await?;
    let credentials = CredentialResolver::new(stores.vault, cipher);

    let engine = Engine::builder(stores.workflows, stores.executions, Arc::new(credentials.clone()))
        .database(Arc::new(PgDatabaseClient::new()))
        .config(config.engine.clone())
        .build()
        .map_err(|report| ServerError::Engine {
            reason: report.current_context().to_string(),
        })?;

    let shutdown = CancellationToken::new();
    let dispatcher = ScheduleDispatcher::new(Arc::new(engine.clone()), config.scheduler.clone());
    let scheduler = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };

    let app = router(AppState {
        engine: engine.clone(),
        credentials,
    });

    let serve_error = |e: std::io::Error| ServerError::Serve {
        addr: config.listen_addr.clone(),
        reason: e.to_string(),
    };
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(serve_error)?;
    tracing::info!("Listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(serve_error)?;

    engine.shutdown();
    if let Err(e) = scheduler.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}
