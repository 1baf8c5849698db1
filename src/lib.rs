pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use api::{create_router, AppContext, AppState};
pub use config::{AppConfig, StorageBackend, VcsConfig};
pub use error::{VcsError, VcsResult, WithWarnings};
pub use logic::{
    BranchManager, DataBranching, MergeEngine, MigrationPlanner, ObjectDatabase, SchemaDiff,
};
pub use model::*;
pub use store::{MemoryStore, PostgresStore, Store};

/// Router with its state attached, ready to serve.
pub fn app<S: Store + 'static>(store: S, settings: VcsConfig) -> Router {
    create_router::<S>().with_state(Arc::new(AppContext::new(store, settings)))
}

/// Bootstrap the root branch, then serve on an already bound listener.
pub async fn serve<S: Store + 'static>(
    store: S,
    listener: TcpListener,
    settings: VcsConfig,
) -> anyhow::Result<()> {
    BranchManager::bootstrap(&store, &settings.default_author).await?;
    log::info!("vcdb server running on http://{}", listener.local_addr()?);
    axum::serve(listener, app(store, settings)).await?;
    Ok(())
}

/// Connect the configured backend and serve until shutdown.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.server_address()).await?;
    let ttl = config.vcs.snapshot_cache_ttl();

    match config.database.backend {
        StorageBackend::Memory => {
            log::warn!("using the in-memory backend; nothing will be persisted");
            serve(MemoryStore::with_snapshot_ttl(ttl), listener, config.vcs).await
        }
        StorageBackend::Postgres => {
            log::info!("connecting to PostgreSQL");
            let store = PostgresStore::new(&config.database_url(), config.max_connections())
                .await?
                .with_snapshot_ttl(ttl);
            store.migrate().await?;
            serve(store, listener, config.vcs).await
        }
    }
}
