/// Application context and dependency injection
use crate::{
    config::{DirectoryMode, ServerConfig},
    db,
    directory::{IdentityLookup, SnapshotDirectory, SqlDirectory},
    dispatch::QueryDispatcher,
    error::ResolverResult,
    resolver::ResolverLimits,
};
use std::sync::Arc;
use std::time::Instant;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub directory: Arc<dyn IdentityLookup>,
    pub dispatcher: Arc<QueryDispatcher>,
    /// Present only in snapshot mode, for the refresh job
    pub snapshot: Option<Arc<SnapshotDirectory>>,
    pub started_at: Instant,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> ResolverResult<Self> {
        // Validate configuration
        config.validate()?;

        // Initialize the database behind the address list view
        let pool = db::create_pool(
            &config.storage.database_path,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                ..Default::default()
            },
        )
        .await?;

        if config.storage.run_migrations {
            db::run_migrations(&pool).await?;
        }

        // Test connection
        db::test_connection(&pool).await?;

        let sql_directory = SqlDirectory::new(pool);

        let (directory, snapshot): (Arc<dyn IdentityLookup>, Option<Arc<SnapshotDirectory>>) =
            match config.storage.directory_mode {
                DirectoryMode::Sql => {
                    tracing::info!("Identity lookups go straight to the database");
                    let directory: Arc<dyn IdentityLookup> = Arc::new(sql_directory);
                    (directory, None)
                }
                DirectoryMode::Snapshot => {
                    let snapshot = Arc::new(SnapshotDirectory::new(sql_directory));
                    // Serve StoreUnavailable until the refresh job succeeds
                    if let Err(e) = snapshot.refresh().await {
                        tracing::warn!(error = %e, "Initial directory snapshot failed");
                    }
                    tracing::info!(
                        "Identity lookups served from a snapshot refreshed every {}s",
                        config.storage.snapshot_refresh_secs
                    );
                    let directory: Arc<dyn IdentityLookup> = snapshot.clone();
                    (directory, Some(snapshot))
                }
            };

        Ok(Self::assemble(config, directory, snapshot))
    }

    /// Build a context around an existing identity store
    pub fn with_directory(config: ServerConfig, directory: Arc<dyn IdentityLookup>) -> Self {
        Self::assemble(config, directory, None)
    }

    fn assemble(
        config: ServerConfig,
        directory: Arc<dyn IdentityLookup>,
        snapshot: Option<Arc<SnapshotDirectory>>,
    ) -> Self {
        let limits = ResolverLimits {
            max_depth: config.resolver.max_depth,
            timeout: config.resolver.timeout(),
        };
        let dispatcher = Arc::new(QueryDispatcher::new(Arc::clone(&directory), limits));

        Self {
            config: Arc::new(config),
            directory,
            dispatcher,
            snapshot,
            started_at: Instant::now(),
        }
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
