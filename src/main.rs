/// GAL resolver - group membership resolution for the global address list
///
/// Resolves mail groups, including nested groups, to their member contacts
/// and serves the result over HTTP and, optionally, LDAP.

mod api;
mod config;
mod context;
mod db;
mod directory;
mod dispatch;
mod error;
mod format;
mod jobs;
mod ldap;
mod metrics;
mod resolver;
mod server;

use config::{LoggingConfig, ServerConfig};
use context::AppContext;
use error::ResolverResult;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ResolverResult<()> {
    // Load configuration
    let config = ServerConfig::from_env()?;

    // Initialize logging
    init_tracing(&config.logging);

    // Create application context
    let ctx = AppContext::new(config).await?;
    let ctx = Arc::new(ctx);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start the LDAP front end next to HTTP
    if ctx.config.ldap.enabled {
        let listener =
            ldap::LdapListener::bind(&ctx.config.ldap, Arc::clone(&ctx.dispatcher)).await?;
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                tracing::error!("LDAP listener stopped: {}", e);
            }
        });
    }

    // Start server
    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| EnvFilter::new("gal_resolver=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
