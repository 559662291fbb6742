/// Background task implementations
use crate::{context::AppContext, directory::RefreshOutcome, error::ResolverResult};

/// Rebuild the snapshot if the context runs in snapshot mode
pub async fn refresh_snapshot(ctx: &AppContext) -> ResolverResult<Option<RefreshOutcome>> {
    match &ctx.snapshot {
        Some(snapshot) => snapshot.refresh().await.map(Some),
        None => Ok(None),
    }
}

/// Health check - verify the identity store answers
pub async fn health_check(ctx: &AppContext) -> ResolverResult<()> {
    ctx.directory.health_check().await
}
