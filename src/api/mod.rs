/// API routes and handlers
pub mod carddav;
pub mod groups;
pub mod health;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(groups::routes())
        .merge(carddav::routes())
        .merge(health::routes())
}
