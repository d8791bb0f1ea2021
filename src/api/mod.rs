/// API routes and handlers
pub mod api_keys;
pub mod audio;
pub mod auth_routes;
pub mod interactions;
pub mod middleware;
pub mod recommendations;
pub mod sessions;
pub mod telemetry;

use crate::context::AppContext;
use axum::Router;

/// Build API routes under /api/v1
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(auth_routes::routes())
        .merge(api_keys::routes())
        .merge(audio::routes())
        .merge(recommendations::routes())
        .merge(sessions::routes())
        .merge(interactions::routes())
        .merge(telemetry::routes())
}
