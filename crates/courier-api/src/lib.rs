pub mod auth;
pub mod chat;
pub mod friends;
pub mod middleware;
pub mod users;

use axum::http::StatusCode;
use tracing::error;

/// Handlers share the realtime state so they can publish events after a
/// successful mutation.
pub type AppState = courier_gateway::session::Gateway;

/// Run a storage closure off the async runtime, collapsing join and database
/// failures into a 500.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("database error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
