pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

pub use routes::create_router;
pub use state::AppState;

use std::sync::Arc;
use tracing::info;

use crate::coordination::ShutdownToken;
use crate::daemon::Daemon;
use crate::error::{Result, SpiceError};

/// Serve the control API until shutdown is requested
pub async fn serve(daemon: Arc<Daemon>, bind: String, mut shutdown: ShutdownToken) -> Result<()> {
    let app = create_router(AppState::new(daemon));
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Control API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.wait_for_shutdown().await;
        })
        .await
        .map_err(|e| SpiceError::Internal(format!("API server error: {}", e)))
}
