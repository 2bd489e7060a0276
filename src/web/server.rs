//! Web server using Axum.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::router::create_app_router;
use crate::bureau::BureauState;

/// Serve the bureau's routes on `listener` until `shutdown` flips to true.
pub fn serve(
    listener: TcpListener,
    state: Arc<BureauState>,
    relay: bool,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let app = create_app_router(state, relay);

    tokio::spawn(async move {
        let signal = async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
        {
            tracing::error!("Web server error: {}", e);
        }
        tracing::debug!("Web server stopped");
    })
}
