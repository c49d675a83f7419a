//! HTTP surface: feed management, the Atom document, entry pages, the WebSub
//! hub endpoint and enclosure downloads.

mod error;
mod feeds;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::Context;

pub use error::HttpError;
pub use feeds::{MAX_FIELD_CHARS, MAX_READS_PER_HOUR};

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/feeds", post(feeds::create_feed))
        .route(
            "/feeds/{feed}",
            get(feeds::show_feed)
                .patch(feeds::update_feed)
                .delete(feeds::delete_feed),
        )
        .route("/feeds/{feed}/entries/{entry}", get(feeds::entry_html))
        .route("/feeds/{feed}/websub", post(feeds::websub_hub))
        .route("/files/{enclosure}/{name}", get(feeds::enclosure))
        .with_state(ctx)
}

/// Serve the router until `cancel` fires, then drain open connections.
pub async fn serve(
    listener: TcpListener,
    ctx: Context,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
