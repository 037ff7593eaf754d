//! Serve a recorded interaction without a live upstream.
//!
//! Every request, whatever its method or path, is answered with the
//! recorded status and headers, and the body is replayed chunk by chunk
//! at the configured speed. Handy as a deterministic stand-in for an LLM
//! server in front-end or client tests.

use axum::{
    body::Body,
    extract::State,
    http::{Method, Uri},
    response::Response,
    routing::any,
    Router,
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::http::response;
use crate::recording::replay::Replay;

#[derive(Clone)]
struct ReplayState {
    replay: Arc<Replay>,
}

/// Router answering every request with `replay`.
pub fn replay_router(replay: Replay) -> Router {
    let state = ReplayState {
        replay: Arc::new(replay),
    };
    Router::new()
        .route("/{*path}", any(replay_handler))
        .route("/", any(replay_handler))
        .with_state(state)
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(set_request_id_layer())
}

/// Serve `replay` on `listener` until `shutdown` fires.
pub async fn serve_replay(
    listener: TcpListener,
    replay: Replay,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(
        address = %addr,
        recorded_url = %replay.interaction().request.url,
        speed = replay.speed().get(),
        "Replay server starting"
    );

    axum::serve(listener, replay_router(replay))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Replay server stopped");
    Ok(())
}

async fn replay_handler(State(state): State<ReplayState>, method: Method, uri: Uri) -> Response {
    let head = state.replay.head();
    tracing::debug!(
        method = %method,
        path = %uri.path(),
        status = %head.status,
        "Replaying recorded response"
    );

    let chunks = state.replay.chunks().map(Ok::<_, Infallible>);
    response::relay(head.status, &head.headers.to_header_map(), Body::from_stream(chunks))
}
