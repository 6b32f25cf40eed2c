//! RPC HTTP Server
//!
//! Axum-based HTTP server that accepts JSON-RPC requests on `/json_rpc`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::rpc::methods::{handle_request, JsonRpcRequest, JsonRpcResponse, RpcState};

/// Build the router serving JSON-RPC
pub fn rpc_router(state: Arc<RpcState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/json_rpc", post(handle_rpc))
        .route("/", post(handle_rpc))
        .layer(cors)
        .with_state(state)
}

/// Serve JSON-RPC on `addr` until the listener fails
pub async fn start_rpc_server(state: Arc<RpcState>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "RPC server listening");
    axum::serve(listener, rpc_router(state)).await
}

/// Handle incoming JSON-RPC requests
///
/// Core calls take the state lock, so they run on the blocking pool.
async fn handle_rpc(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<JsonRpcRequest>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    let id = request.id.clone();
    match tokio::task::spawn_blocking(move || handle_request(&state, request)).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(JsonRpcResponse::error(id, -32603, format!("internal error: {}", err))),
        ),
    }
}
