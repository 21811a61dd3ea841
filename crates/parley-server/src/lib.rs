pub mod config;

use std::path::Path;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use parley_gateway::Hub;
use parley_gateway::connection::{self, ConnectRequest, GroupParams, PeerParams};

#[derive(Clone)]
pub struct ServerState {
    pub hub: Hub,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    peer_sessions: usize,
    group_sessions: usize,
}

/// Build the HTTP surface. `media_dir` is served under `/media` when the
/// local media backend is in use.
pub fn router(state: ServerState, media_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws/peer", get(peer_upgrade))
        .route("/ws/group", get(group_upgrade))
        .route("/health", get(health))
        .with_state(state);

    if let Some(dir) = media_dir {
        app = app.nest_service("/media", ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn peer_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<PeerParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| connection::handle_socket(socket, state.hub, ConnectRequest::Peer(params)))
}

async fn group_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<GroupParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| connection::handle_socket(socket, state.hub, ConnectRequest::Group(params)))
}

async fn health(State(state): State<ServerState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        peer_sessions: state.hub.peer_count().await,
        group_sessions: state.hub.group_count().await,
    })
}
