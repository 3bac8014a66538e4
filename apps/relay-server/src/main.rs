//! WebSocket relay for collaborative field editing.
//!
//! Fans collaboration events out between the participants of a session and
//! arbitrates conflict resolutions (first commit wins). Payloads are never
//! inspected beyond routing and arbitration.

mod room;
mod ws;

use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use room::RoomManager;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "cofield-relay",
    about = "WebSocket relay for collaborative field editing"
)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
}

#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("relay_server=debug,cofield=debug")
        .init();

    let args = Args::parse();

    let state = AppState {
        rooms: Arc::new(RoomManager::new()),
    };

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/sessions", get(list_sessions))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("relay listening on {}", args.listen);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<serde_json::Value>> {
    Json(state.rooms.list())
}
