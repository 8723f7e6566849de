//! Rendezvous HTTP server
//!
//! Serves the control WebSocket at `/signaling` and a health endpoint at
//! `/health`. Each socket gets a server-assigned client id; every text
//! frame is validated here and forwarded to the hub.

use super::hub::HubHandle;
use crate::config::ServerConfig;
use crate::protocol::{ClientId, ClientMessage, ServerMessage};
use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::HeaderValue,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

/// State shared by all HTTP handlers
#[derive(Debug, Clone)]
pub struct RendezvousState {
    pub hub: HubHandle,
}

/// Build the router (separate from `run` so tests can drive it)
pub fn router(state: Arc<RendezvousState>, cors_origin: Option<&str>) -> Router {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/signaling", get(signaling_handler))
        .with_state(state);

    match cors_origin {
        Some("*") => app.layer(CorsLayer::new().allow_origin(Any)),
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => app.layer(CorsLayer::new().allow_origin(value)),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                app
            }
        },
        None => app,
    }
}

/// Run the rendezvous server until the listener fails
pub async fn run_rendezvous_server(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (hub, _hub_task) = HubHandle::spawn(config.code_ttl(), config.sweep_interval());
    let state = Arc::new(RendezvousState { hub });
    let app = router(state, config.cors_origin.as_deref());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Rendezvous server listening on http://{}", addr);
    info!("Control WebSocket at ws://{}/signaling", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<Arc<RendezvousState>>) -> Json<Value> {
    let stats = state.hub.stats().await.unwrap_or_default();
    Json(json!({
        "status": "ok",
        "timestamp": unix_millis(),
        "stats": stats,
    }))
}

async fn signaling_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RendezvousState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_connection(socket, state))
}

/// Handle one control WebSocket for its whole lifetime
pub async fn handle_control_connection(socket: WebSocket, state: Arc<RendezvousState>) {
    let client_id = ClientId::generate();
    info!("New control connection {}", client_id);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Forward hub output to the socket
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode server message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    state.hub.attach(client_id.clone(), tx);

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                match ClientMessage::parse(text_str) {
                    Ok(message) => state.hub.inbound(client_id.clone(), message),
                    Err(e) => {
                        warn!("Invalid control message from {}: {}", client_id, e);
                        state.hub.reject(
                            client_id.clone(),
                            e.request_id(),
                            e.signal_error(),
                            e.to_string(),
                        );
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame from {}", client_id);
            }
            Ok(Message::Close(_)) => {
                info!("Control connection {} closed", client_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error on {}: {}", client_id, e);
                break;
            }
        }
    }

    state.hub.detach(client_id.clone());
    send_task.abort();
    info!("Control connection handler finished ({})", client_id);
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_reports_registry_stats() {
        let (hub, _task) = HubHandle::spawn(Duration::from_secs(300), Duration::from_secs(300));
        let state = Arc::new(RendezvousState { hub });

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].as_u64().unwrap() > 0);
        assert_eq!(body["stats"]["activePairingCodes"], 0);
        assert_eq!(body["stats"]["activeConnections"], 0);
    }
}
