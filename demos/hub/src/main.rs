//! Demo hub: accepts worker connections and hands each one a job.
//!
//! Run with: cargo run -p tether-hub-demo
//!
//! Then start a worker with `TETHER_URL=ws://127.0.0.1:9000/ws`.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_core::{CorrelationId, Envelope, commands};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    /// Command line handed to every worker that says hello.
    job_command: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let state = AppState {
        job_command: std::env::var("HUB_JOB_COMMAND")
            .unwrap_or_else(|_| "echo hello from tether".to_owned()),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 9000));
    tracing::info!("Hub listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let authorized = headers.contains_key("authorization");
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

async fn handle_socket(socket: WebSocket, state: AppState, authorized: bool) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let worker = Uuid::new_v4();
    tracing::info!(%worker, authorized, "Worker connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize envelope: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Invalid envelope: {e}");
                continue;
            }
        };

        match envelope.command.as_str() {
            commands::HELLO => {
                tracing::info!(%worker, hello = %envelope.data, "Worker announced itself");
                if envelope.data["free"].as_u64().unwrap_or(0) > 0 {
                    let _ = tx.send(request(
                        commands::RUN,
                        json!({
                            "job_id": Uuid::new_v4().to_string(),
                            "params": { "command": state.job_command },
                        }),
                    ));
                }
                let _ = tx.send(request(commands::LIST_RUNNING, Value::Null));
            }
            commands::REPLY => {
                tracing::info!(%worker, correlation_id = ?envelope.correlation_id, reply = %envelope.data, "Reply");
            }
            commands::ERROR => {
                tracing::warn!(%worker, correlation_id = ?envelope.correlation_id, error = %envelope.error_message(), "Error reply");
            }
            commands::JOB_FINISHED => {
                tracing::info!(%worker, result = %envelope.data, "Job finished");
            }
            commands::PING => {
                if let Some(id) = envelope.correlation_id {
                    let _ = tx.send(Envelope::reply(id, json!("PONG")));
                }
            }
            other => tracing::debug!(%worker, command = other, data = %envelope.data, "Notification"),
        }
    }

    send_task.abort();
    tracing::info!(%worker, "Worker disconnected");
}

fn request(command: &str, data: Value) -> Envelope {
    Envelope::new(command, data).with_correlation(CorrelationId::random())
}
