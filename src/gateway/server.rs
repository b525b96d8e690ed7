//! WebSocket gateway server

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::ClientMessage;
use crate::config::GatewayConfig;
use crate::core::{BackendKind, EventSink, ExecutionRequest};
use crate::error::{Error, Result};
use crate::session::SessionManager;

// ---- App State ----

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub mode: BackendKind,
    pub sessions: usize,
}

// ---- Handlers ----

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        mode: state.manager.mode(),
        sessions: state.manager.session_count().await,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.manager))
}

/// Work queued for a connection's worker, in arrival order
enum Job {
    Init {
        language: String,
        runtime_image: String,
    },
    Run(ExecutionRequest),
    Stop,
}

/// A job tagged with the stop generation it was queued under
struct Queued {
    generation: u64,
    job: Job,
}

/// Process a connection's jobs one at a time; jobs queued before the latest
/// stop are answered with an error instead of being executed
async fn run_jobs(
    manager: Arc<SessionManager>,
    client_id: String,
    events: EventSink,
    stops: Arc<AtomicU64>,
    mut jobs: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some(Queued { generation, job }) = jobs.recv().await {
        let superseded = generation < stops.load(Ordering::SeqCst);
        match job {
            Job::Init { .. } | Job::Run(_) if superseded => {
                events.error(Error::Stopped.client_message(manager.mode()));
            }
            Job::Init {
                language,
                runtime_image,
            } => {
                manager
                    .init_session(&client_id, &events, &language, &runtime_image)
                    .await
            }
            Job::Run(request) => manager.run_code(&client_id, &events, request).await,
            Job::Stop => manager.stop_session(&client_id).await,
        }
    }
}

/// Drive one client connection until it closes
async fn handle_socket(socket: WebSocket, manager: Arc<SessionManager>) {
    let client_id = Uuid::new_v4().to_string();
    manager.connect(&client_id).await;

    let (events, mut event_rx) = EventSink::channel();
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialise event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // the reader never awaits session work, so a stop or a disconnect is
    // seen while a run or an image pull is in progress
    let stops = Arc::new(AtomicU64::new(0));
    let (job_tx, job_rx) = mpsc::unbounded_channel::<Queued>();
    let worker = tokio::spawn(run_jobs(
        manager.clone(),
        client_id.clone(),
        events.clone(),
        stops.clone(),
        job_rx,
    ));

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error for {}: {}", client_id, e);
                break;
            }
        };

        let job = match ClientMessage::parse(text.as_str()) {
            Ok(ClientMessage::InitSession {
                language,
                runtime_image,
            }) => Job::Init {
                language,
                runtime_image,
            },
            Ok(ClientMessage::RunCode(run)) => Job::Run(run.into()),
            Ok(ClientMessage::StopSession) => {
                stops.fetch_add(1, Ordering::SeqCst);
                manager.cancel_pending(&client_id).await;
                Job::Stop
            }
            Err(e) => {
                debug!("Rejected message from {}: {}", client_id, e);
                events.error(e.client_message(manager.mode()));
                continue;
            }
        };

        let generation = stops.load(Ordering::SeqCst);
        if job_tx.send(Queued { generation, job }).is_err() {
            break;
        }
    }

    // transport gone: nothing more is delivered, and the sandbox goes with it
    events.close();
    stops.fetch_add(1, Ordering::SeqCst);
    drop(job_tx);
    manager.disconnect(&client_id).await;
    if let Err(e) = worker.await {
        warn!("Worker for {} ended abnormally: {}", client_id, e);
    }
    drop(events);
    writer.abort();
}

// ---- Router ----

pub fn build_router(manager: Arc<SessionManager>, config: &GatewayConfig) -> Router {
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(AppState { manager })
        .layer(TraceLayer::new_for_http());

    if config.permissive_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Serve until Ctrl-C, then tear every session down
pub async fn serve(config: &GatewayConfig, manager: Arc<SessionManager>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid bind address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "Gateway listening on ws://{}/ws ({} sandboxes)",
        addr,
        manager.mode()
    );

    let app = build_router(manager.clone(), config);
    let shutdown_manager = manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down gateway...");
            shutdown_manager.shutdown().await;
        })
        .await?;

    // connections that raced the signal
    manager.shutdown().await;
    Ok(())
}
