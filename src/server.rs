//! HTTP / WebSocket surface.
//!
//! Every connection gets a writer task that drains the peer's outbound queue
//! and a reader loop that feeds text frames to the coordinator. Whichever side
//! stops first, the connection ends through [`Rendezvous::disconnect`].

use crate::config::Config;
use crate::error::{Error, Result};
use crate::peer::ConnectionMetadata;
use crate::state::{Rendezvous, Session};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub fn router(rendezvous: Arc<Rendezvous>) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/server/webrtc", get(websocket_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(rendezvous)
}

/// Serves until the listener fails. Used directly by tests with an ephemeral port.
pub async fn serve(listener: TcpListener, rendezvous: Arc<Rendezvous>) -> Result<()> {
    let app = router(rendezvous).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn run(config: Config) -> Result<()> {
    let rendezvous = Rendezvous::new(config.settings());
    let app = router(rendezvous.clone()).into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!("Rendezvous server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped with {} peer(s) connected", rendezvous.peer_count());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn health_check() -> &'static str {
    "OK"
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    State(rendezvous): State<Arc<Rendezvous>>,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let meta = ConnectionMetadata {
        remote_addr,
        cf_connecting_ip: header("cf-connecting-ip"),
        forwarded_for: header("x-forwarded-for"),
        user_agent: header("user-agent"),
        peer_id: params.get("peer_id").cloned(),
        peer_id_hash: params.get("peer_id_hash").cloned(),
    };
    ws.on_upgrade(move |socket| handle_connection(socket, meta, rendezvous))
}

async fn handle_connection(socket: WebSocket, meta: ConnectionMetadata, rendezvous: Arc<Rendezvous>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = rendezvous.admit(&meta, tx);

    let writer_cancel = session.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                next = rx.recv() => {
                    let Some(text) = next else { break };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Flush whatever was queued before the cancel, then close.
        while let Ok(text) = rx.try_recv() {
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => on_text(&rendezvous, &session, &text),
                Some(Ok(Message::Binary(bytes))) => {
                    warn!("Ignoring {} byte binary frame from {}", bytes.len(), session.id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket error for {}: {}", session.id, e);
                    break;
                }
            },
        }
    }

    rendezvous.disconnect(&session);
    if let Err(e) = writer.await {
        debug!("Writer task for {} ended abnormally: {}", session.id, e);
    }
}

fn on_text(rendezvous: &Arc<Rendezvous>, session: &Arc<Session>, text: &str) {
    match rendezvous.handle_text(session, text) {
        Ok(()) => {}
        Err(e @ (Error::Malformed(_) | Error::NotAnObject)) => {
            warn!("Dropping envelope from {}: {}", session.id, e)
        }
        Err(e @ Error::RateLimited(_)) => warn!("{}", e),
        Err(e) => debug!("Dropping envelope from {}: {}", session.id, e),
    }
}
