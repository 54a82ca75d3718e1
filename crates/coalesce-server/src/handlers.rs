//! Connection handlers.
//!
//! Each WebSocket connection registers with the reactor, forwards decoded
//! requests to it and writes whatever the reactor queues back.

use crate::config::Config;
use crate::metrics::{self, ConnectionGauge};
use crate::reactor::{Reactor, ReactorHandle};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::{Bytes, BytesMut};
use coalesce_core::SubscriberId;
use coalesce_protocol::{codec, codes, Frame, ProtocolError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the broadcast reactor.
    pub reactor: ReactorHandle,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (reactor, handle) = Reactor::new(config.registry_config(), config.reactor_config());
    let reactor_task = tokio::spawn(reactor.run());

    let state = Arc::new(AppState {
        reactor: handle.clone(),
        config: config.clone(),
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Coalesce server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Deliver whatever is still batched before exiting
    if handle.shutdown().await.is_ok() {
        reactor_task.await?;
    }

    info!("Coalesce server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size + codec::LENGTH_PREFIX_SIZE + 512)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _gauge = ConnectionGauge::open();
    let (mut sender, mut receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let id = match state.reactor.connect(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Connection refused");
            let _ = send_frame(&mut sender, &Frame::error(0, codes::CONNECTION_REFUSED, e.to_string()))
                .await;
            return;
        }
    };

    debug!(connection = %id, "WebSocket connected");

    let connected = Frame::connected(id.to_string(), advertised_heartbeat(&state.config));
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %id, "Failed to send Connected frame");
        disconnect(&state, id).await;
        return;
    }

    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let idle = time::sleep(timeout);
    tokio::pin!(idle);

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Frames queued by the reactor
            queued = outbound_rx.recv() => {
                let Some(data) = queued else {
                    debug!(connection = %id, "Reactor released connection");
                    break;
                };
                metrics::record_message(data.len(), "outbound");
                if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                idle.as_mut().reset(Instant::now() + timeout);

                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        read_buffer.extend_from_slice(&data);
                        if let Err(e) = drain_frames(&mut read_buffer, id, &state, &mut sender).await {
                            warn!(connection = %id, error = %e, "Closing connection");
                            metrics::record_error("frame");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                        if let Err(e) = drain_frames(&mut read_buffer, id, &state, &mut sender).await {
                            warn!(connection = %id, error = %e, "Closing connection");
                            metrics::record_error("frame");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            () = &mut idle => {
                debug!(connection = %id, "Heartbeat timeout");
                break;
            }
        }
    }

    disconnect(&state, id).await;
    debug!(connection = %id, "WebSocket disconnected");
}

/// Heartbeat interval announced in the `connected` frame, saturated to the
/// wire field's width.
fn advertised_heartbeat(config: &Config) -> u32 {
    u32::try_from(config.heartbeat.interval_ms).unwrap_or(u32::MAX)
}

async fn disconnect(state: &AppState, id: SubscriberId) {
    if let Err(e) = state.reactor.disconnect(id).await {
        debug!(connection = %id, error = %e, "Reactor gone before disconnect");
    }
}

/// Decode and handle every complete frame in `buf`.
async fn drain_frames(
    buf: &mut BytesMut,
    id: SubscriberId,
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    loop {
        match next_frame(buf) {
            Ok(Some((frame, consumed))) => {
                metrics::record_message(consumed, "inbound");
                handle_frame(frame, id, state, sender).await?;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                let _ = send_frame(sender, &Frame::error(0, codes::INVALID_FRAME, e.to_string())).await;
                return Err(e.into());
            }
        }
    }
}

/// Decode the next frame along with the number of wire bytes it took,
/// length prefix included.
fn next_frame(buf: &mut BytesMut) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let before = buf.len();
    let frame = codec::decode_from(buf)?;
    Ok(frame.map(|frame| (frame, before - buf.len())))
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    id: SubscriberId,
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    match frame {
        Frame::Subscribe { id: request, room } => {
            debug!(connection = %id, room = %room, "Subscribe request");
            state.reactor.subscribe(id, request, room).await?;
        }

        Frame::Unsubscribe { id: request, room } => {
            debug!(connection = %id, room = %room, "Unsubscribe request");
            state.reactor.unsubscribe(id, request, room).await?;
        }

        Frame::Publish {
            id: request,
            room,
            payload,
        } => {
            state.reactor.publish(id, request, room, payload).await?;
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(connection = %id, frame_type = ?other.frame_type(), "Unexpected frame type");
            send_frame(
                sender,
                &Frame::error(0, codes::INVALID_FRAME, "Unexpected frame type"),
            )
            .await?;
        }
    }

    Ok(())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_frame_reports_wire_length() {
        let subscribe = codec::encode(&Frame::subscribe(7, "lobby")).unwrap();
        let publish = codec::encode(&Frame::publish("lobby", b"payload".to_vec())).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&subscribe);
        buf.extend_from_slice(&publish);
        buf.extend_from_slice(&publish[..3]);

        let (frame, consumed) = next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::subscribe(7, "lobby"));
        assert_eq!(consumed, subscribe.len());

        let (frame, consumed) = next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type(), coalesce_protocol::FrameType::Publish);
        assert_eq!(consumed, publish.len());

        // Partial frame stays buffered
        assert!(next_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_advertised_heartbeat_saturates() {
        let mut config = Config::default();
        assert_eq!(advertised_heartbeat(&config), 30_000);

        config.heartbeat.interval_ms = u64::from(u32::MAX) + 1;
        assert_eq!(advertised_heartbeat(&config), u32::MAX);
    }
}
