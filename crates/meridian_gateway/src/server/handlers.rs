//! Connection handling logic for WebSocket clients.
//!
//! Every client gets two pumps that run until either finishes:
//!
//! * **Read pump**: forwards binary frames to the shared inbound queue and
//!   closes the connection when nothing arrives within the pong wait
//! * **Write pump**: drains the connection's outbound queue to the socket and
//!   sends a WebSocket ping every ping interval

use crate::connection::{ClientFrame, Connection, ConnectionManager};
use crate::error::ServerError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, trace, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Handles a single client connection from establishment to cleanup.
///
/// # Connection Flow
///
/// 1. Perform the WebSocket upgrade
/// 2. Register the connection with the connection manager
/// 3. Run the read and write pumps until one of them ends
/// 4. Close and remove the connection
///
/// # Returns
///
/// `Ok(())` once the connection is cleaned up, or a `ServerError` if the
/// WebSocket upgrade failed.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
) -> Result<(), ServerError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ServerError::Network(format!("WebSocket handshake failed: {e}")))?;
    let (ws_sender, ws_receiver) = ws_stream.split();

    let connection = manager.add_connection(addr).await;
    let config = manager.config();

    tokio::select! {
        _ = read_pump(
            ws_receiver,
            Arc::clone(&manager),
            connection.id.clone(),
            config.pong_wait(),
            config.max_message_size,
        ) => {},
        _ = write_pump(ws_sender, Arc::clone(&connection), config.ping_interval()) => {},
    }

    manager.remove_connection(&connection.id).await;
    Ok(())
}

async fn read_pump(
    mut ws_receiver: WsSource,
    manager: Arc<ConnectionManager>,
    connection_id: String,
    pong_wait: Duration,
    max_message_size: usize,
) {
    loop {
        let next = match timeout(pong_wait, ws_receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!("⏰ No traffic from {} for {:?}, closing", connection_id, pong_wait);
                break;
            }
        };

        match next {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > max_message_size {
                    warn!(
                        "⚠️ Dropping {} byte frame from {} (limit {})",
                        data.len(),
                        connection_id,
                        max_message_size
                    );
                    continue;
                }
                let frame = ClientFrame {
                    connection_id: connection_id.clone(),
                    payload: data.to_vec(),
                };
                if !manager.submit(frame).await {
                    break;
                }
            }
            Some(Ok(Message::Text(_))) => {
                warn!("⚠️ Text frame from {} ignored", connection_id);
            }
            Some(Ok(Message::Close(_))) => {
                debug!("🔌 Client {} requested close", connection_id);
                break;
            }
            Some(Ok(_)) => trace!("Control frame from {}", connection_id),
            Some(Err(e)) => {
                debug!("WebSocket error for connection {}: {}", connection_id, e);
                break;
            }
            None => break,
        }
    }
}

async fn write_pump(mut ws_sender: WsSink, connection: Arc<Connection>, ping_interval: Duration) {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            next = connection.next_outbound() => match next {
                Some(frame) => {
                    if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                        debug!("Write to {} failed: {}", connection.id, e);
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
