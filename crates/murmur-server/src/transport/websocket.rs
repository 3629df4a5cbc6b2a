//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, runs the HTTP upgrade, and hands finished
//! WebSocket streams to the server over a channel. Frames carry one JSON
//! envelope each; text and binary frames are both accepted inbound, outbound
//! frames are always text.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_core::{MurmurError, MurmurResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
pub type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Hard transport ceiling as a multiple of the configured frame limit.
/// Frames between the two limits are read and rejected with a `sys` error;
/// anything above the ceiling ends the connection.
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// tungstenite settings for a given inbound frame limit.
fn ws_config(max_frame_bytes: usize) -> WebSocketConfig {
    let ceiling = max_frame_bytes.saturating_mul(TRANSPORT_LIMIT_FACTOR);
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(ceiling);
    config.max_frame_size = Some(ceiling);
    config
}

/// Start the WebSocket listener on `bind_addr` (`host:port`, port 0 picks one).
///
/// Returns the bound address and a receiver that yields accepted
/// connections. The accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: &str,
    max_frame_bytes: usize,
) -> MurmurResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let config = ws_config(max_frame_bytes);
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| MurmurError::Transport(format!("WS bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let handshake =
                            tokio_tungstenite::accept_async_with_config(stream, Some(config));
                        match handshake.await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!(addr = %local_addr, "WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

/// Send one text frame.
pub async fn ws_send_text(sink: &mut WsSink, frame: String) -> MurmurResult<()> {
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| MurmurError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame and flush. Errors are ignored; the peer may be gone.
pub async fn ws_close(sink: &mut WsSink) {
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Receive the next data frame (text or binary) as raw bytes.
///
/// Returns `None` once the peer closes. Control frames are handled by
/// tungstenite and skipped here.
pub async fn ws_recv(stream: &mut WsStream) -> MurmurResult<Option<Vec<u8>>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
            Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(MurmurError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_ceiling_follows_frame_limit() {
        let config = ws_config(4096);
        assert_eq!(config.max_message_size, Some(4 * 4096));
        assert_eq!(config.max_frame_size, Some(4 * 4096));

        let config = ws_config(usize::MAX);
        assert_eq!(config.max_message_size, Some(usize::MAX));
    }
}
