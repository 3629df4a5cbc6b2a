//! Session multiplexer: drives one WebSocket connection.
//!
//! The socket is split. A writer task owns the sink and drains the session's
//! bounded outbound queue; the reader loop below, the channel forwarders and
//! the shutdown notice all write through that queue, so frames never
//! interleave. The reader handles one request at a time.

use super::Session;
use crate::controller::Controller;
use crate::transport::websocket::{self, WebSocketConnection, WsSink};
use futures_util::StreamExt;
use murmur_core::{frame_decode_bytes, frame_encode, ClientEnvelope, ErrorKind, ServerEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// How long the writer gets to flush queued frames after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings taken from the server config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_frame_bytes: usize,
    pub outbound_queue: usize,
    pub close_on_unauthorized: bool,
}

/// Serve one connection until the peer closes, the transport fails, or the
/// server shuts down. Always tears the session down before returning.
pub async fn serve(
    conn: WebSocketConnection,
    controller: Arc<Controller>,
    settings: SessionSettings,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let remote = conn.remote_addr;
    let (sink, mut stream) = conn.ws_stream.split();
    let (outbox, outbox_rx) = mpsc::channel::<ServerEnvelope>(settings.outbound_queue);
    let mut session = Session::new(remote, outbox.clone());
    let session_id = session.id().to_string();
    info!(session_id = %session_id, remote = %remote, "session started");

    let mut writer = tokio::spawn(write_loop(sink, outbox_rx, session_id.clone()));

    let period = controller.presence().heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(session_id = %session_id, "shutdown signal received, notifying client");
                let _ = outbox.send(ServerEnvelope::notice("server shutdown")).await;
                break;
            }

            _ = heartbeat.tick() => {
                controller.heartbeat(&session).await;
            }

            frame = websocket::ws_recv(&mut stream) => {
                let data = match frame {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        debug!(session_id = %session_id, "peer closed");
                        break;
                    }
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "session transport ended");
                        break;
                    }
                };

                let result = match frame_decode_bytes::<ClientEnvelope>(&data, settings.max_frame_bytes) {
                    Ok(request) => {
                        debug!(session_id = %session_id, kind = request.kind(), "request");
                        controller.handle(&mut session, request).await
                    }
                    Err(e) => Err(e),
                };

                let mut close = false;
                let replies = match result {
                    Ok(replies) => replies,
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "request failed");
                        close = settings.close_on_unauthorized && e.kind() == ErrorKind::Unauthorized;
                        vec![ServerEnvelope::error(&e)]
                    }
                };
                let mut delivered = true;
                for reply in replies {
                    if outbox.send(reply).await.is_err() {
                        delivered = false;
                        break;
                    }
                }
                if !delivered {
                    debug!(session_id = %session_id, "writer gone, ending session");
                    break;
                }
                if close {
                    info!(session_id = %session_id, "closing unauthorized session");
                    break;
                }
            }
        }
    }

    controller.disconnect(&mut session).await;
    // The writer finishes once every queue sender is gone.
    drop(session);
    drop(outbox);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "writer task failed"),
        Err(_) => {
            warn!(session_id = %session_id, "writer did not drain in time");
            writer.abort();
        }
    }
    info!(session_id = %session_id, remote = %remote, "session closed");
}

/// Sole owner of the socket sink.
async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<ServerEnvelope>, session_id: String) {
    while let Some(envelope) = rx.recv().await {
        let frame = match frame_encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to encode outbound frame");
                continue;
            }
        };
        if let Err(e) = websocket::ws_send_text(&mut sink, frame).await {
            debug!(session_id = %session_id, error = %e, "write failed");
            return;
        }
    }
    websocket::ws_close(&mut sink).await;
}
