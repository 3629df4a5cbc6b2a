//! WebSocket connection to a murmur server.
//!
//! A dispatch task reads frames, decodes them into [`ServerEnvelope`]s and
//! queues them; writes go through the shared sink.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use murmur_core::{frame_decode, frame_encode, ClientEnvelope, MurmurError, MurmurResult, ServerEnvelope};

type Sink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Stream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct Connection {
    sink: Arc<Mutex<Sink>>,
    inbound_rx: mpsc::Receiver<ServerEnvelope>,
    dispatch_handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Connect to `url` (`ws://host:port`).
    pub async fn connect(url: &str) -> MurmurResult<Self> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| MurmurError::Transport(format!("WebSocket connect error: {e}")))?;

        tracing::info!("WebSocket connected to {}", url);

        let (sink, stream) = ws_stream.split();
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerEnvelope>(256);
        let dispatch_handle = tokio::spawn(Self::dispatch_loop(stream, inbound_tx));

        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            inbound_rx,
            dispatch_handle,
        })
    }

    async fn dispatch_loop(mut stream: Stream, inbound_tx: mpsc::Sender<ServerEnvelope>) {
        while let Some(msg) = stream.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) => {
                    tracing::debug!("WebSocket close frame received");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            };

            match frame_decode::<ServerEnvelope>(&text) {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("undecodable frame from server: {}", e),
            }
        }
    }

    pub async fn send(&self, envelope: &ClientEnvelope) -> MurmurResult<()> {
        self.send_text(frame_encode(envelope)?).await
    }

    /// Send an arbitrary text frame, bypassing envelope encoding.
    pub async fn send_text(&self, text: String) -> MurmurResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| MurmurError::Transport(format!("WS write error: {e}")))
    }

    /// Next envelope from the server; `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<ServerEnvelope> {
        self.inbound_rx.recv().await
    }

    pub async fn close(&self) -> MurmurResult<()> {
        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| MurmurError::Transport(format!("WS close error: {e}")))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispatch_handle.abort();
    }
}
