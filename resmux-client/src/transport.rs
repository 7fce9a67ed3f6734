//! Transport seam.
//!
//! The client consumes a framed text-message interface: a sender for
//! outbound frames and a receiver for inbound frames. Dropping the sender
//! closes the connection; the receiver ends when the peer closes or the
//! socket dies. [`WsTransport`] implements the seam over a
//! `tokio-tungstenite` WebSocket; tests substitute an in-memory transport.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{Error, Result};

/// An established connection: paired text-frame channels.
pub struct TransportConn {
    /// Outbound frames. Dropping this sender closes the connection.
    pub outgoing: mpsc::UnboundedSender<String>,
    /// Inbound text frames. Ends on close.
    pub incoming: mpsc::UnboundedReceiver<String>,
}

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<TransportConn>> + Send + 'a>>;

/// A connector producing framed text connections.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a Url) -> ConnectFuture<'a>;
}

// ════════════════════════════════════════════════════════════════════
// WebSocket transport
// ════════════════════════════════════════════════════════════════════

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn connect<'a>(&'a self, url: &'a Url) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| Error::transport(format!("WebSocket connect failed: {e}")))?;

            tracing::info!(%url, "transport connected");

            let (ws_write, ws_read) = ws_stream.split();
            let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(run_write_loop(ws_write, out_rx));
            tokio::spawn(run_read_loop(ws_read, in_tx));

            Ok(TransportConn {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Drains the outbound channel into the socket; closes the socket when the
/// channel closes.
async fn run_write_loop(mut ws_write: WsSink, mut out_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = out_rx.recv().await {
        let msg = tokio_tungstenite::tungstenite::Message::Text(text.into());
        if ws_write.send(msg).await.is_err() {
            tracing::warn!("transport write failed, closing write loop");
            return;
        }
    }
    let _ = ws_write.close().await;
}

/// Forwards inbound text frames; dropping `in_tx` ends the client's read
/// pump.
async fn run_read_loop(mut ws_read: WsStream, in_tx: mpsc::UnboundedSender<String>) {
    while let Some(Ok(msg)) = ws_read.next().await {
        match msg {
            tokio_tungstenite::tungstenite::Message::Text(text) => {
                if in_tx.send(text.to_string()).is_err() {
                    return;
                }
            }
            tokio_tungstenite::tungstenite::Message::Close(_) => {
                tracing::info!("transport received close frame");
                return;
            }
            _ => {}
        }
    }
}
