//! Shared test harness: an in-memory transport with a scripted server side.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use resmux_client::{
    Client, ClientConfig, ConnectFuture, Error, EventPayload, Transport, TransportConn,
};
use resmux_proto::Request;

/// Transport whose connections surface on a [`MockServer`].
pub struct MockTransport {
    conn_tx: Mutex<mpsc::UnboundedSender<ServerConn>>,
}

/// The server side: accepts connections, reads requests, injects frames.
pub struct MockServer {
    conn_rx: mpsc::UnboundedReceiver<ServerConn>,
}

/// One accepted connection.
pub struct ServerConn {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

pub fn mock_transport() -> (Arc<MockTransport>, MockServer) {
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockTransport {
            conn_tx: Mutex::new(conn_tx),
        }),
        MockServer { conn_rx },
    )
}

impl Transport for MockTransport {
    fn connect<'a>(&'a self, _url: &'a Url) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.conn_tx
                .lock()
                .unwrap()
                .send(ServerConn {
                    from_client: out_rx,
                    to_client: in_tx,
                })
                .map_err(|_| Error::transport("mock server is gone"))?;
            Ok(TransportConn {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

impl MockServer {
    /// Waits for the next client connection.
    pub async fn next_conn(&mut self) -> ServerConn {
        tokio::time::timeout(Duration::from_secs(60), self.conn_rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }
}

impl ServerConn {
    /// Waits for the next request frame.
    pub async fn recv_request(&mut self) -> Request {
        let frame = tokio::time::timeout(Duration::from_secs(60), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection");
        serde_json::from_str(&frame).expect("client sent a malformed frame")
    }

    /// Returns a request if one is already queued.
    pub fn try_recv_request(&mut self) -> Option<Request> {
        self.from_client
            .try_recv()
            .ok()
            .map(|frame| serde_json::from_str(&frame).expect("client sent a malformed frame"))
    }

    /// Sends a success response.
    pub fn result(&self, id: u64, result: Value) {
        self.send(json!({ "id": id, "result": result }));
    }

    /// Sends an error response.
    pub fn error(&self, id: u64, code: &str, message: &str) {
        self.send(json!({
            "id": id,
            "error": { "code": code, "message": message }
        }));
    }

    /// Pushes an event frame for a rid.
    pub fn event(&self, rid: &str, name: &str, data: Value) {
        self.send(json!({ "event": format!("{rid}.{name}"), "data": data }));
    }

    /// Sends a raw text frame.
    pub fn send_raw(&self, frame: &str) {
        let _ = self.to_client.send(frame.to_string());
    }

    fn send(&self, frame: Value) {
        let _ = self.to_client.send(frame.to_string());
    }
}

/// Lets the client drain its read pump and fire due timers.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// A client wired to a fresh mock server.
pub fn client_pair() -> (Client, MockServer) {
    let (transport, server) = mock_transport();
    let client = Client::with_transport(ClientConfig::new("ws://test.invalid/ws"), transport)
        .expect("client construction failed");
    (client, server)
}

/// Waits for the next captured event payload.
pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<EventPayload>) -> EventPayload {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}
