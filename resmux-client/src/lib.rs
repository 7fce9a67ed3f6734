//! # resmux-client
//!
//! Client for a resource-oriented, subscription-based RPC protocol carried
//! over WebSocket. Remote resources, either key/value *models* or ordered
//! *collections* of models, appear as local live-updating handles, kept
//! synchronized by the server pushing events for every subscribed rid.
//!
//! The heart of the library is the resource cache: one entry per rid,
//! reference-counted three ways (user-attached handlers, containment in a
//! parent collection, the server-side subscription) and multiplexing all
//! interest in a rid onto a single subscription. When a connection drops,
//! entries go *stale* and are resynchronized on reconnect through a
//! diff-based sync engine that replays the difference as ordinary
//! add/remove/change events.
//!
//! ## Usage
//!
//! ```no_run
//! use resmux_client::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> resmux_client::Result<()> {
//!     let client = Client::new(ClientConfig::new("wss://api.example.com/ws"))?;
//!
//!     let ticket = client.get_model("ticket.board.12").await?;
//!     println!("state: {:?}", ticket.get("state"));
//!
//!     // Live updates for as long as a handler is attached.
//!     let handle = ticket.on("change", |_, payload| {
//!         println!("changed: {payload:?}");
//!     })?;
//!
//!     client.call_model("ticket.board.12", "close", None).await?;
//!
//!     ticket.off("change", handle)?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

mod bus;
mod cache;
mod client;
mod codec;
mod collection;
mod connection;
mod error;
mod events;
mod model;
mod registry;
mod resource;
mod sync;
mod transport;

pub use bus::{EventHandler, EventPayload, HandlerId};
pub use client::{
    Client, ClientConfig, ConnectHook, DEFAULT_NAMESPACE, DEFAULT_RECONNECT_DELAY,
    DEFAULT_STALE_RESUBSCRIBE_DELAY,
};
pub use collection::{Collection, IdCallback};
pub use error::{Error, Result};
pub use model::{Model, PropChange, PropDelta};
pub use registry::{ChangeCtx, ChangeHandler, ModelFactory, ModelInit, ModelType};
pub use resource::Resource;
pub use transport::{ConnectFuture, Transport, TransportConn, WsTransport};
