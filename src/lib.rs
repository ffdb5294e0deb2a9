//! This crate provides an asynchronous client engine for D-Bus: the
//! establishment of a connection and the multiplexing of method calls,
//! replies, signals and bus notifications over its one message stream.
//!
//! The engine owns the per-connection machinery (the serial allocator, the
//! pending-reply table, the FIFO send queue, the receiver loop and the
//! subscription tables) and leaves transports, SASL authentication and
//! message marshalling to the [`MessageStream`] it is given. Messages are
//! typed header records with opaque bodies; only the small set of
//! bus-control argument types is read and written by the engine itself.
//!
//! ### Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use buslink::{AddressEntry, Body, Connection, MessageStream, StreamOpener};
//!
//! // Transports and SASL live behind `StreamOpener`.
//! struct SessionOpener;
//!
//! #[async_trait::async_trait]
//! impl StreamOpener for SessionOpener {
//!     async fn open(&self, entry: &AddressEntry) -> buslink::Result<Arc<dyn MessageStream>> {
//!         unimplemented!("open a transport for {:?} and authenticate", entry)
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> buslink::Result<()> {
//!     let connection =
//!         Connection::open("unix:path=/run/user/1000/bus", &SessionOpener, None).await?;
//!
//!     let reply = connection
//!         .call_method(
//!             Some("org.freedesktop.DBus"),
//!             "/org/freedesktop/DBus",
//!             Some("org.freedesktop.DBus"),
//!             "GetId",
//!             Body::empty(),
//!         )
//!         .await?;
//!     println!("bus id: {}", reply.body_reader().get_str()?);
//!
//!     Ok(())
//! }
//! ```
//!
//! [`MessageStream`]: trait.MessageStream.html

mod error;
pub use error::*;

mod address;
pub use address::*;

mod guid;
pub use guid::*;

mod body;
pub use body::*;

mod message;
pub use message::*;

mod stream;
pub use stream::*;

mod send_queue;

mod connection;
pub use connection::*;

pub mod fdo;
