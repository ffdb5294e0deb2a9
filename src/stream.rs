use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{AddressEntry, Message, Result};

/// An ordered, framed, authenticated duplex message channel.
///
/// Implementations own the transport and the wire format: framing,
/// marshalling and SASL authentication all happen behind this trait. The
/// connection engine only ever exchanges complete [`Message`]s with it.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Write one message to the peer.
    async fn send(&self, msg: &Message) -> io::Result<()>;

    /// Read the next message from the peer.
    ///
    /// Returns `Ok(None)` once the peer has closed the stream.
    async fn recv(&self) -> io::Result<Option<Message>>;

    /// Release the transport. Pending and future `recv` calls complete
    /// with `Ok(None)`; future `send` calls fail.
    fn close(&self);
}

/// Opens an authenticated [`MessageStream`] for one address entry.
///
/// [`Connection::open`] tries the parsed entries in order against this
/// trait until one of them produces a stream.
///
/// [`Connection::open`]: struct.Connection.html#method.open
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(&self, entry: &AddressEntry) -> Result<Arc<dyn MessageStream>>;
}
