use std::collections::HashMap;
use std::convert::TryFrom;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::{io, mem};

use enumflags2::BitFlags;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::fdo::{self, ReleaseNameReply, RequestNameFlags, RequestNameReply, SignalMatchRule};
use crate::send_queue::SendQueue;
use crate::{
    parse_address, Body, BodyWriter, Error, Guid, Message, MessageStream, MessageType, Result,
    StreamOpener,
};

/// A handler invoked for inbound signals matching a subscription.
///
/// Returning an `Err` is treated as a bug in the application and tears the
/// connection down.
pub type SignalHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// A handler invoked when a watched service name changes owner.
pub type NameOwnerHandler = Arc<dyn Fn(&OwnerChange) -> Result<()> + Send + Sync>;

/// A callback invoked with the service name on `NameAcquired`/`NameLost`.
pub type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The future a method handler resolves its reply with.
pub type MethodReply = Pin<Box<dyn Future<Output = Result<Message>> + Send>>;

/// A handler producing the reply to an inbound method call.
pub type MethodHandler = Arc<dyn Fn(Message) -> MethodReply + Send + Sync>;

/// A callback invoked exactly once when the connection goes down, with the
/// failure that caused it, or `None` for an explicit dispose.
pub type DisconnectHandler = Box<dyn FnOnce(Option<Arc<Error>>) + Send>;

/// One decoded `NameOwnerChanged` notification.
///
/// Absent owners (the name appearing or disappearing) are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerChange {
    pub name: String,
    pub old_owner: Option<String>,
    pub new_owner: Option<String>,
}

/// The lifecycle state of a [`Connection`].
///
/// States only ever advance; `Disposed` is terminal and takes precedence
/// over `Disconnected`.
///
/// [`Connection`]: struct.Connection.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Disconnected,
    Disposed,
}

struct ServiceName {
    on_acquired: Option<NameCallback>,
    on_lost: Option<NameCallback>,
    dispatch: Option<tokio::runtime::Handle>,
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
struct Tables {
    state: ConnectionState,
    disconnect_reason: Option<Arc<Error>>,
    torn_down: bool,
    #[derivative(Debug = "ignore")]
    pending_replies: HashMap<u32, oneshot::Sender<Result<Message>>>,
    #[derivative(Debug = "ignore")]
    signal_handlers: HashMap<SignalMatchRule, Vec<(u64, SignalHandler)>>,
    #[derivative(Debug = "ignore")]
    owner_handlers: HashMap<String, Vec<(u64, NameOwnerHandler)>>,
    #[derivative(Debug = "ignore")]
    service_names: HashMap<String, ServiceName>,
    #[derivative(Debug = "ignore")]
    method_handlers: HashMap<String, MethodHandler>,
    #[derivative(Debug = "ignore")]
    on_disconnect: Option<DisconnectHandler>,
}

impl Tables {
    fn new(on_disconnect: Option<DisconnectHandler>) -> Self {
        Self {
            state: ConnectionState::Created,
            disconnect_reason: None,
            torn_down: false,
            pending_replies: HashMap::new(),
            signal_handlers: HashMap::new(),
            owner_handlers: HashMap::new(),
            service_names: HashMap::new(),
            method_handlers: HashMap::new(),
            on_disconnect,
        }
    }

    fn disconnected_error(&self) -> Error {
        match &self.disconnect_reason {
            Some(cause) => Error::Disconnected(cause.clone()),
            None => Error::Disposed,
        }
    }
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
struct ConnectionInner {
    #[derivative(Debug = "ignore")]
    stream: Arc<dyn MessageStream>,
    #[derivative(Debug = "ignore")]
    send_queue: Arc<SendQueue>,
    #[derivative(Debug = "ignore")]
    runtime: tokio::runtime::Handle,
    // Serial number for the next outgoing message
    serial: AtomicU32,
    next_handler_id: AtomicU64,
    local_name: OnceCell<String>,
    server_guid: Option<Guid>,
    tables: Mutex<Tables>,
}

/// A D-Bus connection.
///
/// A connection to a D-Bus bus, or a direct peer, over an authenticated
/// [`MessageStream`]. It multiplexes concurrent method calls, signal
/// subscriptions, service-name ownership and exported method handlers over
/// the one stream: outbound frames are serialized through a FIFO send
/// queue, and a receiver task demultiplexes inbound frames to the matching
/// reply waiter, signal handler chain or method handler.
///
/// `Connection` implements [`Clone`] and cloning it is a very cheap
/// operation, as the underlying data is not cloned. This makes it very
/// convenient to share the connection between different parts of your code.
/// All operations are safe to invoke from any thread or task.
///
/// A connection stays alive until [`dispose`] is called or the stream
/// fails; at that point every in-flight call completes with
/// [`Error::Disconnected`] and the disconnect callback passed at open time
/// fires exactly once.
///
/// [`MessageStream`]: trait.MessageStream.html
/// [`dispose`]: struct.Connection.html#method.dispose
/// [`Error::Disconnected`]: enum.Error.html#variant.Disconnected
/// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
#[derive(Debug, Clone)]
pub struct Connection(Arc<ConnectionInner>);

impl Connection {
    /// Open a connection for the given [D-Bus address].
    ///
    /// The address entries are tried in order against `opener` until one of
    /// them produces an authenticated stream; if none does, the last open
    /// error is returned. The bus `Hello` is then exchanged and the
    /// connection becomes usable.
    ///
    /// `on_disconnect` is invoked exactly once when the connection goes
    /// down, whether by stream failure or by [`dispose`].
    ///
    /// [D-Bus address]: https://dbus.freedesktop.org/doc/dbus-specification.html#addresses
    /// [`dispose`]: struct.Connection.html#method.dispose
    pub async fn open(
        address: &str,
        opener: &dyn StreamOpener,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Result<Self> {
        let entries = parse_address(address)?;

        let mut last_err = None;
        let mut opened = None;
        for entry in &entries {
            match opener.open(entry).await {
                Ok(stream) => {
                    opened = Some((stream, entry.guid().cloned()));
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        match opened {
            Some((stream, guid)) => Self::connect(stream, guid, on_disconnect).await,
            // parse_address guarantees at least one entry was tried
            None => Err(last_err.unwrap_or_else(|| Error::Address("no addresses".to_string()))),
        }
    }

    /// Create a connection from an already-authenticated stream.
    ///
    /// This is what [`open`] does once a transport is up; it is also the
    /// entry point for peer-to-peer streams. The bus `Hello` is exchanged
    /// here: a peer that does not implement `org.freedesktop.DBus` answers
    /// it with an error, which leaves the connection without a local name,
    /// and bus-only operations will refuse to run on it.
    ///
    /// [`open`]: struct.Connection.html#method.open
    pub async fn from_stream(
        stream: Arc<dyn MessageStream>,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Result<Self> {
        Self::connect(stream, None, on_disconnect).await
    }

    async fn connect(
        stream: Arc<dyn MessageStream>,
        server_guid: Option<Guid>,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::current();
        let inner = Arc::new(ConnectionInner {
            stream: stream.clone(),
            send_queue: SendQueue::new(stream, runtime.clone()),
            runtime,
            serial: AtomicU32::new(0),
            next_handler_id: AtomicU64::new(0),
            local_name: OnceCell::new(),
            server_guid,
            tables: Mutex::new(Tables::new(on_disconnect)),
        });

        inner.tables.lock().state = ConnectionState::Connecting;
        inner
            .runtime
            .spawn(ConnectionInner::receiver_loop(inner.clone()));

        // The bus wants the Hello before anything else, as per the
        // specification; a non-bus peer answers it with an error instead.
        let hello = match inner.call_impl(fdo::hello()).await {
            Ok(reply) => reply.body_reader().get_str().map(String::from),
            Err(Error::MethodError(_, _)) => Ok(String::new()),
            Err(e) => Err(e),
        };
        let local_name = match hello {
            Ok(name) => name,
            Err(e @ Error::Disconnected(_)) | Err(e @ Error::Disposed) => return Err(e),
            Err(e) => {
                let cause = Arc::new(e);
                inner.disconnect(ConnectionState::Disconnected, Some(cause.clone()));
                return Err(Error::Disconnected(cause));
            }
        };
        let _ = inner.local_name.set(local_name);

        {
            let mut tables = inner.tables.lock();
            match tables.state {
                ConnectionState::Connecting => tables.state = ConnectionState::Connected,
                ConnectionState::Connected => return Err(Error::AlreadyConnected),
                ConnectionState::Created => return Err(Error::NotConnected),
                ConnectionState::Disconnected => return Err(tables.disconnected_error()),
                ConnectionState::Disposed => return Err(Error::Disposed),
            }
        }

        Ok(Self(inner))
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.0.tables.lock().state
    }

    /// The unique name the bus assigned to this connection, or `None` if
    /// the remote side is not a bus.
    pub fn local_name(&self) -> Option<&str> {
        self.0
            .local_name
            .get()
            .map(|n| n.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Whether the remote side is a message bus rather than a direct peer.
    pub fn remote_is_bus(&self) -> bool {
        self.0.remote_is_bus()
    }

    /// The GUID the winning address entry announced, when there was one.
    pub fn server_guid(&self) -> Option<&Guid> {
        self.0.server_guid.as_ref()
    }

    /// Send a method call and wait for its reply.
    ///
    /// A remote error reply surfaces as [`Error::MethodError`]. The message
    /// must expect a reply; use [`send_message`] for one-way calls.
    ///
    /// [`Error::MethodError`]: enum.Error.html#variant.MethodError
    /// [`send_message`]: struct.Connection.html#method.send_message
    pub async fn call(&self, msg: Message) -> Result<Message> {
        self.call_with_cancel(msg, CancellationToken::new()).await
    }

    /// Like [`call`], but abandoning the call when `cancel` fires.
    ///
    /// Cancelling before the frame is written leaves no bytes on the wire;
    /// cancelling later cannot unsend the frame and only stops waiting for
    /// the reply.
    ///
    /// [`call`]: struct.Connection.html#method.call
    pub async fn call_with_cancel(
        &self,
        msg: Message,
        cancel: CancellationToken,
    ) -> Result<Message> {
        self.0.ensure_connected()?;
        self.0.call_impl_cancellable(msg, cancel).await
    }

    /// Create a method-call message and [`call`] it.
    ///
    /// [`call`]: struct.Connection.html#method.call
    pub async fn call_method(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        body: Body,
    ) -> Result<Message> {
        self.call(Message::method(destination, path, interface, member, body))
            .await
    }

    /// Queue `msg` for sending and wait until it is on the wire.
    ///
    /// Returns the serial assigned to the message.
    pub async fn send_message(&self, mut msg: Message) -> Result<u32> {
        self.0.ensure_connected()?;
        let serial = self.0.next_serial()?;
        msg.header_mut().set_serial(serial);
        let slot = self.0.send_queue.queue(msg, CancellationToken::new());
        match slot.await {
            Ok(result) => result.map(|()| serial),
            Err(_) => Err(self.0.current_error()),
        }
    }

    /// Queue a message for sending without waiting for it.
    ///
    /// Returns the serial assigned to the message. Write failures are
    /// logged; callers that need to observe them should use
    /// [`send_message`].
    ///
    /// [`send_message`]: struct.Connection.html#method.send_message
    pub fn emit(&self, mut msg: Message) -> Result<u32> {
        self.0.ensure_connected()?;
        let serial = self.0.next_serial()?;
        msg.header_mut().set_serial(serial);
        drop(self.0.send_queue.queue(msg, CancellationToken::new()));

        Ok(serial)
    }

    /// Create a signal message and [`emit`] it.
    ///
    /// [`emit`]: struct.Connection.html#method.emit
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Body,
    ) -> Result<u32> {
        self.emit(Message::signal(path, interface, member, body))
    }

    /// Subscribe `handler` to the signals matching `(path, interface,
    /// member)`.
    ///
    /// The first subscription for a rule registers the match rule with the
    /// bus; further subscriptions share it. Handlers for the same rule run
    /// in subscription order. Dropping (or releasing) the returned
    /// registration removes the handler again, and the last removal
    /// retracts the bus-side match rule.
    pub async fn watch_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        handler: impl Fn(&Message) -> Result<()> + Send + Sync + 'static,
    ) -> Result<SignalRegistration> {
        self.0.ensure_connected()?;
        let rule = SignalMatchRule::new(path, interface, member);
        let handler: SignalHandler = Arc::new(handler);
        let id = self.0.next_handler_id.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut tables = self.0.tables.lock();
            let chain = tables.signal_handlers.entry(rule.clone()).or_default();
            let first = chain.is_empty();
            chain.push((id, handler));
            first
        };

        if first && self.0.remote_is_bus() {
            let add = fdo::add_match(&rule.rule_string());
            if let Err(e) = self.0.call_impl(add).await {
                self.0.remove_signal_handler(&rule, id);
                return Err(e);
            }
        }

        Ok(SignalRegistration {
            inner: Arc::downgrade(&self.0),
            rule,
            id,
            released: AtomicBool::new(false),
        })
    }

    /// Subscribe `handler` to owner changes of the well-known `service`
    /// name.
    ///
    /// The handler receives each decoded `NameOwnerChanged` notification
    /// for the name. Only valid on bus connections.
    pub async fn watch_name_owner(
        &self,
        service: &str,
        handler: impl Fn(&OwnerChange) -> Result<()> + Send + Sync + 'static,
    ) -> Result<NameOwnerRegistration> {
        self.0.ensure_connected()?;
        if !self.0.remote_is_bus() {
            return Err(Error::InvalidOperation(
                "name owners can only be watched on a bus connection".to_string(),
            ));
        }
        let handler: NameOwnerHandler = Arc::new(handler);
        let id = self.0.next_handler_id.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut tables = self.0.tables.lock();
            let chain = tables
                .owner_handlers
                .entry(service.to_string())
                .or_default();
            let first = chain.is_empty();
            chain.push((id, handler));
            first
        };

        if first {
            let add = fdo::add_match(&fdo::owner_changed_rule(service));
            if let Err(e) = self.0.call_impl(add).await {
                self.0.remove_owner_handler(service, id);
                return Err(e);
            }
        }

        Ok(NameOwnerRegistration {
            inner: Arc::downgrade(&self.0),
            service: service.to_string(),
            id,
            released: AtomicBool::new(false),
        })
    }

    /// Request ownership of the well-known `name` on the bus.
    ///
    /// `on_acquired` and `on_lost` are invoked when the bus notifies this
    /// connection that it gained or lost the name; with a `dispatch`
    /// handle they are spawned onto that runtime, otherwise they run
    /// inline on the receiver task. A name can be registered only once per
    /// connection; the registration lasts until [`release_name`], a
    /// definitive acquisition failure, or disconnect.
    ///
    /// [`release_name`]: struct.Connection.html#method.release_name
    pub async fn request_name(
        &self,
        name: &str,
        flags: BitFlags<RequestNameFlags>,
        on_acquired: Option<NameCallback>,
        on_lost: Option<NameCallback>,
        dispatch: Option<tokio::runtime::Handle>,
    ) -> Result<RequestNameReply> {
        self.0.ensure_connected()?;
        if !self.0.remote_is_bus() {
            return Err(Error::InvalidOperation(
                "names can only be requested on a bus connection".to_string(),
            ));
        }

        {
            let mut tables = self.0.tables.lock();
            if tables.service_names.contains_key(name) {
                return Err(Error::InvalidOperation(format!(
                    "name '{}' is already registered on this connection",
                    name
                )));
            }
            // Recorded before the call so an early NameAcquired finds it.
            tables.service_names.insert(
                name.to_string(),
                ServiceName {
                    on_acquired,
                    on_lost,
                    dispatch,
                },
            );
        }

        let reply = self
            .0
            .call_impl(fdo::request_name(name, flags))
            .await
            .and_then(|reply| {
                let code = reply.body_reader().get_u32()?;
                RequestNameReply::try_from(code).map_err(|_| {
                    Error::Protocol(format!("unknown RequestName reply code {}", code))
                })
            });

        match reply {
            // Not owned and not queued: nothing will ever be acquired or lost.
            Ok(RequestNameReply::Exists) => {
                self.0.tables.lock().service_names.remove(name);
                Ok(RequestNameReply::Exists)
            }
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.0.tables.lock().service_names.remove(name);
                Err(e)
            }
        }
    }

    /// Release a name previously requested with [`request_name`].
    ///
    /// Returns [`NotOwner`] without a bus round-trip if the name was never
    /// registered on this connection.
    ///
    /// [`request_name`]: struct.Connection.html#method.request_name
    /// [`NotOwner`]: fdo/enum.ReleaseNameReply.html#variant.NotOwner
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        self.0.ensure_connected()?;

        if self.0.tables.lock().service_names.remove(name).is_none() {
            return Ok(ReleaseNameReply::NotOwner);
        }

        let reply = self.0.call_impl(fdo::release_name(name)).await?;
        let code = reply.body_reader().get_u32()?;
        ReleaseNameReply::try_from(code)
            .map_err(|_| Error::Protocol(format!("unknown ReleaseName reply code {}", code)))
    }

    /// Export `handler` for method calls addressed to `path`.
    ///
    /// At most one handler per path; the handler's reply is correlated and
    /// addressed back to the caller by the connection.
    pub fn add_method_handler<H, F>(&self, path: &str, handler: H) -> Result<()>
    where
        H: Fn(Message) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Message>> + Send + 'static,
    {
        self.0.ensure_connected()?;
        let handler: MethodHandler = Arc::new(move |msg| Box::pin(handler(msg)) as MethodReply);

        let mut tables = self.0.tables.lock();
        if tables.method_handlers.contains_key(path) {
            return Err(Error::InvalidOperation(format!(
                "a method handler is already exported at '{}'",
                path
            )));
        }
        tables.method_handlers.insert(path.to_string(), handler);

        Ok(())
    }

    /// Remove the method handler exported at `path`, if any.
    pub fn remove_method_handler(&self, path: &str) -> bool {
        self.0.tables.lock().method_handlers.remove(path).is_some()
    }

    /// Tear the connection down.
    ///
    /// Idempotent. Pending replies complete with [`Error::Disposed`], all
    /// subscriptions and registrations are dropped, the stream is released
    /// and the disconnect callback fires (at most once, shared with a
    /// stream-failure disconnect).
    ///
    /// [`Error::Disposed`]: enum.Error.html#variant.Disposed
    pub fn dispose(&self) {
        self.0.disconnect(ConnectionState::Disposed, None);
    }
}

impl ConnectionInner {
    fn remote_is_bus(&self) -> bool {
        self.local_name.get().map_or(false, |n| !n.is_empty())
    }

    /// Allocate the next message serial: non-zero, strictly increasing.
    fn next_serial(&self) -> Result<u32> {
        let mut current = self.serial.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(1)
                .ok_or_else(|| Error::Protocol("message serial space exhausted".to_string()))?;
            match self.serial.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(next),
                Err(observed) => current = observed,
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        let tables = self.tables.lock();
        match tables.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Created => Err(Error::NotConnected),
            ConnectionState::Connecting => Err(Error::Connecting),
            ConnectionState::Disconnected => Err(tables.disconnected_error()),
            ConnectionState::Disposed => Err(Error::Disposed),
        }
    }

    /// The guard error for the current state, for paths that lost a race
    /// with a disconnect.
    fn current_error(&self) -> Error {
        let tables = self.tables.lock();
        match tables.state {
            ConnectionState::Connected => Error::Protocol("request abandoned".to_string()),
            ConnectionState::Created => Error::NotConnected,
            ConnectionState::Connecting => Error::Connecting,
            ConnectionState::Disconnected => tables.disconnected_error(),
            ConnectionState::Disposed => Error::Disposed,
        }
    }

    async fn call_impl(self: &Arc<Self>, msg: Message) -> Result<Message> {
        self.call_impl_cancellable(msg, CancellationToken::new())
            .await
    }

    /// Assign a serial, register the reply slot, queue the frame and wait.
    async fn call_impl_cancellable(
        self: &Arc<Self>,
        mut msg: Message,
        cancel: CancellationToken,
    ) -> Result<Message> {
        if msg.header().msg_type() == MessageType::MethodCall && !msg.header().reply_expected() {
            return Err(Error::InvalidOperation(
                "call requires a reply-expected method call".to_string(),
            ));
        }

        let serial = self.next_serial()?;
        msg.header_mut().set_serial(serial);

        let (tx, reply_slot) = oneshot::channel();
        self.tables.lock().pending_replies.insert(serial, tx);

        let send_done = self.send_queue.queue(msg, cancel.clone());
        // An already-resolved slot wins over a simultaneous cancellation.
        let sent = tokio::select! {
            biased;
            result = send_done => Some(result),
            _ = cancel.cancelled() => None,
        };
        match sent {
            // Not (necessarily) transmitted: the reply slot goes with it.
            None => {
                self.tables.lock().pending_replies.remove(&serial);
                return Err(Error::Cancelled);
            }
            Some(Ok(Err(e))) => {
                self.tables.lock().pending_replies.remove(&serial);
                return Err(e);
            }
            Some(Err(_)) => {
                self.tables.lock().pending_replies.remove(&serial);
                return Err(self.current_error());
            }
            Some(Ok(Ok(()))) => {}
        }

        let reply = tokio::select! {
            biased;
            reply = reply_slot => reply,
            _ = cancel.cancelled() => {
                // The frame is on the wire; the slot stays behind so the
                // eventual reply resolves into the dropped receiver instead
                // of counting as an unexpected reply.
                return Err(Error::Cancelled);
            }
        };

        let reply = match reply {
            Ok(reply) => reply?,
            Err(_) => return Err(self.current_error()),
        };
        match reply.header().msg_type() {
            MessageType::MethodReturn => Ok(reply),
            MessageType::Error => {
                let name = reply.header().error_name().unwrap_or("").to_string();
                let text = reply.body_reader().get_str().unwrap_or("").to_string();
                Err(Error::MethodError(name, text))
            }
            other => Err(Error::Protocol(format!(
                "reply to serial {} has kind {:?}",
                serial, other
            ))),
        }
    }

    /// Assign a serial and queue a frame nobody waits for.
    fn queue_detached(self: &Arc<Self>, mut msg: Message) {
        match self.next_serial() {
            Ok(serial) => {
                msg.header_mut().set_serial(serial);
                drop(self.send_queue.queue(msg, CancellationToken::new()));
            }
            Err(e) => log::warn!("dropping outbound message: {}", e),
        }
    }

    async fn receiver_loop(self: Arc<Self>) {
        let reason = loop {
            let msg = match self.stream.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    break Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Err(e) => break Error::Io(e),
            };
            if let Err(e) = self.dispatch(msg).await {
                break e;
            }
        };

        log::debug!("receiver loop ending: {}", reason);
        self.disconnect(ConnectionState::Disconnected, Some(Arc::new(reason)));
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) -> Result<()> {
        if let Some(reply_serial) = msg.header().reply_serial() {
            let slot = self.tables.lock().pending_replies.remove(&reply_serial);
            return match slot {
                Some(tx) => {
                    // A dropped receiver means the caller gave up; fine.
                    let _ = tx.send(Ok(msg));
                    Ok(())
                }
                None => Err(Error::Protocol(format!(
                    "unexpected reply to serial {}",
                    reply_serial
                ))),
            };
        }

        match msg.header().msg_type() {
            MessageType::MethodCall => self.dispatch_method_call(msg).await,
            MessageType::Signal => self.dispatch_signal(&msg),
            MessageType::MethodReturn => Err(Error::Protocol(
                "method return without a reply serial".to_string(),
            )),
            MessageType::Error => Err(Error::Protocol(
                "error reply without a reply serial".to_string(),
            )),
            MessageType::Invalid => Err(Error::Protocol("invalid message kind".to_string())),
        }
    }

    async fn dispatch_method_call(self: &Arc<Self>, msg: Message) -> Result<()> {
        if msg.header().interface() == Some(fdo::PEER_INTERFACE) {
            self.dispatch_peer_call(&msg);
            return Ok(());
        }

        let path = msg.header().path().unwrap_or("").to_string();
        let handler = self.tables.lock().method_handlers.get(&path).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                self.reply_unknown_method(&msg);
                return Ok(());
            }
        };

        match handler(msg.clone()).await {
            Ok(mut reply) => {
                reply
                    .header_mut()
                    .set_reply_serial(Some(msg.header().serial()));
                reply
                    .header_mut()
                    .set_destination(msg.header().sender().map(String::from));
                self.queue_detached(reply);
            }
            Err(e) => {
                log::warn!("method handler at '{}' failed: {}", path, e);
                if msg.header().reply_expected() {
                    self.queue_detached(Message::method_error(
                        &msg,
                        fdo::ERR_FAILED,
                        &e.to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn dispatch_peer_call(self: &Arc<Self>, msg: &Message) {
        match msg.header().member() {
            Some("Ping") => self.queue_detached(Message::method_reply(msg, Body::empty())),
            Some("GetMachineId") => self.queue_detached(Message::method_reply(
                msg,
                BodyWriter::new().put_str(crate::machine_id()).finish(),
            )),
            _ => self.reply_unknown_method(msg),
        }
    }

    fn reply_unknown_method(self: &Arc<Self>, msg: &Message) {
        if !msg.header().reply_expected() {
            return;
        }
        let description = format!(
            "Method \"{}\" with signature \"{}\" on interface \"{}\" doesn't exist",
            msg.header().member().unwrap_or(""),
            msg.header().signature().unwrap_or(""),
            msg.header().interface().unwrap_or(""),
        );
        self.queue_detached(Message::method_error(
            msg,
            fdo::ERR_UNKNOWN_METHOD,
            &description,
        ));
    }

    fn dispatch_signal(self: &Arc<Self>, msg: &Message) -> Result<()> {
        let interface = msg.header().interface().unwrap_or("").to_string();
        let member = msg.header().member().unwrap_or("").to_string();

        if interface == fdo::DBUS_INTERFACE {
            match member.as_str() {
                fdo::NAME_OWNER_CHANGED => self.dispatch_owner_changed(msg)?,
                fdo::NAME_ACQUIRED => self.dispatch_name_signal(msg, true)?,
                fdo::NAME_LOST => self.dispatch_name_signal(msg, false)?,
                _ => {}
            }
        }

        let rule = SignalMatchRule::new(msg.header().path().unwrap_or(""), &interface, &member);
        // Snapshot the chain; handlers never run under the lock.
        let chain: Vec<SignalHandler> = {
            let tables = self.tables.lock();
            tables
                .signal_handlers
                .get(&rule)
                .map(|chain| chain.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in chain {
            handler(msg).map_err(|e| {
                Error::InvalidOperation(format!(
                    "signal handler for {}.{} failed: {}",
                    interface, member, e
                ))
            })?;
        }

        Ok(())
    }

    fn dispatch_owner_changed(self: &Arc<Self>, msg: &Message) -> Result<()> {
        let mut reader = msg.body_reader();
        let name = reader.get_str()?.to_string();
        let old_owner = reader.get_str()?;
        let new_owner = reader.get_str()?;
        let change = OwnerChange {
            old_owner: Some(old_owner.to_string()).filter(|o| !o.is_empty()),
            new_owner: Some(new_owner.to_string()).filter(|o| !o.is_empty()),
            name,
        };

        let chain: Vec<NameOwnerHandler> = {
            let tables = self.tables.lock();
            tables
                .owner_handlers
                .get(&change.name)
                .map(|chain| chain.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in chain {
            handler(&change).map_err(|e| {
                Error::InvalidOperation(format!(
                    "owner handler for '{}' failed: {}",
                    change.name, e
                ))
            })?;
        }

        Ok(())
    }

    fn dispatch_name_signal(self: &Arc<Self>, msg: &Message, acquired: bool) -> Result<()> {
        let name = msg.body_reader().get_str()?.to_string();

        let entry = {
            let tables = self.tables.lock();
            tables.service_names.get(&name).map(|service| {
                let callback = if acquired {
                    service.on_acquired.clone()
                } else {
                    service.on_lost.clone()
                };
                (callback, service.dispatch.clone())
            })
        };

        if let Some((Some(callback), dispatch)) = entry {
            match dispatch {
                Some(handle) => {
                    handle.spawn(async move { callback(&name) });
                }
                None => callback(&name),
            }
        }

        Ok(())
    }

    fn remove_signal_handler(&self, rule: &SignalMatchRule, id: u64) -> bool {
        let mut tables = self.tables.lock();
        match tables.signal_handlers.get_mut(rule) {
            Some(chain) => {
                chain.retain(|(hid, _)| *hid != id);
                if chain.is_empty() {
                    tables.signal_handlers.remove(rule);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn remove_owner_handler(&self, service: &str, id: u64) -> bool {
        let mut tables = self.tables.lock();
        match tables.owner_handlers.get_mut(service) {
            Some(chain) => {
                chain.retain(|(hid, _)| *hid != id);
                if chain.is_empty() {
                    tables.owner_handlers.remove(service);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Retract a bus-side match rule without holding the caller up.
    fn remove_match_detached(self: &Arc<Self>, rule: String) {
        let inner = self.clone();
        self.runtime.spawn(async move {
            let result = match inner.ensure_connected() {
                Ok(()) => inner.call_impl(fdo::remove_match(&rule)).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                log::debug!("RemoveMatch({}) skipped: {}", rule, e);
            }
        });
    }

    fn disconnect(&self, next: ConnectionState, reason: Option<Arc<Error>>) {
        let (pending, callback, reason) = {
            let mut tables = self.tables.lock();
            let first = !tables.torn_down;
            tables.torn_down = true;
            tables.state =
                if next == ConnectionState::Disposed || tables.state == ConnectionState::Disposed {
                    ConnectionState::Disposed
                } else {
                    ConnectionState::Disconnected
                };
            if !first {
                // Later calls only upgrade the state.
                return;
            }
            tables.disconnect_reason = reason;

            let pending = mem::take(&mut tables.pending_replies);
            tables.signal_handlers.clear();
            tables.owner_handlers.clear();
            tables.service_names.clear();
            tables.method_handlers.clear();

            (
                pending,
                tables.on_disconnect.take(),
                tables.disconnect_reason.clone(),
            )
        };

        self.stream.close();

        for (_, tx) in pending {
            let err = match &reason {
                Some(cause) => Error::Disconnected(cause.clone()),
                None => Error::Disposed,
            };
            let _ = tx.send(Err(err));
        }

        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

/// A live signal subscription.
///
/// Dropping or [releasing] it removes the handler; removing the last
/// handler of a rule retracts the rule from the bus.
///
/// [releasing]: struct.SignalRegistration.html#method.release
#[must_use]
pub struct SignalRegistration {
    inner: Weak<ConnectionInner>,
    rule: SignalMatchRule,
    id: u64,
    released: AtomicBool,
}

impl SignalRegistration {
    /// Remove the handler. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if inner.remove_signal_handler(&self.rule, self.id) && inner.remote_is_bus() {
                inner.remove_match_detached(self.rule.rule_string());
            }
        }
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

/// A live name-owner subscription; same release semantics as
/// [`SignalRegistration`].
///
/// [`SignalRegistration`]: struct.SignalRegistration.html
#[must_use]
pub struct NameOwnerRegistration {
    inner: Weak<ConnectionInner>,
    service: String,
    id: u64,
    released: AtomicBool,
}

impl NameOwnerRegistration {
    /// Remove the handler. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if inner.remove_owner_handler(&self.service, self.id) {
                inner.remove_match_detached(fdo::owner_changed_rule(&self.service));
            }
        }
    }
}

impl Drop for NameOwnerRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::stream::testing::{TestHandle, TestStream};
    use crate::{AddressEntry, MessageFlags, MessageHeader};

    async fn connected() -> (Connection, TestHandle) {
        connected_with(None).await
    }

    async fn connected_with(
        on_disconnect: Option<DisconnectHandler>,
    ) -> (Connection, TestHandle) {
        let (stream, handle) = TestStream::pair();
        let connect = Connection::from_stream(stream, on_disconnect);
        let serve = async move {
            let mut handle = handle;
            let hello = handle.next_sent().await.unwrap();
            assert_eq!(hello.header().member(), Some("Hello"));
            assert_eq!(hello.header().destination(), Some(fdo::DBUS_SERVICE));
            handle.push(reply_str(&hello, ":1.42"));
            handle
        };
        let (conn, handle) = tokio::join!(connect, serve);

        (conn.unwrap(), handle)
    }

    fn reply_str(call: &Message, s: &str) -> Message {
        Message::method_reply(call, BodyWriter::new().put_str(s).finish())
    }

    fn reply_u32(call: &Message, value: u32) -> Message {
        Message::method_reply(call, BodyWriter::new().put_u32(value).finish())
    }

    fn inbound_signal(path: &str, interface: &str, member: &str, body: Body) -> Message {
        let mut msg = Message::signal(path, interface, member, body);
        msg.header_mut().set_serial(777);
        msg.header_mut().set_sender(Some(":1.99".to_string()));
        msg
    }

    async fn serve_call(
        handle: &mut TestHandle,
        member: &str,
        reply: impl FnOnce(&Message) -> Message,
    ) -> Message {
        let call = handle.next_sent().await.unwrap();
        assert_eq!(call.header().member(), Some(member));
        handle.push(reply(&call));
        call
    }

    /// Round-trip a Peer Ping so everything the receiver saw before it has
    /// been dispatched.
    async fn barrier(handle: &mut TestHandle) {
        let mut ping = Message::method(None, "/", Some(fdo::PEER_INTERFACE), "Ping", Body::empty());
        ping.header_mut().set_serial(4242);
        handle.push(ping);
        let pong = handle.next_sent().await.unwrap();
        assert_eq!(pong.header().reply_serial(), Some(4242));
    }

    struct QueueOpener(Mutex<Vec<Result<Arc<dyn MessageStream>>>>);

    #[async_trait]
    impl StreamOpener for QueueOpener {
        async fn open(&self, _entry: &AddressEntry) -> Result<Arc<dyn MessageStream>> {
            self.0.lock().remove(0)
        }
    }

    #[tokio::test]
    async fn open_performs_the_hello() {
        let (conn, _handle) = connected().await;
        assert_eq!(conn.local_name(), Some(":1.42"));
        assert!(conn.remote_is_bus());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn open_falls_back_across_address_entries() {
        let (stream, handle) = TestStream::pair();
        let stream: Arc<dyn MessageStream> = stream;
        let opener = QueueOpener(Mutex::new(vec![
            Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "nothing listening",
            ))),
            Ok(stream),
        ]));

        let connect =
            Connection::open("unix:path=/tmp/a;tcp:host=localhost,port=7", &opener, None);
        let serve = async move {
            let mut handle = handle;
            let hello = handle.next_sent().await.unwrap();
            handle.push(reply_str(&hello, ":1.7"));
            handle
        };
        let (conn, _handle) = tokio::join!(connect, serve);
        assert_eq!(conn.unwrap().local_name(), Some(":1.7"));
    }

    #[tokio::test]
    async fn open_propagates_the_last_open_error() {
        let opener = QueueOpener(Mutex::new(vec![
            Err(Error::Address("first".to_string())),
            Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "last",
            ))),
        ]));
        match Connection::open("unix:path=/a;unix:path=/b", &opener, None).await {
            Err(Error::Io(e)) => assert_eq!(e.to_string(), "last"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn open_requires_an_address() {
        let opener = QueueOpener(Mutex::new(vec![]));
        assert!(matches!(
            Connection::open("", &opener, None).await,
            Err(Error::Address(_))
        ));
    }

    #[tokio::test]
    async fn peer_without_bus_has_no_local_name() {
        let (stream, handle) = TestStream::pair();
        let connect = Connection::from_stream(stream, None);
        let serve = async move {
            let mut handle = handle;
            let hello = handle.next_sent().await.unwrap();
            handle.push(Message::method_error(
                &hello,
                fdo::ERR_UNKNOWN_METHOD,
                "no bus here",
            ));
            handle
        };
        let (conn, mut handle) = tokio::join!(connect, serve);
        let conn = conn.unwrap();
        assert_eq!(conn.local_name(), None);
        assert!(!conn.remote_is_bus());

        // signal subscriptions stay local: no AddMatch goes out
        let reg = conn.watch_signal("/a", "i.I", "S", |_| Ok(())).await.unwrap();
        assert!(handle.try_next_sent().is_none());
        drop(reg);

        // and bus name operations refuse to run
        assert!(matches!(
            conn.request_name("com.x", BitFlags::empty(), None, None, None).await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            conn.watch_name_owner("com.x", |_| Ok(())).await,
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn serials_are_distinct_and_increasing() {
        let (conn, mut handle) = connected().await;
        let s1 = conn.emit_signal("/a", "i.I", "S", Body::empty()).unwrap();
        let s2 = conn.emit_signal("/a", "i.I", "S", Body::empty()).unwrap();
        let s3 = conn.emit_signal("/a", "i.I", "S", Body::empty()).unwrap();
        assert!(s1 > 1, "the Hello already used a serial");
        assert!(s1 < s2 && s2 < s3);

        // FIFO: the wire sees them in emit order
        assert_eq!(handle.next_sent().await.unwrap().header().serial(), s1);
        assert_eq!(handle.next_sent().await.unwrap().header().serial(), s2);
        assert_eq!(handle.next_sent().await.unwrap().header().serial(), s3);
    }

    #[tokio::test]
    async fn replies_correlate_by_serial() {
        let (conn, mut handle) = connected().await;
        let call = conn.call_method(
            Some(fdo::DBUS_SERVICE),
            fdo::DBUS_PATH,
            Some(fdo::DBUS_INTERFACE),
            "GetId",
            Body::empty(),
        );
        let serve = async {
            let sent = handle.next_sent().await.unwrap();
            let serial = sent.header().serial();
            handle.push(reply_str(&sent, "someid"));
            serial
        };
        let (reply, serial) = tokio::join!(call, serve);
        let reply = reply.unwrap();
        assert_eq!(reply.header().reply_serial(), Some(serial));
        assert_eq!(reply.body_reader().get_str().unwrap(), "someid");
    }

    #[tokio::test]
    async fn remote_errors_surface_as_method_errors() {
        let (conn, mut handle) = connected().await;
        let call = conn.call_method(None, "/x", Some("i.I"), "Boom", Body::empty());
        let serve = async {
            let sent = handle.next_sent().await.unwrap();
            handle.push(Message::method_error(&sent, "com.example.Error.Boom", "kaboom"));
        };
        let (result, ()) = tokio::join!(call, serve);
        match result {
            Err(Error::MethodError(name, text)) => {
                assert_eq!(name, "com.example.Error.Boom");
                assert_eq!(text, "kaboom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_call_before_write_sends_nothing() {
        let (conn, mut handle) = connected().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = conn
            .call_with_cancel(
                Message::method(None, "/x", Some("i.I"), "M", Body::empty()),
                cancel,
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));

        // let the writer task run; nothing may reach the wire
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(handle.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn late_reply_after_cancellation_is_ignored() {
        let (conn, mut handle) = connected().await;
        let cancel = CancellationToken::new();
        let call = conn.call_with_cancel(
            Message::method(None, "/x", Some("i.I"), "M", Body::empty()),
            cancel.clone(),
        );
        tokio::pin!(call);

        // drive the call until its frame is on the wire, then cancel
        let sent = tokio::select! {
            sent = handle.next_sent() => sent.unwrap(),
            _ = &mut call => panic!("call completed without a reply"),
        };
        cancel.cancel();
        assert!(matches!(call.await, Err(Error::Cancelled)));

        // the reply we solicited arrives late; it must not count as an
        // unexpected reply
        handle.push(reply_str(&sent, "late"));
        barrier(&mut handle).await;
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn match_rules_are_added_and_removed_once() {
        let (conn, mut handle) = connected().await;
        let rule = SignalMatchRule::new("/a", "i.I", "S");

        let watch = conn.watch_signal("/a", "i.I", "S", |_| Ok(()));
        let serve = async {
            let add = serve_call(&mut handle, "AddMatch", |c| {
                Message::method_reply(c, Body::empty())
            })
            .await;
            assert_eq!(add.body_reader().get_str().unwrap(), rule.rule_string());
        };
        let (r1, ()) = tokio::join!(watch, serve);
        let r1 = r1.unwrap();

        // the second subscription shares the rule: no bus call
        let r2 = conn.watch_signal("/a", "i.I", "S", |_| Ok(())).await.unwrap();
        assert!(handle.try_next_sent().is_none());

        r2.release();
        r2.release(); // idempotent
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(handle.try_next_sent().is_none());

        drop(r1);
        let remove = serve_call(&mut handle, "RemoveMatch", |c| {
            Message::method_reply(c, Body::empty())
        })
        .await;
        assert_eq!(remove.body_reader().get_str().unwrap(), rule.rule_string());
    }

    #[tokio::test]
    async fn signal_handlers_run_in_subscription_order() {
        let (conn, mut handle) = connected().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        let watch = conn.watch_signal("/a", "i.I", "S", move |_| {
            first.lock().push(1);
            Ok(())
        });
        let serve = async {
            serve_call(&mut handle, "AddMatch", |c| {
                Message::method_reply(c, Body::empty())
            })
            .await;
        };
        let (r1, ()) = tokio::join!(watch, serve);
        let _r1 = r1.unwrap();

        let second = order.clone();
        let _r2 = conn
            .watch_signal("/a", "i.I", "S", move |_| {
                second.lock().push(2);
                Ok(())
            })
            .await
            .unwrap();

        handle.push(inbound_signal("/a", "i.I", "S", Body::empty()));
        barrier(&mut handle).await;
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failing_signal_handler_tears_the_connection_down() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let count = disconnects.clone();
        let (conn, mut handle) = connected_with(Some(Box::new(move |reason| {
            match reason.as_deref() {
                Some(Error::InvalidOperation(_)) => {}
                other => panic!("unexpected reason: {:?}", other),
            }
            count.fetch_add(1, Ordering::SeqCst);
        })))
        .await;

        let watch = conn.watch_signal("/a", "i.I", "S", |_| {
            Err(Error::InvalidOperation("broken handler".to_string()))
        });
        let serve = async {
            serve_call(&mut handle, "AddMatch", |c| {
                Message::method_reply(c, Body::empty())
            })
            .await;
        };
        let (reg, ()) = tokio::join!(watch, serve);
        let _reg = reg.unwrap();

        handle.push(inbound_signal("/a", "i.I", "S", Body::empty()));
        while conn.state() == ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_ping_is_answered_without_a_handler_lookup() {
        let (_conn, mut handle) = connected().await;
        let mut ping =
            Message::method(None, "/x/y", Some(fdo::PEER_INTERFACE), "Ping", Body::empty());
        ping.header_mut().set_serial(7);
        ping.header_mut().set_sender(Some(":1.2".to_string()));
        handle.push(ping);

        let pong = handle.next_sent().await.unwrap();
        assert_eq!(pong.header().msg_type(), MessageType::MethodReturn);
        assert_eq!(pong.header().reply_serial(), Some(7));
        assert_eq!(pong.header().destination(), Some(":1.2"));
        assert!(pong.body().is_empty());
    }

    #[tokio::test]
    async fn peer_get_machine_id_replies_with_the_machine_id() {
        let (_conn, mut handle) = connected().await;
        let mut call = Message::method(
            None,
            "/",
            Some(fdo::PEER_INTERFACE),
            "GetMachineId",
            Body::empty(),
        );
        call.header_mut().set_serial(8);
        call.header_mut().set_sender(Some(":1.2".to_string()));
        handle.push(call);

        let reply = handle.next_sent().await.unwrap();
        assert_eq!(reply.header().reply_serial(), Some(8));
        assert_eq!(reply.body_reader().get_str().unwrap(), crate::machine_id());
    }

    #[tokio::test]
    async fn unbound_path_gets_an_unknown_method_error() {
        let (_conn, mut handle) = connected().await;
        let mut call = Message::method(
            None,
            "/unbound",
            Some("com.example.Iface"),
            "Frob",
            BodyWriter::new().put_str("x").finish(),
        );
        call.header_mut().set_serial(9);
        call.header_mut().set_sender(Some(":1.3".to_string()));
        handle.push(call);

        let reply = handle.next_sent().await.unwrap();
        assert_eq!(reply.header().msg_type(), MessageType::Error);
        assert_eq!(reply.header().error_name(), Some(fdo::ERR_UNKNOWN_METHOD));
        assert_eq!(reply.header().reply_serial(), Some(9));
        assert_eq!(
            reply.body_reader().get_str().unwrap(),
            "Method \"Frob\" with signature \"s\" on interface \"com.example.Iface\" doesn't exist"
        );
    }

    #[tokio::test]
    async fn unbound_call_without_reply_expected_is_dropped() {
        let (_conn, mut handle) = connected().await;
        let mut call = Message::method(None, "/unbound", Some("i.I"), "Frob", Body::empty());
        call.header_mut().set_serial(10);
        call.header_mut()
            .set_flags(BitFlags::from(MessageFlags::NoReplyExpected));
        handle.push(call);

        barrier(&mut handle).await;
        assert!(handle.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn method_handlers_produce_correlated_replies() {
        let (conn, mut handle) = connected().await;
        conn.add_method_handler("/svc", |call: Message| async move {
            Ok(Message::method_reply(
                &call,
                BodyWriter::new().put_str("yay").finish(),
            ))
        })
        .unwrap();

        let mut call = Message::method(None, "/svc", Some("com.example.Svc"), "Do", Body::empty());
        call.header_mut().set_serial(11);
        call.header_mut().set_sender(Some(":1.5".to_string()));
        handle.push(call);

        let reply = handle.next_sent().await.unwrap();
        assert_eq!(reply.header().msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.header().reply_serial(), Some(11));
        assert_eq!(reply.header().destination(), Some(":1.5"));
        assert_eq!(reply.body_reader().get_str().unwrap(), "yay");

        // at most one handler per path
        assert!(matches!(
            conn.add_method_handler("/svc", |call: Message| async move {
                Ok(Message::method_reply(&call, Body::empty()))
            }),
            Err(Error::InvalidOperation(_))
        ));
        assert!(conn.remove_method_handler("/svc"));
        assert!(!conn.remove_method_handler("/svc"));
    }

    #[tokio::test]
    async fn failing_method_handler_replies_with_an_error() {
        let (conn, mut handle) = connected().await;
        conn.add_method_handler("/svc", |_call: Message| async move {
            Err::<Message, Error>(Error::InvalidOperation("handler rejected".to_string()))
        })
        .unwrap();

        let mut call = Message::method(None, "/svc", Some("i.I"), "Do", Body::empty());
        call.header_mut().set_serial(12);
        call.header_mut().set_sender(Some(":1.5".to_string()));
        handle.push(call);

        let reply = handle.next_sent().await.unwrap();
        assert_eq!(reply.header().msg_type(), MessageType::Error);
        assert_eq!(reply.header().error_name(), Some(fdo::ERR_FAILED));
        // a served error is a reply, not an engine failure
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn name_owner_changes_reach_the_watcher() {
        let (conn, mut handle) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let changes = seen.clone();
        let watch = conn.watch_name_owner("com.x", move |change| {
            changes.lock().push(change.clone());
            Ok(())
        });
        let serve = async {
            let add = serve_call(&mut handle, "AddMatch", |c| {
                Message::method_reply(c, Body::empty())
            })
            .await;
            assert_eq!(
                add.body_reader().get_str().unwrap(),
                fdo::owner_changed_rule("com.x")
            );
        };
        let (reg, ()) = tokio::join!(watch, serve);
        let _reg = reg.unwrap();

        handle.push(inbound_signal(
            fdo::DBUS_PATH,
            fdo::DBUS_INTERFACE,
            "NameOwnerChanged",
            BodyWriter::new()
                .put_str("com.x")
                .put_str("")
                .put_str(":1.5")
                .finish(),
        ));
        barrier(&mut handle).await;

        assert_eq!(
            *seen.lock(),
            vec![OwnerChange {
                name: "com.x".to_string(),
                old_owner: None,
                new_owner: Some(":1.5".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn request_name_acquires_and_notifies() {
        let (conn, mut handle) = connected().await;
        let acquired = Arc::new(Mutex::new(Vec::new()));
        let lost = Arc::new(Mutex::new(Vec::new()));

        let on_acquired = acquired.clone();
        let on_lost = lost.clone();
        let request = conn.request_name(
            "com.example.Svc",
            RequestNameFlags::ReplaceExisting.into(),
            Some(Arc::new(move |name: &str| {
                on_acquired.lock().push(name.to_string())
            })),
            Some(Arc::new(move |name: &str| {
                on_lost.lock().push(name.to_string())
            })),
            None,
        );
        let serve = async {
            let call = serve_call(&mut handle, "RequestName", |c| {
                reply_u32(c, RequestNameReply::PrimaryOwner.into())
            })
            .await;
            let mut reader = call.body_reader();
            assert_eq!(reader.get_str().unwrap(), "com.example.Svc");
            assert_eq!(reader.get_u32().unwrap(), 0x02);
        };
        let (reply, ()) = tokio::join!(request, serve);
        assert_eq!(reply.unwrap(), RequestNameReply::PrimaryOwner);

        // duplicates are refused locally, before any bus call
        assert!(matches!(
            conn.request_name("com.example.Svc", BitFlags::empty(), None, None, None)
                .await,
            Err(Error::InvalidOperation(_))
        ));
        assert!(handle.try_next_sent().is_none());

        handle.push(inbound_signal(
            fdo::DBUS_PATH,
            fdo::DBUS_INTERFACE,
            "NameAcquired",
            BodyWriter::new().put_str("com.example.Svc").finish(),
        ));
        handle.push(inbound_signal(
            fdo::DBUS_PATH,
            fdo::DBUS_INTERFACE,
            "NameLost",
            BodyWriter::new().put_str("com.example.Svc").finish(),
        ));
        barrier(&mut handle).await;
        assert_eq!(*acquired.lock(), vec!["com.example.Svc".to_string()]);
        assert_eq!(*lost.lock(), vec!["com.example.Svc".to_string()]);
    }

    #[tokio::test]
    async fn name_callbacks_can_run_on_a_dispatch_handle() {
        let (conn, mut handle) = connected().await;
        let acquired = Arc::new(AtomicUsize::new(0));

        let count = acquired.clone();
        let request = conn.request_name(
            "com.x",
            BitFlags::empty(),
            Some(Arc::new(move |_: &str| {
                count.fetch_add(1, Ordering::SeqCst);
            })),
            None,
            Some(tokio::runtime::Handle::current()),
        );
        let serve = async {
            serve_call(&mut handle, "RequestName", |c| {
                reply_u32(c, RequestNameReply::PrimaryOwner.into())
            })
            .await;
        };
        let (reply, ()) = tokio::join!(request, serve);
        reply.unwrap();

        handle.push(inbound_signal(
            fdo::DBUS_PATH,
            fdo::DBUS_INTERFACE,
            "NameAcquired",
            BodyWriter::new().put_str("com.x").finish(),
        ));
        barrier(&mut handle).await;
        while acquired.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_acquisition_forgets_the_registration() {
        let (conn, mut handle) = connected().await;

        let request =
            conn.request_name("com.x", RequestNameFlags::DoNotQueue.into(), None, None, None);
        let serve = async {
            serve_call(&mut handle, "RequestName", |c| {
                reply_u32(c, RequestNameReply::Exists.into())
            })
            .await;
        };
        let (reply, ()) = tokio::join!(request, serve);
        assert_eq!(reply.unwrap(), RequestNameReply::Exists);

        // the registration is gone: a new request reaches the bus again
        let request =
            conn.request_name("com.x", RequestNameFlags::DoNotQueue.into(), None, None, None);
        let serve = async {
            serve_call(&mut handle, "RequestName", |c| {
                reply_u32(c, RequestNameReply::PrimaryOwner.into())
            })
            .await;
        };
        let (reply, ()) = tokio::join!(request, serve);
        assert_eq!(reply.unwrap(), RequestNameReply::PrimaryOwner);
    }

    #[tokio::test]
    async fn releasing_an_unowned_name_skips_the_bus() {
        let (conn, mut handle) = connected().await;
        assert_eq!(
            conn.release_name("never.owned").await.unwrap(),
            ReleaseNameReply::NotOwner
        );
        assert!(handle.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn release_name_round_trip() {
        let (conn, mut handle) = connected().await;

        let request = conn.request_name("com.x", BitFlags::empty(), None, None, None);
        let serve = async {
            serve_call(&mut handle, "RequestName", |c| {
                reply_u32(c, RequestNameReply::PrimaryOwner.into())
            })
            .await;
        };
        let (reply, ()) = tokio::join!(request, serve);
        reply.unwrap();

        let release = conn.release_name("com.x");
        let serve = async {
            let call = serve_call(&mut handle, "ReleaseName", |c| {
                reply_u32(c, ReleaseNameReply::Released.into())
            })
            .await;
            assert_eq!(call.body_reader().get_str().unwrap(), "com.x");
        };
        let (reply, ()) = tokio::join!(release, serve);
        assert_eq!(reply.unwrap(), ReleaseNameReply::Released);
    }

    #[tokio::test]
    async fn stream_failure_fails_all_pending_calls() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let count = disconnects.clone();
        let (conn, mut handle) = connected_with(Some(Box::new(move |reason| {
            assert!(reason.is_some());
            count.fetch_add(1, Ordering::SeqCst);
        })))
        .await;

        let c1 = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call_method(None, "/x", Some("i.I"), "A", Body::empty()).await }
        });
        let c2 = tokio::spawn({
            let conn = conn.clone();
            async move { conn.call_method(None, "/x", Some("i.I"), "B", Body::empty()).await }
        });
        // both frames on the wire before the failure
        handle.next_sent().await.unwrap();
        handle.next_sent().await.unwrap();

        handle.fail(io::Error::new(io::ErrorKind::BrokenPipe, "wire cut"));

        for result in vec![c1.await.unwrap(), c2.await.unwrap()] {
            match result {
                Err(Error::Disconnected(cause)) => match &*cause {
                    Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
                    other => panic!("unexpected cause: {:?}", other),
                },
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            conn.emit_signal("/a", "i.I", "S", Body::empty()),
            Err(Error::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let count = disconnects.clone();
        let (conn, _handle) = connected_with(Some(Box::new(move |reason| {
            assert!(reason.is_none());
            count.fetch_add(1, Ordering::SeqCst);
        })))
        .await;

        conn.dispose();
        conn.dispose();
        assert_eq!(conn.state(), ConnectionState::Disposed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            conn.call_method(None, "/x", Some("i.I"), "M", Body::empty()).await,
            Err(Error::Disposed)
        ));
    }

    #[tokio::test]
    async fn dispose_after_disconnect_only_upgrades_the_state() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let count = disconnects.clone();
        let (conn, handle) = connected_with(Some(Box::new(move |reason| {
            assert!(reason.is_some());
            count.fetch_add(1, Ordering::SeqCst);
        })))
        .await;

        handle.fail(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        while conn.state() == ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.dispose();
        assert_eq!(conn.state(), ConnectionState::Disposed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsolicited_reply_is_a_protocol_violation() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let count = disconnects.clone();
        let (conn, handle) = connected_with(Some(Box::new(move |reason| {
            match reason.as_deref() {
                Some(Error::Protocol(_)) => {}
                other => panic!("unexpected reason: {:?}", other),
            }
            count.fetch_add(1, Ordering::SeqCst);
        })))
        .await;

        let mut header = MessageHeader::new(MessageType::MethodReturn);
        header.set_reply_serial(Some(999));
        handle.push(Message::from_parts(header, vec![]));

        while conn.state() == ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_close_reports_the_peer_hangup() {
        let (conn, handle) = connected().await;
        handle.close_remote();
        while conn.state() == ConnectionState::Connected {
            tokio::task::yield_now().await;
        }

        match conn.call_method(None, "/x", Some("i.I"), "M", Body::empty()).await {
            Err(Error::Disconnected(cause)) => match &*cause {
                Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
                other => panic!("unexpected cause: {:?}", other),
            },
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
