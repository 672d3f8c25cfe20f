//! The connection: handshake, the dispatcher thread and blocking calls.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::address::BusAddress;
use crate::auth::{self, DEFAULT_MAX_AUTH_LINE};
use crate::frame::FrameBuffer;
use crate::registry::{lock, ReplyRegistry};
use crate::stream::Stream;
use crate::wire::{self, Message, MessageFlags, MessageType, Value, MAX_MESSAGE_SIZE};
use crate::{Error, Result};

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// `ConnectionConfig` specifies the tunables of a [`Connection`].
///
/// Examples:
///
/// ```rust
/// use std::time::Duration;
///
/// let c = dbus::ConnectionConfig::default();
/// assert_eq!(c.call_timeout, Some(Duration::from_secs(25)));
/// assert_eq!(c.max_frame_size, 128 * 1024 * 1024);
/// assert_eq!(c.read_chunk, 4096);
///
/// let c = c.call_timeout(None).read_chunk(512);
/// assert!(c.call_timeout.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long a call waits for its reply, `None` waits forever
    pub call_timeout: Option<Duration>,
    /// Largest frame accepted from the bus
    pub max_frame_size: usize,
    /// Longest line accepted during authentication
    pub max_auth_line: usize,
    /// Size of a single socket read in the dispatcher
    pub read_chunk: usize,
    /// Number of unread errors kept for [`Connection::take_error_events`],
    /// fixed when the connection is constructed
    pub error_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            call_timeout: Some(Duration::from_secs(25)),
            max_frame_size: MAX_MESSAGE_SIZE,
            max_auth_line: DEFAULT_MAX_AUTH_LINE,
            read_chunk: 4096,
            error_capacity: 16,
        }
    }
}

impl ConnectionConfig {
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn max_auth_line(mut self, len: usize) -> Self {
        self.max_auth_line = len;
        self
    }

    pub fn read_chunk(mut self, len: usize) -> Self {
        self.read_chunk = len.max(1);
        self
    }

    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }
}

/// State shared between the connection and its dispatcher thread.
struct Shared {
    registry: ReplyRegistry,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    errors: mpsc::SyncSender<Error>,
    closing: AtomicBool,
}

impl Shared {
    fn publish(&self, e: Error) {
        if let Err(TrySendError::Full(e)) = self.errors.try_send(e) {
            debug!("Error channel full, dropping: {}", e);
        }
    }

    fn dispatch(&self, msg: Message) {
        match msg.message_type {
            MessageType::MethodReturn => {
                let Some(serial) = msg.reply_serial else {
                    return;
                };
                trace!("Reply to serial {}", serial);
                if !self.registry.complete(serial, Ok(msg)) {
                    debug!("Dropping unmatched reply to serial {}", serial);
                }
            }
            MessageType::Error => {
                let name = msg.error_name.clone().unwrap_or_default();
                let text = msg.first_str().unwrap_or_default().to_string();
                warn!(
                    "Error reply to serial {:?}: {}: {}",
                    msg.reply_serial, name, text
                );
                self.publish(Error::MethodError {
                    name: name.clone(),
                    message: text.clone(),
                });
                if let Some(serial) = msg.reply_serial {
                    let matched = self.registry.complete(
                        serial,
                        Err(Error::MethodError {
                            name,
                            message: text,
                        }),
                    );
                    if !matched {
                        debug!("Dropping unmatched error reply to serial {}", serial);
                    }
                }
            }
            MessageType::MethodCall | MessageType::Signal => {
                trace!(
                    "Ignoring {:?} {} from {:?}",
                    msg.message_type,
                    msg.qualified_member(),
                    msg.sender
                );
            }
        }
    }

    /// Pop and dispatch frames until the peer hangs up or something fails.
    fn run(
        &self,
        reader: &mut dyn Read,
        frames: &mut FrameBuffer,
        read_chunk: usize,
    ) -> Result<()> {
        let mut chunk = vec![0u8; read_chunk];
        loop {
            while let Some(msg) = frames.try_pop()? {
                self.dispatch(msg);
            }
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            frames.append(&chunk[..n])?;
        }
    }
}

fn dispatcher(
    shared: Arc<Shared>,
    mut reader: Box<dyn Read + Send>,
    mut frames: FrameBuffer,
    read_chunk: usize,
) {
    debug!("Dispatcher started");
    let result = shared.run(&mut *reader, &mut frames, read_chunk);
    let closing = shared.closing.load(Ordering::SeqCst);
    match result {
        _ if closing => debug!("Dispatcher stopped"),
        Ok(()) => {
            debug!("Connection closed by the bus");
            shared.publish(Error::ConnectionClosed);
        }
        Err(e) => {
            warn!("Dispatcher failed: {}", e);
            shared.publish(e);
        }
    }
    shared.registry.close(|| Error::ConnectionClosed);
    lock(&shared.writer).take();
}

/// A connection to a message bus.
///
/// Construct it with [`Connection::session`], [`Connection::system`] or
/// [`Connection::with_address`], then call [`Connection::initialize`]. The
/// connection is `Send + Sync`; share it with an `Arc` to issue calls from
/// several threads at once.
///
/// # Examples
///
/// ```rust,no_run
/// use dbus::Connection;
///
/// let conn = Connection::session()?;
/// conn.initialize()?;
/// println!("connected as {}", conn.unique_name().unwrap_or("?"));
/// for name in conn.list_names()? {
///     println!("{}", name);
/// }
/// # Ok::<(), dbus::Error>(())
/// ```
pub struct Connection {
    address: String,
    expected_guid: Option<String>,
    config: ConnectionConfig,
    stream: Mutex<Box<dyn Stream>>,
    shared: Arc<Shared>,
    error_events: Mutex<Option<mpsc::Receiver<Error>>>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    initialized: AtomicBool,
    guid: OnceLock<String>,
    unique_name: OnceLock<String>,
}

impl Connection {
    /// Connect to the session bus named by `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session() -> Result<Self> {
        Self::open(&BusAddress::session()?, ConnectionConfig::default())
    }

    /// Connect to the system bus.
    pub fn system() -> Result<Self> {
        Self::open(&BusAddress::system()?, ConnectionConfig::default())
    }

    pub fn with_address(address: &str) -> Result<Self> {
        Self::open(&BusAddress::parse(address)?, ConnectionConfig::default())
    }

    pub fn open(address: &BusAddress, config: ConnectionConfig) -> Result<Self> {
        let stream = address.connect()?;
        let mut conn = Self::from_stream(Box::new(stream), config);
        conn.address = address.to_string();
        conn.expected_guid = address.guid.clone();
        Ok(conn)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: Box<dyn Stream>, config: ConnectionConfig) -> Self {
        let (errors, error_events) = mpsc::sync_channel(config.error_capacity);
        Connection {
            address: String::new(),
            expected_guid: None,
            config,
            stream: Mutex::new(stream),
            shared: Arc::new(Shared {
                registry: ReplyRegistry::new(),
                writer: Mutex::new(None),
                errors,
                closing: AtomicBool::new(false),
            }),
            error_events: Mutex::new(Some(error_events)),
            dispatcher: Mutex::new(None),
            initialized: AtomicBool::new(false),
            guid: OnceLock::new(),
            unique_name: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Authenticate, start the dispatcher and register with the bus.
    ///
    /// Fails if the connection was initialized before.
    pub fn initialize(&self) -> Result<()> {
        if self.shared.registry.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol("connection is already initialized".into()));
        }

        let (mut reader, mut writer) = lock(&self.stream).split()?;
        let handshake = auth::authenticate(
            &mut reader,
            &mut writer,
            self.expected_guid.as_deref(),
            self.config.max_auth_line,
        )?;
        debug!("Authenticated, server guid {}", handshake.guid);
        let _ = self.guid.set(handshake.guid);

        let mut frames = FrameBuffer::with_max_frame_size(self.config.max_frame_size);
        frames.append(&handshake.leftover)?;
        *lock(&self.shared.writer) = Some(writer);

        let shared = self.shared.clone();
        let read_chunk = self.config.read_chunk;
        let handle = thread::Builder::new()
            .name("dbus-dispatch".into())
            .spawn(move || dispatcher(shared, reader, frames, read_chunk))?;
        *lock(&self.dispatcher) = Some(handle);

        let name = self.hello()?;
        debug!("Registered on the bus as {}", name);
        Ok(())
    }

    /// Send `Hello` and record the unique name the bus assigns.
    pub fn hello(&self) -> Result<String> {
        let reply = self.call(Message::method_call(
            BUS_NAME,
            BUS_PATH,
            BUS_INTERFACE,
            "Hello",
        ))?;
        let name = reply
            .first_str()
            .ok_or_else(|| {
                Error::Protocol(format!("Hello reply has signature '{}'", reply.signature))
            })?
            .to_string();
        let _ = self.unique_name.set(name.clone());
        Ok(name)
    }

    /// The unique name the bus assigned in reply to `Hello`.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.get().map(String::as_str)
    }

    /// The server guid received during authentication.
    pub fn guid(&self) -> Option<&str> {
        self.guid.get().map(String::as_str)
    }

    /// All names currently owned on the bus.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.call(Message::method_call(
            BUS_NAME,
            BUS_PATH,
            BUS_INTERFACE,
            "ListNames",
        ))?;
        match reply.body.first() {
            Some(Value::Array(_, names)) => Ok(names
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()),
            _ => Err(Error::Protocol(format!(
                "ListNames reply has signature '{}'",
                reply.signature
            ))),
        }
    }

    fn write(&self, msg: &Message) -> Result<()> {
        let bytes = wire::marshal(msg)?;
        let mut writer = lock(&self.shared.writer);
        let writer = match writer.as_mut() {
            Some(w) => w,
            None if self.shared.registry.is_closed() => return Err(Error::ConnectionClosed),
            None => return Err(Error::NotInitialized),
        };
        trace!(
            "Sending {:?} {} serial {}",
            msg.message_type,
            msg.qualified_member(),
            msg.serial
        );
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Send a call and block until its reply arrives, using the configured
    /// call timeout.
    pub fn call(&self, msg: Message) -> Result<Message> {
        self.call_timeout(msg, self.config.call_timeout)
    }

    /// Send a call and block until its reply arrives or `timeout` expires.
    ///
    /// An error reply from the peer fails the call with [`Error::MethodError`].
    /// After a timeout the call is forgotten, so a late reply is dropped.
    pub fn call_timeout(&self, mut msg: Message, timeout: Option<Duration>) -> Result<Message> {
        msg.flags.remove(MessageFlags::NO_REPLY_EXPECTED);
        let (tx, rx) = mpsc::sync_channel(1);
        let serial = self.shared.registry.register(Box::new(move |r| {
            let _ = tx.send(r);
        }))?;
        msg.serial = serial;

        if let Err(e) = self.write(&msg) {
            self.shared.registry.cancel(serial);
            return Err(e);
        }

        match timeout {
            None => rx.recv().unwrap_or(Err(Error::ConnectionClosed)),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(r) => r,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.registry.cancel(serial) {
                        debug!("Call with serial {} timed out", serial);
                        Err(Error::Timeout(serial))
                    } else {
                        // completed while we gave up
                        rx.recv().unwrap_or(Err(Error::ConnectionClosed))
                    }
                }
                Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
            },
        }
    }

    /// Send a call and hand its reply to `on_reply`.
    ///
    /// Blocks until the reply arrives. `on_reply` runs exactly once if the
    /// call succeeds and never if it fails.
    pub fn send_with_reply<F>(&self, msg: Message, on_reply: F) -> Result<()>
    where
        F: FnOnce(Message),
    {
        self.send_with_reply_timeout(msg, self.config.call_timeout, on_reply)
    }

    pub fn send_with_reply_timeout<F>(
        &self,
        msg: Message,
        timeout: Option<Duration>,
        on_reply: F,
    ) -> Result<()>
    where
        F: FnOnce(Message),
    {
        let reply = self.call_timeout(msg, timeout)?;
        on_reply(reply);
        Ok(())
    }

    /// Send a message without waiting for, or expecting, a reply.
    ///
    /// Returns the serial assigned to the message.
    pub fn send_no_reply(&self, mut msg: Message) -> Result<u32> {
        msg.serial = self.shared.registry.next_serial()?;
        if msg.message_type == MessageType::MethodCall {
            msg.flags.insert(MessageFlags::NO_REPLY_EXPECTED);
        }
        self.write(&msg)?;
        Ok(msg.serial)
    }

    /// The receiving end for failures that happen on the dispatcher thread.
    ///
    /// Error replies from the peer, protocol violations, I/O failures and the
    /// bus hanging up are all reported here. The channel is bounded; when it
    /// is full further errors are dropped. Returns `None` after the first call.
    pub fn take_error_events(&self) -> Option<mpsc::Receiver<Error>> {
        lock(&self.error_events).take()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry.is_closed()
    }

    /// Stop the dispatcher and fail every pending call with
    /// [`Error::ConnectionClosed`]. Calling it again does nothing.
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection");
        self.shared.registry.close(|| Error::ConnectionClosed);
        lock(&self.shared.writer).take();
        if let Err(e) = lock(&self.stream).shutdown() {
            trace!("Shutdown: {}", e);
        }
        if let Some(handle) = lock(&self.dispatcher).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
