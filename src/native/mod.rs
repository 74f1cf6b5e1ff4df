//! Native WebSocket client for the Tokio runtime.

mod driver;
mod stream;

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, OnceLock,
};

use bytes::Bytes;
use futures::channel::mpsc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    runtime::{self, Handle, Runtime},
};
use url::Url;

use crate::{
    close::{self, CloseCode},
    connection::{Connection, ReadyState},
    dispatch::{self, Dispatcher, Executor, Handler},
    frame::MAX_CONTROL_PAYLOAD,
    handshake::ClientHandshake,
    FrameError, Message, Options, Result, WebSocketError,
};

use driver::Driver;

/// Requests from the application handles to the connection task.
enum Command {
    Send(Message),
    SendFragmented(Message, usize),
    Ping(Bytes),
    Close(CloseCode, String),
}

/// State the connection task publishes to the application handles.
struct Shared {
    state: AtomicU8,
    protocol: OnceLock<String>,
}

impl Shared {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Everything `open` consumes.
struct Setup {
    handler: Box<dyn Handler>,
    executor: Option<Arc<dyn Executor>>,
    runtime: Option<Handle>,
    commands: mpsc::UnboundedReceiver<Command>,
}

struct Inner {
    url: Url,
    options: Options,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    setup: Mutex<Option<Setup>>,
}

/// A WebSocket client connection.
///
/// `WebSocket` is a cheap, cloneable handle. The connection itself lives in a task on a tokio
/// runtime, and reports everything that happens to a [`Handler`] through an [`Executor`].
///
/// A `WebSocket` is single use: it is [opened](WebSocket::open) once, and once closed it stays
/// closed. Dropping every handle closes the connection with [`CloseCode::Away`].
///
/// # Example
/// ```no_run
/// use wsclient::{Message, Options, WebSocket};
///
/// # fn main() -> wsclient::Result<()> {
/// let ws = WebSocket::with_options(
///     "wss://chat.example.com/socket".parse()?,
///     Options::default().with_protocols(["chat"]),
///     |message: Message| println!("received {message:?}"),
/// );
/// ws.open()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

impl WebSocket {
    /// Creates a connection to `url` with default [`Options`].
    ///
    /// Nothing happens on the network until [`WebSocket::open`] is called.
    pub fn new(url: Url, handler: impl Handler) -> Self {
        Self::with_options(url, Options::default(), handler)
    }

    /// Creates a connection to `url`.
    pub fn with_options(url: Url, options: Options, handler: impl Handler) -> Self {
        let (sender, receiver) = mpsc::unbounded();

        Self {
            inner: Arc::new(Inner {
                url,
                options,
                shared: Arc::new(Shared {
                    state: AtomicU8::new(ReadyState::Connecting as u8),
                    protocol: OnceLock::new(),
                }),
                commands: sender,
                setup: Mutex::new(Some(Setup {
                    handler: Box::new(handler),
                    executor: None,
                    runtime: None,
                    commands: receiver,
                })),
            }),
        }
    }

    /// Delivers callbacks through `executor` instead of the process-wide default queue.
    ///
    /// # Errors
    /// [`WebSocketError::AlreadyOpened`] once the connection has been opened.
    pub fn set_executor(&self, executor: impl Executor) -> Result<()> {
        self.configure(|setup| setup.executor = Some(Arc::new(executor)))
    }

    /// Runs the connection task on the runtime behind `handle`.
    ///
    /// Without it, `open` uses the runtime it is called from, or a process-wide network runtime
    /// when called outside of one.
    ///
    /// # Errors
    /// [`WebSocketError::AlreadyOpened`] once the connection has been opened.
    pub fn schedule_on(&self, handle: Handle) -> Result<()> {
        self.configure(|setup| setup.runtime = Some(handle))
    }

    /// Connects to the URL and starts the opening handshake.
    ///
    /// Returns as soon as the connection task is started; the outcome is reported through
    /// [`Handler::on_open`] or [`Handler::on_failure`].
    ///
    /// # Errors
    /// - [`WebSocketError::AlreadyOpened`] if called more than once.
    /// - [`WebSocketError::InvalidHttpScheme`] or [`WebSocketError::MissingHost`] for URLs that
    ///   cannot be connected to.
    pub fn open(&self) -> Result<()> {
        let (driver, runtime) = self.start()?;
        let url = self.inner.url.clone();
        let options = self.inner.options.clone();

        runtime.spawn(driver.connect(url, options));
        Ok(())
    }

    /// Performs the opening handshake over an already established stream.
    ///
    /// The stream is used as is: no TLS is layered on top of it and no trust gate is consulted.
    pub fn open_with_stream<S>(&self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (driver, runtime) = self.start()?;

        runtime.spawn(driver.run(io));
        Ok(())
    }

    /// Queues a message.
    ///
    /// # Errors
    /// - [`WebSocketError::NotOpen`] before [`Handler::on_open`].
    /// - [`WebSocketError::ConnectionClosed`] once closing, only with
    ///   [`Options::with_error_on_closed_send`]. Otherwise the message is dropped.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.command(Command::Send(message.into()))
    }

    /// Queues a message split in frames of at most `fragment_size` bytes.
    pub fn send_fragmented(&self, message: impl Into<Message>, fragment_size: usize) -> Result<()> {
        self.command(Command::SendFragmented(message.into(), fragment_size))
    }

    /// Sends a ping. The answer is reported through [`Handler::on_pong`].
    ///
    /// # Errors
    /// [`FrameError::InvalidControlFrame`] for payloads over 125 bytes, plus the errors of
    /// [`WebSocket::send`].
    pub fn send_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::InvalidControlFrame.into());
        }
        self.command(Command::Ping(payload))
    }

    /// Serializes `data` to JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&self, data: &T) -> Result<()> {
        let text = serde_json::to_string(data)?;
        self.send(Message::Text(text))
    }

    /// Starts the closing handshake with [`CloseCode::Normal`].
    pub fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal, "")
    }

    /// Starts the closing handshake. Closing an already closing connection does nothing.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseCode`] for codes that may not be sent.
    /// - [`WebSocketError::CloseReasonTooLong`] for reasons over 123 bytes.
    pub fn close_with(&self, code: CloseCode, reason: &str) -> Result<()> {
        close::validate(code, reason)?;

        if self.ready_state() >= ReadyState::Closing {
            return Ok(());
        }
        // the task may be gone already, in which case the connection is closed anyway
        let _ = self
            .inner
            .commands
            .unbounded_send(Command::Close(code, reason.to_owned()));
        Ok(())
    }

    /// The state of the connection, as last published by the connection task.
    pub fn ready_state(&self) -> ReadyState {
        self.inner.shared.ready_state()
    }

    /// The subprotocol selected by the server, once open.
    pub fn protocol(&self) -> Option<&str> {
        self.inner.shared.protocol.get().map(String::as_str)
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    fn configure(&self, f: impl FnOnce(&mut Setup)) -> Result<()> {
        let mut setup = self.lock_setup();
        let setup = setup.as_mut().ok_or(WebSocketError::AlreadyOpened)?;
        f(setup);
        Ok(())
    }

    fn lock_setup(&self) -> std::sync::MutexGuard<'_, Option<Setup>> {
        self.inner
            .setup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consumes the setup and builds the connection task.
    fn start(&self) -> Result<(Driver, Handle)> {
        let mut setup = self.lock_setup();
        if setup.is_none() {
            return Err(WebSocketError::AlreadyOpened);
        }

        let options = &self.inner.options;
        let handshake =
            ClientHandshake::new(&self.inner.url, options.protocols.clone(), &options.headers)?;

        let Some(setup) = setup.take() else {
            return Err(WebSocketError::AlreadyOpened);
        };

        let executor = setup.executor.unwrap_or_else(dispatch::default_executor);
        let runtime = setup
            .runtime
            .or_else(|| Handle::try_current().ok())
            .unwrap_or_else(|| network_runtime().handle().clone());

        let driver = Driver::new(
            Connection::new(handshake, options),
            Arc::clone(&self.inner.shared),
            Dispatcher::new(setup.handler, executor),
            setup.commands,
            options,
        );
        Ok((driver, runtime))
    }

    fn command(&self, command: Command) -> Result<()> {
        match self.ready_state() {
            ReadyState::Connecting => Err(WebSocketError::NotOpen),
            ReadyState::Open => match self.inner.commands.unbounded_send(command) {
                Ok(()) => Ok(()),
                // the task ended before publishing it
                Err(_) => self.send_on_closed(),
            },
            ReadyState::Closing | ReadyState::Closed => self.send_on_closed(),
        }
    }

    fn send_on_closed(&self) -> Result<()> {
        if self.inner.options.error_on_closed_send {
            Err(WebSocketError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

/// The runtime used by connections opened outside of any tokio runtime.
fn network_runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();

    RUNTIME.get_or_init(|| {
        runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("wsclient-network")
            .enable_all()
            .build()
            // nothing can be connected without it
            .expect("build network runtime")
    })
}
