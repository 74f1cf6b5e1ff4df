//! # Dispatch
//!
//! Delivery of connection events to application code.
//!
//! The application implements [`Handler`]. Its callbacks never run on the task that drives the
//! connection: each event becomes a job submitted to an [`Executor`], which must run jobs one at
//! a time in submission order. Callbacks of one connection therefore never overlap and observe
//! events in the order they happened.
//!
//! Two executors are provided:
//!
//! - [`SerialQueue`], a dedicated thread draining a queue. Unless told otherwise every
//!   connection shares one lazily started process-wide queue.
//! - [`Immediate`], which runs the callback inline on the connection task. Handlers must then
//!   return quickly.
use std::{
    io,
    sync::{Arc, Mutex, OnceLock},
    thread,
};

use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};

use crate::{
    close::CloseInfo,
    connection::Event,
    Message, WebSocketError,
};

/// Application callbacks.
///
/// Only [`Handler::on_message`] is required. Any `FnMut(Message)` closure is a handler that
/// ignores everything but messages.
///
/// Exactly one of [`Handler::on_close`] and [`Handler::on_failure`] is called per connection,
/// and nothing is called after it.
pub trait Handler: Send + 'static {
    /// A complete message arrived.
    fn on_message(&mut self, message: Message);

    /// The opening handshake completed; sends are now accepted.
    fn on_open(&mut self) {}

    /// A pong arrived.
    fn on_pong(&mut self, _payload: Bytes) {}

    /// The connection ended.
    fn on_close(&mut self, _info: CloseInfo) {}

    /// The connection could not be established, or its transport failed.
    fn on_failure(&mut self, _error: WebSocketError) {}
}

impl<F> Handler for F
where
    F: FnMut(Message) + Send + 'static,
{
    fn on_message(&mut self, message: Message) {
        self(message)
    }
}

/// A unit of work submitted to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs callback jobs.
///
/// Implementations must run jobs one at a time, in the order they were submitted.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Runs jobs inline, on the thread that submits them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Executor for Immediate {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Runs jobs on a dedicated thread, in order.
///
/// The thread exits once every clone of the queue has been dropped and the remaining jobs ran.
#[derive(Debug, Clone)]
pub struct SerialQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Starts a queue whose thread is called `name`.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded::<Job>();

        thread::Builder::new().name(name.into()).spawn(move || {
            while let Some(job) = futures::executor::block_on(receiver.next()) {
                job();
            }
        })?;

        Ok(Self { sender })
    }
}

impl Executor for SerialQueue {
    fn execute(&self, job: Job) {
        if self.sender.unbounded_send(job).is_err() {
            #[cfg(feature = "logging")]
            log::error!("callback queue is gone, dropping job");
        }
    }
}

/// The executor used by connections that were not given one.
pub fn default_executor() -> Arc<dyn Executor> {
    static DEFAULT: OnceLock<Arc<dyn Executor>> = OnceLock::new();

    DEFAULT
        .get_or_init(|| {
            // a process without a callback thread cannot deliver anything
            let queue = SerialQueue::new("wsclient-callbacks").expect("spawn callback thread");
            Arc::new(queue)
        })
        .clone()
}

/// Routes the events of one connection to its handler.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: Arc<Mutex<Box<dyn Handler>>>,
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub(crate) fn new(handler: Box<dyn Handler>, executor: Arc<dyn Executor>) -> Self {
        Self {
            handler: Arc::new(Mutex::new(handler)),
            executor,
        }
    }

    pub(crate) fn dispatch(&self, event: Event) {
        let handler = Arc::clone(&self.handler);
        self.executor.execute(Box::new(move || {
            // a handler that panicked earlier still gets the remaining events
            let mut handler = handler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match event {
                Event::Open => handler.on_open(),
                Event::Message(message) => handler.on_message(message),
                Event::Pong(payload) => handler.on_pong(payload),
                Event::Close(info) => handler.on_close(info),
                Event::Failure(error) => handler.on_failure(error),
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CloseCode;
    use std::sync::mpsc as std_mpsc;

    struct Recorder(std_mpsc::Sender<String>);

    impl Handler for Recorder {
        fn on_message(&mut self, message: Message) {
            let _ = self.0.send(format!("message {}", message.as_text().unwrap_or("?")));
        }

        fn on_open(&mut self) {
            let _ = self.0.send("open".into());
        }

        fn on_close(&mut self, info: CloseInfo) {
            let _ = self.0.send(format!("close {}", u16::from(info.code)));
        }
    }

    fn events() -> Vec<Event> {
        let mut events = vec![Event::Open];
        for i in 0..100 {
            events.push(Event::Message(Message::from(i.to_string())));
        }
        events.push(Event::Close(CloseInfo {
            code: CloseCode::Normal,
            reason: String::new(),
            was_clean: true,
        }));
        events
    }

    fn expected() -> Vec<String> {
        let mut expected = vec!["open".to_string()];
        expected.extend((0..100).map(|i| format!("message {i}")));
        expected.push("close 1000".into());
        expected
    }

    #[test]
    fn test_serial_queue_preserves_order() {
        let (tx, rx) = std_mpsc::channel();
        let queue = SerialQueue::new("test-queue").unwrap();
        let dispatcher = Dispatcher::new(Box::new(Recorder(tx)), Arc::new(queue));

        for event in events() {
            dispatcher.dispatch(event);
        }
        drop(dispatcher);

        let received: Vec<String> = rx.iter().collect();
        assert_eq!(received, expected());
    }

    #[test]
    fn test_immediate_runs_inline() {
        let (tx, rx) = std_mpsc::channel();
        let dispatcher = Dispatcher::new(Box::new(Recorder(tx)), Arc::new(Immediate));

        dispatcher.dispatch(Event::Open);
        assert_eq!(rx.try_recv().unwrap(), "open");
    }

    #[test]
    fn test_closure_handler() {
        let (tx, rx) = std_mpsc::channel();
        let handler = move |message: Message| {
            let _ = tx.send(message);
        };
        let dispatcher = Dispatcher::new(Box::new(handler), Arc::new(Immediate));

        dispatcher.dispatch(Event::Open);
        dispatcher.dispatch(Event::Message(Message::from("hi")));
        assert_eq!(rx.try_recv().unwrap(), Message::from("hi"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_default_executor_is_shared() {
        let a = default_executor();
        let b = default_executor();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
