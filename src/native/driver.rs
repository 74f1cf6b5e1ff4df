//! The task that owns a connection: it moves bytes between the transport and the
//! [`Connection`], applies application commands and publishes events.
use std::{io, sync::atomic::Ordering, sync::Arc, time::Duration};

use bytes::BytesMut;
use futures::{channel::mpsc, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{sleep_until, Instant},
};
use url::Url;

use crate::{
    close::CloseCode,
    connection::{Connection, Event, ReadyState},
    dispatch::Dispatcher,
    Options,
};

use super::{stream, Command, Shared};

/// Size of a single read from the transport.
const READ_CHUNK: usize = 16 * 1024;

pub(super) struct Driver {
    conn: Connection,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    /// `false` once every application handle is gone.
    commands_open: bool,
    close_grace: Duration,
    handshake_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
}

impl Driver {
    pub(super) fn new(
        conn: Connection,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        commands: mpsc::UnboundedReceiver<Command>,
        options: &Options,
    ) -> Self {
        Self {
            conn,
            shared,
            dispatcher,
            commands,
            commands_open: true,
            close_grace: options.close_grace(),
            handshake_deadline: options.handshake_timeout.map(|timeout| Instant::now() + timeout),
            close_deadline: None,
        }
    }

    /// Opens the transport for `url`, then runs the connection over it.
    pub(super) async fn connect(mut self, url: Url, options: Options) {
        let connect = stream::connect(&url, &options);
        tokio::pin!(connect);

        let stream = loop {
            let handshake_deadline = self.handshake_deadline;

            tokio::select! {
                result = &mut connect => match result {
                    Ok(stream) => break stream,
                    Err(err) => {
                        self.conn.on_transport_error(err);
                        self.publish();
                        return;
                    }
                },
                command = self.commands.next(), if self.commands_open => {
                    // only a close can be pending before the handshake
                    self.on_command(command);
                }
                _ = sleep_until(handshake_deadline.unwrap_or_else(Instant::now)), if handshake_deadline.is_some() => {
                    self.conn.on_transport_error(handshake_timed_out());
                }
            }

            self.publish();
            if self.conn.ready_state() == ReadyState::Closed {
                return;
            }
        };

        #[cfg(feature = "logging")]
        log::debug!("connected to {url}");

        if stream.is_tls() {
            if let Some(gate) = options.trust_gate.as_deref() {
                let chain = stream.peer_certificates();
                if !self.conn.on_peer_certificates(gate, &chain) {
                    self.publish();
                    return;
                }
            }
        }

        self.run(stream).await;
    }

    /// Runs the connection over an established stream until it is closed.
    pub(super) async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
        // bytes were written since the last flush
        let mut unflushed = false;

        self.conn.on_transport_ready();
        self.publish();

        while self.conn.ready_state() != ReadyState::Closed {
            if self.conn.ready_state() == ReadyState::Closing && self.close_deadline.is_none() {
                self.close_deadline = Some(Instant::now() + self.close_grace);
            }

            let wants_write = self.conn.wants_write();
            let handshake_deadline = self
                .handshake_deadline
                .filter(|_| self.conn.ready_state() == ReadyState::Connecting);
            let close_deadline = self.close_deadline;
            read_buf.reserve(READ_CHUNK);

            let pending = self.conn.pending_write();
            let write = async {
                if pending.is_empty() {
                    writer.flush().await.map(|_| None)
                } else {
                    writer.write(pending).await.map(Some)
                }
            };

            tokio::select! {
                result = reader.read_buf(&mut read_buf) => match result {
                    Ok(0) => self.conn.on_eof(),
                    Ok(_) => {
                        self.conn.on_bytes(&read_buf);
                        read_buf.clear();
                    }
                    Err(err) => self.conn.on_transport_error(err),
                },
                result = write, if wants_write || unflushed => match result {
                    Ok(Some(0)) => self.conn.on_transport_error(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(Some(n)) => {
                        self.conn.advance_write(n);
                        unflushed = true;
                    }
                    Ok(None) => unflushed = false,
                    Err(err) => self.conn.on_transport_error(err),
                },
                command = self.commands.next(), if self.commands_open => {
                    self.on_command(command);
                }
                _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                    self.conn.on_close_timeout();
                }
                _ = sleep_until(handshake_deadline.unwrap_or_else(Instant::now)), if handshake_deadline.is_some() => {
                    self.conn.on_transport_error(handshake_timed_out());
                }
            }

            self.publish();
        }

        // the closing frame may still be waiting in the write buffer
        let conn = &mut self.conn;
        let shutdown = async {
            while conn.wants_write() {
                let n = writer.write(conn.pending_write()).await?;
                if n == 0 {
                    break;
                }
                conn.advance_write(n);
            }
            writer.flush().await?;
            writer.shutdown().await
        };
        if let Err(_err) = tokio::time::timeout(self.close_grace, shutdown).await {
            #[cfg(feature = "logging")]
            log::debug!("transport shutdown timed out");
        }
    }

    fn on_command(&mut self, command: Option<Command>) {
        let result = match command {
            Some(Command::Send(message)) => self.conn.send(message),
            Some(Command::SendFragmented(message, size)) => self.conn.send_fragmented(message, size),
            Some(Command::Ping(payload)) => self.conn.send_ping(payload),
            Some(Command::Close(code, reason)) => self.conn.close(code, &reason),
            None => {
                self.commands_open = false;

                #[cfg(feature = "logging")]
                log::debug!("all handles dropped, closing");

                self.conn.close(CloseCode::Away, "")
            }
        };

        if let Err(_err) = result {
            #[cfg(feature = "logging")]
            log::debug!("command rejected: {_err}");
        }
    }

    /// Publishes state changes, then hands queued events to the dispatcher.
    fn publish(&mut self) {
        self.shared
            .state
            .store(self.conn.ready_state() as u8, Ordering::Release);

        while let Some(event) = self.conn.poll_event() {
            if let Event::Open = event {
                if let Some(protocol) = self.conn.protocol() {
                    let _ = self.shared.protocol.set(protocol.to_owned());
                }
            }
            self.dispatcher.dispatch(event);
        }
    }
}

fn handshake_timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "opening handshake timed out")
}
