//! # Connection
//!
//! The client connection state machine, free of any I/O.
//!
//! A [`Connection`] is driven from two sides:
//!
//! - the **transport** reports what happened to the byte stream: it became writable
//!   ([`Connection::on_transport_ready`]), bytes arrived ([`Connection::on_bytes`]), the peer
//!   hung up ([`Connection::on_eof`]), an I/O error occurred ([`Connection::on_transport_error`])
//!   or the close grace period ran out ([`Connection::on_close_timeout`]);
//! - the **application** asks for things: [`Connection::send`], [`Connection::send_ping`],
//!   [`Connection::close`].
//!
//! In return the connection fills a write buffer that the transport drains with
//! [`Connection::pending_write`] and [`Connection::advance_write`], and queues [`Event`]s that
//! are taken with [`Connection::poll_event`].
//!
//! ```text
//!  Connecting ──101──▶ Open ──close()/violation──▶ Closing ──peer Close/timeout/EOF──▶ Closed
//!      │                 │                                                            ▲
//!      └─────────────────┴──────── error, EOF, peer Close, bad frame ─────────────────┘
//! ```
//!
//! A frame that cannot be decoded leaves the byte stream misaligned. The connection then
//! queues its close frame and ends at once, without waiting for the peer's answer. Violations
//! found in well formed frames (fragmentation, UTF-8, close payloads) go through the closing
//! handshake.
//!
//! Exactly one terminal event, [`Event::Close`] or [`Event::Failure`], is queued per
//! connection. Once [`ReadyState::Closed`] is reached every input is ignored.
use std::{collections::VecDeque, io};

use bytes::{Buf, Bytes, BytesMut};
use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::{
    assembler::{Assembler, Message},
    close::{self, CloseCode, CloseInfo},
    codec::{Encoder, FrameParser, Role},
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    handshake::ClientHandshake,
    options::Options,
    trust::TrustGate,
    FrameError, Result, WebSocketError,
};

/// The lifecycle of a connection. It only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Something the application should hear about.
#[derive(Debug)]
pub enum Event {
    /// The opening handshake completed.
    Open,
    /// A complete message arrived.
    Message(Message),
    /// A pong arrived, solicited or not.
    Pong(Bytes),
    /// The connection ended through the closing handshake, a close timeout or a dropped
    /// transport.
    Close(CloseInfo),
    /// The connection could not be established, or its transport failed.
    Failure(WebSocketError),
}

/// Sans-io client connection.
pub struct Connection {
    state: ReadyState,
    handshake: Option<ClientHandshake>,
    request_sent: bool,
    handshake_buf: BytesMut,
    parser: FrameParser,
    assembler: Assembler,
    encoder: Encoder,
    write_buf: BytesMut,
    protocol: Option<String>,
    close_sent: bool,
    close_received: bool,
    /// Code and reason of the first close frame of the exchange.
    close_info: Option<(CloseCode, String)>,
    /// A protocol violation was detected; data frames are no longer delivered.
    failed: bool,
    terminated: bool,
    error_on_closed_send: bool,
    events: VecDeque<Event>,
}

impl Connection {
    /// Creates a connection that will perform `handshake`.
    pub fn new(handshake: ClientHandshake, options: &Options) -> Self {
        Self {
            state: ReadyState::Connecting,
            handshake: Some(handshake),
            request_sent: false,
            handshake_buf: BytesMut::new(),
            parser: FrameParser::new(options.payload_limit()),
            assembler: Assembler::new(options.message_limit()),
            encoder: Encoder::new(Role::Client),
            write_buf: BytesMut::new(),
            protocol: None,
            close_sent: false,
            close_received: false,
            close_info: None,
            failed: false,
            terminated: false,
            error_on_closed_send: options.error_on_closed_send,
            events: VecDeque::new(),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    /// The subprotocol selected by the server, once open.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    // ======== transport inputs ========

    /// The transport is established: queues the upgrade request.
    pub fn on_transport_ready(&mut self) {
        if self.state != ReadyState::Connecting || self.request_sent {
            return;
        }
        if let Some(handshake) = self.handshake.as_ref() {
            self.write_buf.extend_from_slice(handshake.request());
            self.request_sent = true;
        }
    }

    /// Lets `gate` decide whether the server's certificate chain is trusted.
    ///
    /// Returns `false` and fails the connection if the chain is rejected.
    pub fn on_peer_certificates(
        &mut self,
        gate: &dyn TrustGate,
        chain: &[CertificateDer<'_>],
    ) -> bool {
        if self.state != ReadyState::Connecting {
            return false;
        }
        if gate.evaluate(chain) {
            return true;
        }

        #[cfg(feature = "logging")]
        log::warn!("peer certificate chain rejected");

        self.fail(WebSocketError::CertificateRejected);
        false
    }

    /// Bytes arrived from the transport.
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        match self.state {
            ReadyState::Connecting => self.on_handshake_bytes(bytes),
            ReadyState::Open | ReadyState::Closing => self.on_frame_bytes(bytes),
            ReadyState::Closed => {}
        }
    }

    /// The peer closed its side of the transport.
    pub fn on_eof(&mut self) {
        match self.state {
            ReadyState::Connecting => self.fail(WebSocketError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during the opening handshake",
            ))),
            ReadyState::Open | ReadyState::Closing => self.finish(false),
            ReadyState::Closed => {}
        }
    }

    /// The transport failed, or could not be established.
    pub fn on_transport_error(&mut self, err: impl Into<WebSocketError>) {
        let err = err.into();

        #[cfg(feature = "logging")]
        log::debug!("transport error: {err}");

        self.fail(err);
    }

    /// The close grace period expired without the peer completing the closing handshake.
    pub fn on_close_timeout(&mut self) {
        if self.state == ReadyState::Closing {
            #[cfg(feature = "logging")]
            log::debug!("closing handshake timed out");

            self.finish(false);
        }
    }

    // ======== application inputs ========

    /// Queues a message.
    ///
    /// # Errors
    /// - [`WebSocketError::NotOpen`] before the opening handshake completed.
    /// - [`WebSocketError::ConnectionClosed`] once closing, if configured to report it.
    pub fn send(&mut self, message: Message) -> Result<()> {
        if !self.check_sendable()? {
            return Ok(());
        }

        let opcode = message.opcode();
        self.queue(Frame::new(true, opcode, None, message.into_bytes()));
        Ok(())
    }

    /// Queues a message split in frames of at most `fragment_size` bytes.
    pub fn send_fragmented(&mut self, message: Message, fragment_size: usize) -> Result<()> {
        if !self.check_sendable()? {
            return Ok(());
        }

        let opcode = message.opcode();
        let mut payload = message.into_bytes();
        let fragment_size = fragment_size.max(1);

        let mut next_opcode = opcode;
        loop {
            let chunk = payload.split_to(fragment_size.min(payload.len()));
            let fin = payload.is_empty();
            self.queue(Frame::new(fin, next_opcode, None, chunk));
            if fin {
                break;
            }
            next_opcode = OpCode::Continuation;
        }
        Ok(())
    }

    /// Queues a ping.
    ///
    /// # Errors
    /// [`FrameError::InvalidControlFrame`] if `payload` is longer than 125 bytes, plus the errors
    /// of [`Connection::send`].
    pub fn send_ping(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::InvalidControlFrame.into());
        }
        if !self.check_sendable()? {
            return Ok(());
        }

        self.queue(Frame::ping(payload));
        Ok(())
    }

    /// Starts the closing handshake. Closing twice is a no-op.
    ///
    /// Before the connection is open the transport is simply dropped: the connection moves to
    /// [`ReadyState::Closed`] and reports `code` with `was_clean == false`.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseCode`] for a code that may not be sent.
    /// - [`WebSocketError::CloseReasonTooLong`] for a reason over 123 bytes.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        close::validate(code, reason)?;

        match self.state {
            ReadyState::Connecting => {
                self.close_info = Some((code, reason.to_owned()));
                self.write_buf.clear();
                self.finish(false);
            }
            ReadyState::Open => {
                self.send_close(code, reason);
                self.state = ReadyState::Closing;
            }
            ReadyState::Closing | ReadyState::Closed => {}
        }
        Ok(())
    }

    // ======== outputs ========

    /// Returns `true` while bytes are waiting to be written.
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// The bytes waiting to be written, in order.
    pub fn pending_write(&self) -> &[u8] {
        &self.write_buf
    }

    /// Marks `n` bytes of [`Connection::pending_write`] as written.
    pub fn advance_write(&mut self, n: usize) {
        self.write_buf.advance(n);
    }

    /// Takes the next event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // ======== internals ========

    fn on_handshake_bytes(&mut self, bytes: &[u8]) {
        let Some(handshake) = self.handshake.as_ref() else {
            return;
        };

        self.handshake_buf.extend_from_slice(bytes);
        match handshake.parse_response(&mut self.handshake_buf) {
            Ok(None) => {}
            Ok(Some(negotiated)) => {
                #[cfg(feature = "logging")]
                log::debug!("handshake complete, protocol: {:?}", negotiated.protocol);

                self.handshake = None;
                self.handshake_buf = BytesMut::new();
                self.protocol = negotiated.protocol;
                self.state = ReadyState::Open;
                self.events.push_back(Event::Open);

                if !negotiated.leftover.is_empty() {
                    self.on_frame_bytes(&negotiated.leftover);
                }
            }
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("handshake failed: {err}");

                self.fail(err.into());
            }
        }
    }

    fn on_frame_bytes(&mut self, bytes: &[u8]) {
        self.parser.push(bytes);

        while self.state != ReadyState::Closed {
            match self.parser.next_frame() {
                Some(Ok(frame)) => self.on_frame(frame),
                Some(Err(err)) => {
                    // frame alignment is lost, the peer's close can never be read back
                    self.on_violation(err);
                    self.finish(false);
                }
                None => break,
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame.opcode {
            OpCode::Ping => {
                if !self.close_sent {
                    self.queue(Frame::pong(frame.payload));
                }
            }
            OpCode::Pong => self.events.push_back(Event::Pong(frame.payload)),
            OpCode::Close => self.on_close_frame(frame.payload),
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if self.failed {
                    return;
                }
                match self.assembler.push(frame) {
                    Ok(Some(message)) => self.events.push_back(Event::Message(message)),
                    Ok(None) => {}
                    Err(err) => self.on_violation(err),
                }
            }
        }
    }

    fn on_close_frame(&mut self, payload: Bytes) {
        self.close_received = true;

        let (code, reason) = match close::parse_payload(&payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.on_violation(err);
                return;
            }
        };

        #[cfg(feature = "logging")]
        log::debug!("received close frame: {code:?} {reason:?}");

        if self.close_info.is_none() {
            self.close_info = Some((code.unwrap_or(CloseCode::Status), reason));
        }
        if !self.close_sent {
            self.send_close(code.unwrap_or(CloseCode::Normal), "");
        }
        self.finish(true);
    }

    /// The peer broke the protocol: start closing with the matching code.
    fn on_violation(&mut self, err: WebSocketError) {
        if self.terminated {
            return;
        }

        #[cfg(feature = "logging")]
        log::warn!("protocol violation: {err}");

        self.failed = true;
        self.assembler.reset();

        if !self.close_sent {
            let reason = err.to_string();
            self.send_close(err.close_code(), close::truncate_reason(&reason));
            self.state = ReadyState::Closing;
        }
        if self.close_received {
            self.finish(true);
        }
    }

    fn send_close(&mut self, code: CloseCode, reason: &str) {
        #[cfg(feature = "logging")]
        log::debug!("sending close frame: {code:?} {reason:?}");

        if self.close_info.is_none() {
            self.close_info = Some((code, reason.to_owned()));
        }
        self.close_sent = true;
        self.queue(Frame::close(code, reason));
    }

    /// Returns whether a send should go on the wire.
    fn check_sendable(&self) -> Result<bool> {
        match self.state {
            ReadyState::Connecting => Err(WebSocketError::NotOpen),
            ReadyState::Open => Ok(true),
            ReadyState::Closing | ReadyState::Closed if self.error_on_closed_send => {
                Err(WebSocketError::ConnectionClosed)
            }
            ReadyState::Closing | ReadyState::Closed => Ok(false),
        }
    }

    fn queue(&mut self, frame: Frame) {
        self.encoder.encode_frame(frame, &mut self.write_buf);
    }

    /// Ends the connection with a close event.
    fn finish(&mut self, both_frames: bool) {
        if self.terminated {
            return;
        }

        let (code, reason) = self
            .close_info
            .take()
            .unwrap_or((CloseCode::Abnormal, String::new()));

        self.terminate();
        self.events.push_back(Event::Close(CloseInfo {
            code,
            reason,
            was_clean: both_frames && self.close_sent && self.close_received,
        }));
    }

    /// Ends the connection with a failure event.
    fn fail(&mut self, err: WebSocketError) {
        if self.terminated {
            return;
        }

        self.terminate();
        self.write_buf.clear();
        self.events.push_back(Event::Failure(err));
    }

    fn terminate(&mut self) {
        self.terminated = true;
        self.state = ReadyState::Closed;
        self.handshake = None;
        self.assembler.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::Decoder,
        handshake::accept_key,
        trust::PinnedCertificates,
        HandshakeError, MessageError,
    };
    use http::HeaderMap;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn connection(options: &Options) -> Connection {
        let handshake = ClientHandshake::with_key(
            &"ws://example.com/socket".parse().unwrap(),
            KEY.to_owned(),
            options.protocols.clone(),
            &HeaderMap::new(),
        )
        .unwrap();
        Connection::new(handshake, options)
    }

    fn response(extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n{extra}\r\n",
            accept_key(KEY)
        )
        .into_bytes()
    }

    fn server(frame: Frame) -> Vec<u8> {
        let mut dst = BytesMut::new();
        Encoder::new(Role::Server).encode_frame(frame, &mut dst);
        dst.to_vec()
    }

    fn open(options: &Options) -> Connection {
        let mut conn = connection(options);
        conn.on_transport_ready();
        drain_writes(&mut conn);
        conn.on_bytes(&response(""));
        assert!(matches!(conn.poll_event(), Some(Event::Open)));
        conn
    }

    fn drain_writes(conn: &mut Connection) -> Vec<u8> {
        let out = conn.pending_write().to_vec();
        conn.advance_write(out.len());
        out
    }

    /// Decodes what the client wrote, as the server would.
    fn written_frames(conn: &mut Connection) -> Vec<Frame> {
        let mut buf = BytesMut::from(&drain_writes(conn)[..]);
        let mut decoder = Decoder::new(Role::Server, usize::MAX);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode_frame(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    fn events(conn: &mut Connection) -> Vec<Event> {
        std::iter::from_fn(|| conn.poll_event()).collect()
    }

    fn close_info(event: Option<Event>) -> CloseInfo {
        match event {
            Some(Event::Close(info)) => info,
            other => panic!("expected a close event, got {other:?}"),
        }
    }

    fn close_code_of(frame: &Frame) -> u16 {
        assert_eq!(frame.opcode, OpCode::Close);
        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
    }

    #[test]
    fn test_handshake_request_and_open() {
        let mut conn = connection(&Options::default());
        assert_eq!(conn.ready_state(), ReadyState::Connecting);

        conn.on_transport_ready();
        conn.on_transport_ready();
        let request = drain_writes(&mut conn);
        let request = std::str::from_utf8(&request).unwrap();
        assert!(request.starts_with("GET /socket HTTP/1.1\r\n"));
        assert_eq!(request.matches("Sec-WebSocket-Key").count(), 1);

        let response = response("");
        conn.on_bytes(&response[..10]);
        assert!(conn.poll_event().is_none());
        conn.on_bytes(&response[10..]);

        assert!(matches!(conn.poll_event(), Some(Event::Open)));
        assert_eq!(conn.ready_state(), ReadyState::Open);
        assert_eq!(conn.protocol(), None);
    }

    #[test]
    fn test_negotiated_protocol() {
        let options = Options::default().with_protocols(["chat"]);
        let mut conn = connection(&options);
        conn.on_transport_ready();
        conn.on_bytes(&response("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(matches!(conn.poll_event(), Some(Event::Open)));
        assert_eq!(conn.protocol(), Some("chat"));
    }

    #[test]
    fn test_frames_after_response_in_same_read() {
        let mut conn = connection(&Options::default());
        conn.on_transport_ready();

        let mut bytes = response("");
        bytes.extend(server(Frame::text("early")));
        conn.on_bytes(&bytes);

        let events = events(&mut conn);
        assert!(matches!(events[0], Event::Open));
        assert!(matches!(&events[1], Event::Message(Message::Text(t)) if t == "early"));
    }

    #[test]
    fn test_handshake_failure() {
        let mut conn = connection(&Options::default());
        conn.on_transport_ready();
        conn.on_bytes(b"HTTP/1.1 404 Not Found\r\n\r\n");

        assert!(matches!(
            conn.poll_event(),
            Some(Event::Failure(WebSocketError::Handshake(HandshakeError::BadStatus(404))))
        ));
        assert_eq!(conn.ready_state(), ReadyState::Closed);
        assert!(conn.poll_event().is_none());
    }

    #[test]
    fn test_eof_mid_handshake() {
        let mut conn = connection(&Options::default());
        conn.on_transport_ready();
        conn.on_bytes(b"HTTP/1.1 101 Swi");
        conn.on_eof();

        match conn.poll_event() {
            Some(Event::Failure(WebSocketError::IoError(err))) => {
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(conn.poll_event().is_none());
    }

    #[test]
    fn test_send_before_open() {
        let mut conn = connection(&Options::default());
        assert!(matches!(conn.send("hi".into()), Err(WebSocketError::NotOpen)));
        assert!(matches!(conn.send_ping(Bytes::new()), Err(WebSocketError::NotOpen)));
    }

    #[test]
    fn test_send_masks_frames() {
        let mut conn = open(&Options::default());
        conn.send(Message::from("hello")).unwrap();
        conn.send(Message::from(vec![1u8, 2, 3])).unwrap();

        let frames = written_frames(&mut conn);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.is_masked() && f.fin));
        assert_eq!(frames[0].payload, Bytes::from_static(b"hello"));
        assert_eq!(frames[1].opcode, OpCode::Binary);
    }

    #[test]
    fn test_send_fragmented() {
        let mut conn = open(&Options::default());
        conn.send_fragmented(Message::from("abcdefg"), 3).unwrap();

        let frames = written_frames(&mut conn);
        let layout: Vec<_> = frames.iter().map(|f| (f.opcode, f.fin, f.payload.len())).collect();
        assert_eq!(
            layout,
            vec![
                (OpCode::Text, false, 3),
                (OpCode::Continuation, false, 3),
                (OpCode::Continuation, true, 1),
            ]
        );

        conn.send_fragmented(Message::from(""), 3).unwrap();
        let frames = written_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
    }

    #[test]
    fn test_fragmented_delivery_with_interleaved_ping() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&server(Frame::text("hel").with_fin(false)));
        conn.on_bytes(&server(Frame::ping("keepalive")));
        conn.on_bytes(&server(Frame::continuation("lo")));

        let events = events(&mut conn);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Message(Message::Text(t)) if t == "hello"));

        let frames = written_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Pong);
        assert_eq!(frames[0].payload, Bytes::from_static(b"keepalive"));
    }

    #[test]
    fn test_pong_event() {
        let mut conn = open(&Options::default());
        conn.send_ping(Bytes::from_static(b"p")).unwrap();
        assert_eq!(written_frames(&mut conn)[0].opcode, OpCode::Ping);

        conn.on_bytes(&server(Frame::pong("p")));
        assert!(matches!(conn.poll_event(), Some(Event::Pong(p)) if p == Bytes::from_static(b"p")));
    }

    #[test]
    fn test_ping_payload_limit() {
        let mut conn = open(&Options::default());
        assert!(matches!(
            conn.send_ping(Bytes::from(vec![0u8; 126])),
            Err(WebSocketError::Frame(FrameError::InvalidControlFrame))
        ));
        assert!(conn.send_ping(Bytes::from(vec![0u8; 125])).is_ok());
    }

    #[test]
    fn test_interleaved_opcode_closes_with_1002() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&server(Frame::text("part").with_fin(false)));
        conn.on_bytes(&server(Frame::binary("intruder")));
        conn.on_bytes(&server(Frame::continuation("rest")));

        assert!(events(&mut conn).is_empty());
        assert_eq!(conn.ready_state(), ReadyState::Closing);

        let frames = written_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(close_code_of(&frames[0]), 1002);

        conn.on_bytes(&server(Frame::close(CloseCode::Protocol, "")));
        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Protocol);
        assert!(info.was_clean);
        assert!(written_frames(&mut conn).is_empty());
    }

    #[test]
    fn test_invalid_utf8_closes_with_1007() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&server(Frame::text(&[0xF0, 0x28, 0x8C, 0x28][..])));

        assert!(events(&mut conn).is_empty());
        let frames = written_frames(&mut conn);
        assert_eq!(close_code_of(&frames[0]), 1007);
    }

    #[test]
    fn test_oversized_frame_closes_with_1009() {
        let mut conn = open(&Options::default().with_max_payload_read(16));
        conn.on_bytes(&server(Frame::binary(vec![0u8; 17])));

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Size);
        assert!(!info.was_clean);
        assert_eq!(close_code_of(&written_frames(&mut conn)[0]), 1009);
    }

    #[test]
    fn test_masked_server_frame_closes_with_1002() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&[0x81, 0x81, 1, 2, 3, 4, b'a' ^ 1]);

        assert_eq!(conn.ready_state(), ReadyState::Closed);
        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Protocol);
        assert!(!info.was_clean);
        assert_eq!(close_code_of(&written_frames(&mut conn)[0]), 1002);
    }

    #[test]
    fn test_undecodable_frame_fails_without_waiting_for_echo() {
        let mut conn = open(&Options::default());
        // reserved opcode 0x3, then a well formed close echo in the same read
        let mut bytes = vec![0x83, 0x00];
        bytes.extend(server(Frame::close(CloseCode::Protocol, "")));
        conn.on_bytes(&bytes);

        let events = events(&mut conn);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Close(info) => {
                assert_eq!(info.code, CloseCode::Protocol);
                assert!(!info.was_clean);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conn.ready_state(), ReadyState::Closed);

        // our close frame is still flushed before the transport goes away
        let frames = written_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(close_code_of(&frames[0]), 1002);

        // later bytes, including the echo, change nothing
        conn.on_bytes(&server(Frame::close(CloseCode::Protocol, "")));
        assert!(conn.poll_event().is_none());
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_clean_local_close() {
        let mut conn = open(&Options::default());
        conn.close(CloseCode::Normal, "bye").unwrap();
        conn.close(CloseCode::Away, "again").unwrap();
        assert_eq!(conn.ready_state(), ReadyState::Closing);

        let frames = written_frames(&mut conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(close_code_of(&frames[0]), 1000);
        assert_eq!(&frames[0].payload[2..], b"bye");

        // messages still arrive while closing
        conn.on_bytes(&server(Frame::text("last words")));
        conn.on_bytes(&server(Frame::close(CloseCode::Normal, "")));

        let events = events(&mut conn);
        assert!(matches!(&events[0], Event::Message(Message::Text(t)) if t == "last words"));
        match &events[1] {
            Event::Close(info) => {
                assert_eq!(info.code, CloseCode::Normal);
                assert_eq!(info.reason, "bye");
                assert!(info.was_clean);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conn.ready_state(), ReadyState::Closed);
        // no echo of the peer's close
        assert!(written_frames(&mut conn).is_empty());
    }

    #[test]
    fn test_peer_initiated_close_is_echoed() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&server(Frame::close(CloseCode::Away, "restarting")));

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Away);
        assert_eq!(info.reason, "restarting");
        assert!(info.was_clean);

        let frames = written_frames(&mut conn);
        assert_eq!(close_code_of(&frames[0]), 1001);
    }

    #[test]
    fn test_empty_peer_close() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&server(Frame::close_raw(Bytes::new())));

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Status);
        assert_eq!(close_code_of(&written_frames(&mut conn)[0]), 1000);
    }

    #[test]
    fn test_invalid_peer_close_payload() {
        let mut conn = open(&Options::default());
        conn.on_bytes(&server(Frame::close_raw(1006u16.to_be_bytes().to_vec())));

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Protocol);
        assert_eq!(close_code_of(&written_frames(&mut conn)[0]), 1002);
    }

    #[test]
    fn test_no_pong_after_close_sent() {
        let mut conn = open(&Options::default());
        conn.close(CloseCode::Normal, "").unwrap();
        drain_writes(&mut conn);

        conn.on_bytes(&server(Frame::ping("late")));
        assert!(written_frames(&mut conn).is_empty());
    }

    #[test]
    fn test_sends_while_closing() {
        let mut conn = open(&Options::default());
        conn.close(CloseCode::Normal, "").unwrap();
        drain_writes(&mut conn);
        assert!(conn.send("ignored".into()).is_ok());
        assert!(written_frames(&mut conn).is_empty());

        let mut conn = open(&Options::default().with_error_on_closed_send());
        conn.close(CloseCode::Normal, "").unwrap();
        assert!(matches!(conn.send("x".into()), Err(WebSocketError::ConnectionClosed)));
    }

    #[test]
    fn test_close_validation() {
        let mut conn = open(&Options::default());
        assert!(matches!(
            conn.close(CloseCode::Abnormal, ""),
            Err(WebSocketError::InvalidCloseCode(1006))
        ));
        assert!(matches!(
            conn.close(CloseCode::Normal, &"r".repeat(124)),
            Err(WebSocketError::CloseReasonTooLong)
        ));
        assert_eq!(conn.ready_state(), ReadyState::Open);
    }

    #[test]
    fn test_close_timeout() {
        let mut conn = open(&Options::default());
        conn.close(CloseCode::Normal, "done").unwrap();
        conn.on_close_timeout();

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Normal);
        assert!(!info.was_clean);
    }

    #[test]
    fn test_eof_while_open() {
        let mut conn = open(&Options::default());
        conn.on_eof();

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Abnormal);
        assert!(!info.was_clean);
    }

    #[test]
    fn test_close_while_connecting() {
        let mut conn = connection(&Options::default());
        conn.on_transport_ready();
        conn.close(CloseCode::Away, "never mind").unwrap();

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Away);
        assert!(!info.was_clean);
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_nothing_after_closed() {
        let mut conn = open(&Options::default());
        conn.on_eof();
        assert!(matches!(conn.poll_event(), Some(Event::Close(_))));

        conn.on_bytes(&server(Frame::text("ghost")));
        conn.on_eof();
        conn.on_close_timeout();
        conn.on_transport_error(io::Error::other("late"));
        conn.close(CloseCode::Normal, "").unwrap();
        assert!(conn.send("x".into()).is_ok());

        assert!(conn.poll_event().is_none());
        assert!(!conn.wants_write());
        assert_eq!(conn.ready_state(), ReadyState::Closed);
    }

    #[test]
    fn test_transport_error() {
        let mut conn = open(&Options::default());
        conn.on_transport_error(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(
            conn.poll_event(),
            Some(Event::Failure(WebSocketError::IoError(_)))
        ));
        assert!(conn.poll_event().is_none());
    }

    #[test]
    fn test_trust_gate() {
        let pinned = CertificateDer::from(b"pinned".to_vec());
        let gate = PinnedCertificates::new([pinned.clone()]);

        let mut conn = connection(&Options::default());
        assert!(conn.on_peer_certificates(&gate, &[pinned]));
        assert_eq!(conn.ready_state(), ReadyState::Connecting);

        let mut conn = connection(&Options::default());
        assert!(!conn.on_peer_certificates(&gate, &[CertificateDer::from(b"other".to_vec())]));
        assert!(matches!(
            conn.poll_event(),
            Some(Event::Failure(WebSocketError::CertificateRejected))
        ));
        conn.on_transport_ready();
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_utf8_close_reason_error_maps_to_1007() {
        let mut conn = open(&Options::default());
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.push(0xFF);
        conn.on_bytes(&server(Frame::close_raw(payload)));

        let info = close_info(conn.poll_event());
        assert_eq!(info.code, CloseCode::Invalid);
        assert!(matches!(
            WebSocketError::from(MessageError::InvalidUtf8).close_code(),
            CloseCode::Invalid
        ));
    }
}
