//! # Codec
//!
//! Incremental encoding and decoding of WebSocket frames.
//!
//! The [`Decoder`] is a small state machine that consumes bytes as they arrive, in chunks of any
//! size, and yields a [`Frame`] only once its payload is complete. The [`Encoder`] serializes
//! frames, masking them when acting as a client. Both implement the `tokio_util::codec` traits,
//! so they can frame any `AsyncRead + AsyncWrite` through `tokio_util::codec::Framed`.
//!
//! [`FrameParser`] wraps a client [`Decoder`] with its own input buffer for callers that push
//! raw reads into it, such as the [`Connection`](crate::Connection) state machine.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    mask::apply_mask,
    FrameError, Result, WebSocketError,
};

/// Which side of the connection a codec speaks for.
///
/// Clients mask every frame they send and refuse masked frames. Servers do the opposite.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// Currently reading the extended length and mask of the frame.
    Header(Header),
    /// Currently reading the payload of the frame.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Additional length bytes of the frame, if applicable.
    extra: usize,
    /// Encoded length of the payload.
    length_code: u8,
    /// Size of the rest of the header in bytes.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding functionality for WebSocket frames.
///
/// This codec can be used with Tokio's framed streams to speak the frame layer over a raw
/// stream, from either side.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec for `role`, refusing incoming payloads over `max_payload_size` bytes.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_payload_size),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = WebSocketError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.decoder.decode_frame(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encoder.encode_frame(item, dst);
        Ok(())
    }
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` tracks the maximum allowed payload size and the part of the frame currently being
/// read. The state changes as each part of the frame (header and payload) is processed.
pub struct Decoder {
    state: Option<ReadState>,
    role: Role,
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for `role` with a maximum payload size in bytes.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            state: None,
            role,
            max_payload_size,
        }
    }

    /// Decodes the next frame from `src`, consuming the bytes it used.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` once a frame is complete, with its payload unmasked.
    /// - `Ok(None)` if more data is needed. Partial headers are kept across calls.
    /// - `Err(WebSocketError::Frame(_))` on a protocol violation.
    pub fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(FrameError::ReservedBitsNotZero.into());
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    match (self.role, masked) {
                        (Role::Client, true) => return Err(FrameError::UnexpectedMask.into()),
                        (Role::Server, false) => return Err(FrameError::MissingMask.into()),
                        _ => {}
                    }

                    if opcode.is_control() && (!fin || length_code as usize > MAX_CONTROL_PAYLOAD)
                    {
                        return Err(FrameError::InvalidControlFrame.into());
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        _ => {
                            let length = src.get_u64();
                            if length & (1 << 63) != 0 {
                                return Err(FrameError::InvalidLength.into());
                            }
                            usize::try_from(length).map_err(|_| FrameError::PayloadTooLarge)?
                        }
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if payload_len > self.max_payload_size {
                        return Err(FrameError::PayloadTooLarge.into());
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        // the whole payload is coming, make room for it once
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let mut payload = src.split_to(payload_len);
                    if let Some(key) = mask {
                        apply_mask(&mut payload, key);
                    }

                    break Ok(Some(Frame::new(
                        header.fin,
                        header.opcode,
                        mask,
                        payload.freeze(),
                    )));
                }
            }
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.decode_frame(src)
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// A client encoder masks every frame, with the frame's own key when it carries one and a
/// fresh random key otherwise. A server encoder writes frames exactly as given.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    /// Appends the wire representation of `frame` to `dst`.
    pub fn encode_frame(&mut self, mut frame: Frame, dst: &mut BytesMut) {
        if self.role == Role::Client && frame.mask.is_none() {
            frame.mask = Some(rand::random());
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(key) = frame.mask {
            apply_mask(&mut dst[start..], key);
        }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(frame, dst);
        Ok(())
    }
}

/// Encodes one client frame, masked with a fresh random key.
pub fn encode(opcode: OpCode, fin: bool, payload: &[u8]) -> BytesMut {
    let mut dst = BytesMut::new();
    Encoder::new(Role::Client).encode_frame(
        Frame::new(fin, opcode, None, bytes::Bytes::copy_from_slice(payload)),
        &mut dst,
    );
    dst
}

/// Buffers raw reads from a server and splits them into frames.
///
/// Once a frame fails to decode the parser is poisoned: the stream can no longer be trusted to
/// be aligned on frame boundaries, so nothing more is produced.
pub struct FrameParser {
    decoder: Decoder,
    buf: BytesMut,
    poisoned: bool,
}

impl FrameParser {
    /// Creates a parser that refuses payloads over `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            decoder: Decoder::new(Role::Client, max_payload_size),
            buf: BytesMut::new(),
            poisoned: false,
        }
    }

    /// Appends bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Returns the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.poisoned {
            return None;
        }

        match self.decoder.decode_frame(&mut self.buf) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(err) => {
                self.poisoned = true;
                self.buf.clear();
                Some(Err(err))
            }
        }
    }

    /// Pushes `bytes` and iterates over every frame that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.push(bytes);
        Frames { parser: self }
    }

    /// Number of buffered bytes that do not form a complete frame yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Iterator returned by [`FrameParser::feed`].
pub struct Frames<'a> {
    parser: &'a mut FrameParser,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_frame()
    }
}
