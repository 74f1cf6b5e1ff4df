//! # Assembler
//!
//! Reassembles data frames into complete [`Message`]s.
//!
//! A message is either a single final `Text`/`Binary` frame, or a non-final `Text`/`Binary`
//! frame followed by any number of `Continuation` frames, the last of which is final. Control
//! frames may interleave with the fragments but are handled by the connection and never reach
//! the [`Assembler`].
use bytes::{Bytes, BytesMut};

use crate::{
    frame::{Frame, OpCode},
    FrameError, MessageError, Result,
};

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message. Always valid UTF-8.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl Message {
    /// The opcode that starts this message on the wire.
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Returns the text of a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(data))
    }
}

/// Accumulates fragments until a message is complete.
pub struct Assembler {
    /// Opcode of the fragmented message in progress.
    fragment: Option<OpCode>,
    accumulated: BytesMut,
    max_message_size: usize,
}

impl Assembler {
    /// Creates an assembler that refuses messages over `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::new(),
            max_message_size,
        }
    }

    /// Returns `true` while a fragmented message is in progress.
    pub fn in_progress(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feeds a data frame.
    ///
    /// Returns the message once `frame` completes it, `Ok(None)` while fragments are still
    /// expected.
    ///
    /// # Errors
    /// - [`FrameError::UnexpectedOpcode`] for a new `Text`/`Binary` frame in the middle of a
    ///   fragmented message, or a control frame.
    /// - [`FrameError::UnexpectedContinuation`] for a continuation with nothing in progress.
    /// - [`FrameError::PayloadTooLarge`] once the message outgrows the limit.
    /// - [`MessageError::InvalidUtf8`] for a completed text message that is not UTF-8.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(FrameError::UnexpectedOpcode.into());
                }
                if frame.payload.len() > self.max_message_size {
                    return Err(FrameError::PayloadTooLarge.into());
                }

                if frame.fin {
                    return message(frame.opcode, frame.payload).map(Some);
                }

                self.fragment = Some(frame.opcode);
                self.accumulated.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                let opcode = self.fragment.ok_or(FrameError::UnexpectedContinuation)?;

                if self.accumulated.len() + frame.payload.len() > self.max_message_size {
                    return Err(FrameError::PayloadTooLarge.into());
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                self.fragment = None;
                let payload = self.accumulated.split().freeze();
                message(opcode, payload).map(Some)
            }
            _ => Err(FrameError::UnexpectedOpcode.into()),
        }
    }

    /// Drops any partial message.
    pub fn reset(&mut self) {
        self.fragment = None;
        self.accumulated = BytesMut::new();
    }
}

fn message(opcode: OpCode, payload: Bytes) -> Result<Message> {
    if opcode == OpCode::Text {
        let text = String::from_utf8(payload.into()).map_err(|_| MessageError::InvalidUtf8)?;
        Ok(Message::Text(text))
    } else {
        Ok(Message::Binary(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WebSocketError;

    fn fragments(opcode: OpCode, parts: &[&[u8]]) -> Vec<Frame> {
        let last = parts.len() - 1;
        parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                let op = if i == 0 { opcode } else { OpCode::Continuation };
                Frame::new(i == last, op, None, Bytes::copy_from_slice(part))
            })
            .collect()
    }

    fn assemble(assembler: &mut Assembler, frames: Vec<Frame>) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for frame in frames {
            if let Some(message) = assembler.push(frame)? {
                out.push(message);
            }
        }
        Ok(out)
    }

    #[test]
    fn test_reassembly_with_0_1_5_continuations() {
        let cases: Vec<Vec<&[u8]>> = vec![
            vec![&b"whole"[..]],
            vec![&b"hel"[..], &b"lo"[..]],
            ["a", "b", "c", "d", "e", "f"].iter().map(|s| s.as_bytes()).collect(),
        ];

        for parts in &cases {
            let mut assembler = Assembler::new(1024);
            let expected: String = parts
                .iter()
                .map(|p| std::str::from_utf8(p).unwrap())
                .collect();

            let messages = assemble(&mut assembler, fragments(OpCode::Text, parts)).unwrap();
            assert_eq!(messages, vec![Message::Text(expected)]);
            assert!(!assembler.in_progress());
        }
    }

    #[test]
    fn test_binary_reassembly() {
        let mut assembler = Assembler::new(1024);
        let messages =
            assemble(&mut assembler, fragments(OpCode::Binary, &[&[1u8, 2][..], &[3u8][..], &[4u8, 5][..]])).unwrap();
        assert_eq!(messages, vec![Message::Binary(Bytes::from_static(&[1, 2, 3, 4, 5]))]);
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let text = "héllo wörld";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        let mut assembler = Assembler::new(1024);
        let messages =
            assemble(&mut assembler, fragments(OpCode::Text, &[&bytes[..2], &bytes[2..]])).unwrap();
        assert_eq!(messages, vec![Message::from(text)]);
    }

    #[test]
    fn test_interleaved_data_frame_rejected() {
        let mut assembler = Assembler::new(1024);
        assert_eq!(assembler.push(Frame::text("par").with_fin(false)).unwrap(), None);
        assert!(matches!(
            assembler.push(Frame::binary("new")),
            Err(WebSocketError::Frame(FrameError::UnexpectedOpcode))
        ));
    }

    #[test]
    fn test_orphan_continuation_rejected() {
        let mut assembler = Assembler::new(1024);
        assert!(matches!(
            assembler.push(Frame::continuation("tail")),
            Err(WebSocketError::Frame(FrameError::UnexpectedContinuation))
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut assembler = Assembler::new(1024);
        assert!(matches!(
            assembler.push(Frame::text(&[0xC3, 0x28][..])),
            Err(WebSocketError::Message(MessageError::InvalidUtf8))
        ));

        let frames = fragments(OpCode::Text, &[&b"ok"[..], &[0xFFu8][..]]);
        assert!(matches!(
            assemble(&mut assembler, frames),
            Err(WebSocketError::Message(MessageError::InvalidUtf8))
        ));
    }

    #[test]
    fn test_message_size_limit() {
        let mut assembler = Assembler::new(4);
        assert!(assembler.push(Frame::binary(vec![0u8; 4])).unwrap().is_some());
        assert!(matches!(
            assembler.push(Frame::binary(vec![0u8; 5])),
            Err(WebSocketError::Frame(FrameError::PayloadTooLarge))
        ));

        assembler.reset();
        assert_eq!(assembler.push(Frame::binary(vec![0u8; 3]).with_fin(false)).unwrap(), None);
        assert!(matches!(
            assembler.push(Frame::continuation(vec![0u8; 2])),
            Err(WebSocketError::Frame(FrameError::PayloadTooLarge))
        ));
    }

    #[test]
    fn test_message_helpers() {
        let text = Message::from("hi");
        assert!(text.is_text());
        assert_eq!(text.as_text(), Some("hi"));
        assert_eq!(text.opcode(), OpCode::Text);

        let binary = Message::from(vec![1u8, 2]);
        assert_eq!(binary.len(), 2);
        assert_eq!(binary.as_text(), None);
        assert_eq!(binary.into_bytes(), Bytes::from_static(&[1, 2]));
    }
}
