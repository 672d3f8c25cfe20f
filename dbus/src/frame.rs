//! Frame buffer for accumulating partial reads.
//!
//! Bytes arrive from the socket in arbitrary chunks. The buffer keeps them in
//! a single `BytesMut` and hands out one complete message at a time, leaving
//! any partial frame untouched until more bytes arrive.

use bytes::BytesMut;
use tracing::trace;

use crate::wire::{self, Message, ParseResult, MAX_MESSAGE_SIZE};
use crate::{Error, Result};

pub struct FrameBuffer {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// A buffer accepting frames up to the protocol maximum of 128 MiB.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_size: max_frame_size.min(MAX_MESSAGE_SIZE),
        }
    }

    /// Append newly read bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OversizedFrame`] if the frame at the front of the
    /// buffer declares a length above the configured maximum.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        self.check_front()
    }

    fn check_front(&self) -> Result<()> {
        match wire::message_length(&self.buffer) {
            Some(Ok(size)) if size > self.max_frame_size => Err(Error::OversizedFrame {
                size,
                max: self.max_frame_size,
            }),
            _ => Ok(()),
        }
    }

    /// Try to decode exactly one message from the front of the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(message))` and drops exactly the bytes the message occupied
    /// - `Ok(None)` if more data is needed; the buffer is left unchanged
    /// - `Err(...)` if the front of the buffer is not a valid message
    pub fn try_pop(&mut self) -> Result<Option<Message>> {
        self.check_front()?;
        match wire::unmarshal(&self.buffer) {
            ParseResult::Complete { message, consumed } => {
                let _ = self.buffer.split_to(consumed);
                trace!(
                    "Frame of {} bytes, {} bytes left in buffer",
                    consumed,
                    self.buffer.len()
                );
                Ok(Some(message))
            }
            ParseResult::Incomplete { .. } => Ok(None),
            ParseResult::Invalid { error } => Err(Error::Protocol(error)),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{marshal, Value};

    fn frame(serial: u32, text: &str) -> Vec<u8> {
        let mut msg = Message::method_call("a.b", "/a", "a.b", "Echo").with_body(vec![text.into()]);
        msg.serial = serial;
        marshal(&msg).unwrap()
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let bytes = frame(1, "hello");
        let mut all_at_once = FrameBuffer::new();
        all_at_once.append(&bytes).unwrap();
        let expected = all_at_once.try_pop().unwrap().unwrap();
        assert!(all_at_once.is_empty());

        let mut buffer = FrameBuffer::new();
        for (i, b) in bytes.iter().enumerate() {
            assert!(buffer.try_pop().unwrap().is_none());
            buffer.append(&[*b]).unwrap();
            assert_eq!(buffer.len(), i + 1);
        }
        assert_eq!(buffer.try_pop().unwrap(), Some(expected));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_untouched() {
        let first = frame(1, "a");
        let second = frame(2, "bb");
        let mut data = first.clone();
        data.extend_from_slice(&second[..5]);

        let mut buffer = FrameBuffer::new();
        buffer.append(&data).unwrap();
        assert_eq!(buffer.try_pop().unwrap().unwrap().serial, 1);
        assert_eq!(buffer.len(), 5);
        assert!(buffer.try_pop().unwrap().is_none());
        assert_eq!(buffer.len(), 5);

        buffer.append(&second[5..]).unwrap();
        let msg = buffer.try_pop().unwrap().unwrap();
        assert_eq!(msg.serial, 2);
        assert_eq!(msg.body, vec![Value::from("bb")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drains_concatenated_frames() {
        let mut data = Vec::new();
        for serial in 1..=3 {
            data.extend(frame(serial, "x"));
        }
        let mut buffer = FrameBuffer::new();
        buffer.append(&data).unwrap();
        let mut serials = Vec::new();
        while let Some(msg) = buffer.try_pop().unwrap() {
            serials.push(msg.serial);
        }
        assert_eq!(serials, vec![1, 2, 3]);
    }

    #[test]
    fn test_oversized() {
        let bytes = frame(1, &"x".repeat(100));
        let mut buffer = FrameBuffer::with_max_frame_size(64);
        match buffer.append(&bytes[..16]) {
            Err(Error::OversizedFrame { size, max: 64 }) => assert_eq!(size, bytes.len()),
            other => panic!("Expected OversizedFrame, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage() {
        let mut buffer = FrameBuffer::new();
        buffer.append(b"GARBAGE GARBAGE GARBAGE").unwrap();
        assert!(matches!(buffer.try_pop(), Err(Error::Protocol(_))));
    }
}
