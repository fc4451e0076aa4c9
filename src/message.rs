//! The message codec: pure framing functions shared by every transport.
//!
//! Messages travel as a self-delimiting concatenation of frames:
//!
//! ```text
//! [typeIndex: u8][length: u16 little-endian][payload: length bytes] …
//! ```
//!
//! `typeIndex` is positional in the [`MessageRegistry`](crate::registry::MessageRegistry);
//! `length` is `0` for payload-less messages. There is no delimiter between
//! frames — the length prefix makes the stream self-describing.
//!
//! Everything in this module is stateless and synchronous; the connection
//! manager layers queuing and MTU-aware chunking on top.

use crate::error::ProtocolError;
use crate::registry::MessageRegistry;

/// Bytes reserved out of every transport write for transport-level framing
/// overhead. A chunk may carry at most `mtu - MTU_RESERVED` message bytes.
pub const MTU_RESERVED: usize = 3;

/// An outgoing typed message. Ephemeral: created per send and consumed into
/// the connection manager's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMessage {
    /// Registry name, e.g. `"sensorData"`.
    pub name: String,
    /// Payload bytes; `None` encodes as a zero-length frame.
    pub payload: Option<Vec<u8>>,
}

impl TxMessage {
    /// A payload-less message (typically a "get" request).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: None,
        }
    }

    pub fn with_payload(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload: Some(payload),
        }
    }
}

/// A decoded inbound frame borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMessage<'a> {
    /// Wire type index.
    pub index: u8,
    /// Registry name for `index`.
    pub name: &'a str,
    /// Payload bytes (possibly empty).
    pub payload: &'a [u8],
}

/// Encode one message into its wire frame.
///
/// Fails with [`ProtocolError::UnknownMessageType`] when the name has no
/// registry entry, and with [`ProtocolError::MessageTooLarge`] when the
/// payload exceeds what the u16 length prefix can describe.
///
/// ```
/// # use solekit::message::{encode_message, TxMessage};
/// # use solekit::registry::MessageRegistry;
/// let registry = MessageRegistry::default();
/// let frame = encode_message(&registry, &TxMessage::with_payload("setName", b"sole".to_vec())).unwrap();
/// assert_eq!(frame, [2, 4, 0, b's', b'o', b'l', b'e']);
/// ```
pub fn encode_message(registry: &MessageRegistry, msg: &TxMessage) -> Result<Vec<u8>, ProtocolError> {
    let index = registry.index_of(&msg.name)?;
    let payload = msg.payload.as_deref().unwrap_or(&[]);
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::MessageTooLarge {
            len: payload.len(),
            max: u16::MAX as usize,
        });
    }
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(index);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Lazily decode a buffer holding any whole number of concatenated frames.
///
/// The returned iterator yields one `Result` per frame and fuses after the
/// first error; decoding never mutates the registry.
pub fn decode_messages<'a>(registry: &'a MessageRegistry, buf: &'a [u8]) -> MessageIter<'a> {
    MessageIter {
        registry,
        buf,
        pos: 0,
        failed: false,
    }
}

/// Iterator over the frames of a receive buffer. See [`decode_messages`].
pub struct MessageIter<'a> {
    registry: &'a MessageRegistry,
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<RxMessage<'a>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let remaining = self.buf.len() - self.pos;
        if remaining < 3 {
            self.failed = true;
            return Some(Err(ProtocolError::MalformedMessage {
                declared: 3,
                remaining,
            }));
        }
        let index = self.buf[self.pos];
        let len = u16::from_le_bytes([self.buf[self.pos + 1], self.buf[self.pos + 2]]) as usize;
        let start = self.pos + 3;
        if start + len > self.buf.len() {
            self.failed = true;
            return Some(Err(ProtocolError::MalformedMessage {
                declared: len,
                remaining: self.buf.len() - start,
            }));
        }
        let name = match self.registry.name(index) {
            Some(n) => n,
            None => {
                self.failed = true;
                return Some(Err(ProtocolError::UnknownMessageType(format!(
                    "index {index}"
                ))));
            }
        };
        self.pos = start + len;
        Some(Ok(RxMessage {
            index,
            name,
            payload: &self.buf[start..start + len],
        }))
    }
}

/// Partition an ordered list of encoded messages into consecutive groups of
/// at most `max_len` total bytes each, without splitting any message.
///
/// Order is preserved: concatenating the groups reproduces the input.
/// A single message longer than `max_len` is fatal — there is no mid-message
/// fragmentation on this protocol.
pub fn chunk_encoded(encoded: Vec<Vec<u8>>, max_len: usize) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for frame in encoded {
        if frame.len() > max_len {
            return Err(ProtocolError::MessageTooLarge {
                len: frame.len(),
                max: max_len,
            });
        }
        if !current.is_empty() && current.len() + frame.len() > max_len {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&frame);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}
