//! Fixed-width message codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{display_key, Op};
use crate::config::WireFormat;
use crate::error::{Error, Result};

/// A decoded protocol message.
///
/// `key` and `value` hold the significant bytes only (padding stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub op: Op,
    pub seq: u32,
    pub key: Bytes,
    pub value: Bytes,
}

impl ProtocolMessage {
    pub fn new(op: Op, seq: u32, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            op,
            seq,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Message with an empty value
    pub fn without_value(op: Op, seq: u32, key: impl Into<Bytes>) -> Self {
        Self::new(op, seq, key, Bytes::new())
    }

    /// Printable key for logging
    pub fn key_str(&self) -> String {
        display_key(&self.key)
    }
}

/// Encoder/decoder bound to one deployment's field widths.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolCodec {
    wire: WireFormat,
}

impl ProtocolCodec {
    pub fn new(wire: WireFormat) -> Self {
        Self { wire }
    }

    pub fn wire(&self) -> &WireFormat {
        &self.wire
    }

    /// Encode a message into its fully padded wire form.
    pub fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes> {
        if msg.key.len() > self.wire.key_width {
            return Err(Error::Format(format!(
                "key of {} bytes exceeds key width {}",
                msg.key.len(),
                self.wire.key_width
            )));
        }
        if msg.value.len() > self.wire.value_width {
            return Err(Error::Format(format!(
                "value of {} bytes exceeds value width {}",
                msg.value.len(),
                self.wire.value_width
            )));
        }

        let mut buf = BytesMut::with_capacity(self.wire.message_len());
        buf.put_u8(msg.op.code());
        buf.put_u32(msg.seq);
        put_padded(&mut buf, &msg.key, self.wire.key_width);
        put_padded(&mut buf, &msg.value, self.wire.value_width);
        Ok(buf.freeze())
    }

    /// Shorthand for `encode(&ProtocolMessage::new(..))`.
    pub fn encode_parts(&self, op: Op, seq: u32, key: &[u8], value: &[u8]) -> Result<Bytes> {
        self.encode(&ProtocolMessage::new(
            op,
            seq,
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        ))
    }

    /// Decode a message received from the wire.
    ///
    /// Bytes past the configured value width are ignored.
    pub fn decode(&self, data: &[u8]) -> Result<ProtocolMessage> {
        let minimum = self.wire.header_len() + self.wire.min_value_width();
        if data.len() < minimum {
            return Err(Error::Format(format!(
                "message of {} bytes is shorter than the minimum {}",
                data.len(),
                minimum
            )));
        }

        let mut cursor = data;
        let op = Op::from(cursor.get_u8());
        let seq = cursor.get_u32();
        let key = strip_padding(&cursor[..self.wire.key_width]);
        cursor.advance(self.wire.key_width);
        let value_len = cursor.len().min(self.wire.value_width);
        let value = strip_padding(&cursor[..value_len]);

        Ok(ProtocolMessage {
            op,
            seq,
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        })
    }
}

fn put_padded(buf: &mut BytesMut, field: &[u8], width: usize) {
    buf.put_bytes(0, width - field.len());
    buf.put_slice(field);
}

fn strip_padding(field: &[u8]) -> &[u8] {
    let start = field.iter().position(|&b| b != 0).unwrap_or(field.len());
    &field[start..]
}

// =============================================================================
// Tests
// =============================================================================
