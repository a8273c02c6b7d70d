//! Payload seam: user-defined message bodies and their wire codecs.

use std::any::Any;
use std::fmt;

use crate::error::{DropPacket, PolicyMismatch};
use crate::wire::Reader;

/// A decoded message body.  Concrete payload types are defined by the
/// overlay; handlers downcast through [`Payload::as_any`].
pub trait Payload: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Wire codec for one payload type, owned by the meta message.
pub trait PayloadCodec: Send + Sync {
    /// Append the payload bytes to `buf`.  Fails with [`PolicyMismatch`]
    /// when handed a payload of the wrong type.
    fn encode(&self, payload: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch>;

    /// Decode a payload from the packet's payload region.  The region must
    /// be consumed exactly; the caller rejects trailing bytes.
    fn decode(&self, reader: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket>;
}

/// Downcast helper for handlers.
pub fn payload_as<T: Payload>(payload: &dyn Payload) -> Option<&T> {
    payload.as_any().downcast_ref::<T>()
}

/// Codec assembled from two plain functions, for payload types that do not
/// warrant a struct of their own.
pub struct FnCodec {
    pub encode: fn(&dyn Payload, &mut Vec<u8>) -> Result<(), PolicyMismatch>,
    pub decode: fn(&mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket>,
}

impl PayloadCodec for FnCodec {
    fn encode(&self, payload: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
        (self.encode)(payload, buf)
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
        (self.decode)(reader)
    }
}

/// Reference payload carrying a short text, with a one-byte length prefix on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPayload {
    pub text: String,
}

impl TextPayload {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Payload for TextPayload {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Codec for [`TextPayload`].
pub struct TextPayloadCodec;

impl PayloadCodec for TextPayloadCodec {
    fn encode(&self, payload: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
        let payload = payload_as::<TextPayload>(payload)
            .ok_or_else(|| PolicyMismatch::new("expected text payload"))?;
        let bytes = payload.text.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(PolicyMismatch::new("text payload too long"));
        }
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
        Ok(())
    }

    fn decode(&self, reader: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
        let len = reader.take_u8()? as usize;
        let bytes = reader.take(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DropPacket::new("text payload is not valid utf-8"))?;
        Ok(Box::new(TextPayload::new(text)))
    }
}

/// The empty payload, used by metas whose meaning is carried entirely by the
/// authentication binding (for example identity announcements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyPayload;

impl Payload for EmptyPayload {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Codec for [`EmptyPayload`].
pub struct EmptyPayloadCodec;

impl PayloadCodec for EmptyPayloadCodec {
    fn encode(&self, payload: &dyn Payload, _buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
        payload_as::<EmptyPayload>(payload)
            .map(|_| ())
            .ok_or_else(|| PolicyMismatch::new("expected empty payload"))
    }

    fn decode(&self, _reader: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
        Ok(Box::new(EmptyPayload))
    }
}
