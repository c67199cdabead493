//! Framed codec for compiler communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplexes, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::bridge::protocol::InboundMessage;

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .new_codec()
}

/// Codec that frames messages with a length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization. Decoding is
/// strict: a frame that does not parse as `T` is an error. The host's receive
/// path uses [`InboundCodec`] instead.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Decoder for the host's receive path.
///
/// A complete frame that fails structural validation decodes to a
/// `ProtocolError` event instead of an io error, so the dispatcher fails the
/// session through the same routing path as a compiler-reported one.
pub struct InboundCodec {
    inner: LengthDelimitedCodec,
}

impl Default for InboundCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundCodec {
    pub fn new() -> Self {
        Self {
            inner: length_delimited(),
        }
    }
}

impl Decoder for InboundCodec {
    type Item = InboundMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(message) => Ok(Some(message)),
                Err(e) => Ok(Some(InboundMessage::ProtocolError {
                    id: None,
                    message: format!("unparseable message: {}", e),
                })),
            },
            None => Ok(None),
        }
    }
}
