//! A pass-through codec for gRPC messages.
//!
//! tonic normally decodes each length-prefixed message into a concrete type
//! (a prost message, say). The proxy never looks inside a message, so both of
//! its legs use [`OpaqueCodec`], which hands the message bytes through
//! unchanged. Any message type of any service can be relayed without schema
//! knowledge.

use bytes::{Buf, BufMut, Bytes};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// One gRPC message, kept as the raw bytes that travelled on the wire.
///
/// The bytes exclude the 5-byte gRPC message prefix; tonic adds and strips
/// that prefix around the codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Frame {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl From<Frame> for Bytes {
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Codec that treats every message as an opaque [`Frame`].
///
/// Install it on the server leg with `tonic::server::Grpc::new(OpaqueCodec)`
/// and on the client leg by passing it to `tonic::client::Grpc::streaming`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueCodec;

impl Codec for OpaqueCodec {
    type Encode = Frame;
    type Decode = Frame;
    type Encoder = OpaqueEncoder;
    type Decoder = OpaqueDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        OpaqueEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        OpaqueDecoder
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueEncoder;

impl Encoder for OpaqueEncoder {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item.into_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueDecoder;

impl Decoder for OpaqueDecoder {
    type Item = Frame;
    type Error = Status;

    // tonic hands the decoder exactly one message worth of bytes.
    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = src.copy_to_bytes(src.remaining());
        Ok(Some(Frame(bytes)))
    }
}
