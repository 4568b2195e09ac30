//! tonic codec for dynamically typed protobuf messages.

use prost::Message as _;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

use protokit::MethodHandle;

/// Encodes responses and decodes requests of one method.
#[derive(Debug, Clone)]
pub struct WireCodec {
    request: MessageDescriptor,
}

impl WireCodec {
    #[must_use]
    pub fn new(request: MessageDescriptor) -> Self {
        Self { request }
    }

    /// Codec for a bound method.
    ///
    /// # Errors
    /// Returns `Status::internal` when the request type is not bound.
    pub fn for_method(handle: &MethodHandle) -> Result<Self, Status> {
        handle
            .request_descriptor()
            .map(Self::new)
            .map_err(|e| Status::internal(e.to_string()))
    }
}

impl Codec for WireCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = WireEncoder;
    type Decoder = WireDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        WireEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        WireDecoder(self.request.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WireEncoder;

impl Encoder for WireEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("encode {}: {e}", item.descriptor().full_name())))
    }
}

#[derive(Debug, Clone)]
pub struct WireDecoder(MessageDescriptor);

impl Decoder for WireDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.0.clone(), src)
            .map(Some)
            .map_err(|e| Status::invalid_argument(format!("decode {}: {e}", self.0.full_name())))
    }
}
