//! Whole-frame encoding for the connection.
//!
//! A connection carries discrete messages, so each [`RpcFrame`] maps to one
//! message; no length prefix is needed.

use bytes::Bytes;

use crate::error::CodecError;
use crate::protocol::RpcFrame;
use crate::serialization::{SerializationFormat, SerializedPayload};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Encodes and decodes frames in the format fixed at handshake.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    format: SerializationFormat,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec for `format`.
    ///
    /// # Errors
    ///
    /// Returns an error if the format has no built-in codec.
    pub const fn new(format: SerializationFormat) -> Result<Self, CodecError> {
        Self::with_max_frame_size(format, MAX_FRAME_SIZE)
    }

    /// Create a codec with an explicit frame size limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the format has no built-in codec.
    pub const fn with_max_frame_size(
        format: SerializationFormat,
        max_frame_size: usize,
    ) -> Result<Self, CodecError> {
        if !format.is_supported() {
            return Err(CodecError::UnsupportedFormat(format));
        }
        Ok(Self {
            format,
            max_frame_size,
        })
    }

    /// The frame format.
    #[must_use]
    pub const fn format(&self) -> SerializationFormat {
        self.format
    }

    /// Encode a frame into one connection message.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be serialized or is too large.
    pub fn encode(&self, frame: &RpcFrame) -> Result<Bytes, CodecError> {
        let bytes = match self.format.encode(frame)? {
            SerializedPayload::Binary { bytes, .. } => bytes,
            SerializedPayload::Text { text, .. } => Bytes::from(text),
        };

        if bytes.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }

        Ok(bytes)
    }

    /// Decode one connection message into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is too large or malformed.
    pub fn decode(&self, message: &[u8]) -> Result<RpcFrame, CodecError> {
        if message.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: message.len(),
                max: self.max_frame_size,
            });
        }

        match self.format {
            SerializationFormat::Binary(_) => ciborium::de::from_reader(message)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            SerializationFormat::Text(_) => serde_json::from_slice(message)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        FrameHeader, RpcReference, StreamFrame, StreamOperation, UpstreamEvent,
    };

    fn frame() -> RpcFrame {
        RpcFrame::Upstream(FrameHeader::new(
            RpcReference::new(7),
            UpstreamEvent::Data(StreamFrame::Element(
                SerializationFormat::CBOR.encode(&"payload").unwrap(),
            )),
        ))
    }

    #[test]
    fn test_frame_roundtrip_in_both_formats() {
        for format in [SerializationFormat::CBOR, SerializationFormat::JSON] {
            let codec = FrameCodec::new(format).unwrap();
            let encoded = codec.encode(&frame()).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), frame());
        }
    }

    #[test]
    fn test_unsupported_frame_format() {
        assert!(matches!(
            FrameCodec::new(SerializationFormat::PROTOBUF),
            Err(CodecError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::with_max_frame_size(SerializationFormat::CBOR, 8).unwrap();
        assert!(matches!(
            codec.encode(&frame()),
            Err(CodecError::FrameTooLarge { max: 8, .. })
        ));

        let small = RpcFrame::Upstream(FrameHeader::new(
            RpcReference::new(1),
            UpstreamEvent::StreamOperation(StreamOperation::Start),
        ));
        let codec = FrameCodec::new(SerializationFormat::CBOR).unwrap();
        assert!(codec.encode(&small).is_ok());
    }

    #[test]
    fn test_decode_garbage() {
        let codec = FrameCodec::new(SerializationFormat::JSON).unwrap();
        assert!(matches!(
            codec.decode(b"{not json"),
            Err(CodecError::DeserializationFailed(_))
        ));
    }
}
