//! Serialized payloads and the per-message payload serializer.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::CodecError;
use crate::serialization::{BinaryFormat, SerializationFormat, TextFormat};

/// An encoded value together with the format that produced it.
///
/// Binary formats always carry bytes and text formats always carry text.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializedPayload {
    /// Output of a binary format.
    Binary {
        /// Encoded bytes.
        bytes: Bytes,
        /// Producing format.
        format: BinaryFormat,
    },
    /// Output of a text format.
    Text {
        /// Encoded text.
        text: String,
        /// Producing format.
        format: TextFormat,
    },
}

impl SerializedPayload {
    /// The format this payload declares.
    #[must_use]
    pub const fn format(&self) -> SerializationFormat {
        match self {
            Self::Binary { format, .. } => SerializationFormat::Binary(*format),
            Self::Text { format, .. } => SerializationFormat::Text(*format),
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Binary { bytes, .. } => bytes.len(),
            Self::Text { text, .. } => text.len(),
        }
    }

    /// Whether the encoded form is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary { bytes, .. } => bytes,
            Self::Text { text, .. } => text.as_bytes(),
        }
    }
}

impl fmt::Debug for SerializedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedPayload")
            .field("format", &self.format().name())
            .field("len", &self.len())
            .finish()
    }
}

/// Encodes outgoing values in a preferred format and decodes incoming
/// payloads in whatever format they declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSerializer {
    format: SerializationFormat,
}

impl PayloadSerializer {
    /// Create a serializer that encodes with `format`.
    #[must_use]
    pub const fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    /// The outgoing format.
    #[must_use]
    pub const fn format(&self) -> SerializationFormat {
        self.format
    }

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn serialize<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<SerializedPayload, CodecError> {
        self.format.encode(value)
    }

    /// Decode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed or its format has no codec.
    pub fn deserialize<T: DeserializeOwned>(
        &self,
        payload: &SerializedPayload,
    ) -> Result<T, CodecError> {
        SerializationFormat::decode(payload)
    }
}

impl Default for PayloadSerializer {
    fn default() -> Self {
        Self::new(SerializationFormat::CBOR)
    }
}
