//! Serialization format registry.
//!
//! Each format has a stable wire identifier: binary formats are negative,
//! text formats positive. CBOR and JSON ship codecs; the others are known
//! identifiers without one.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::CodecError;
use crate::serialization::SerializedPayload;

/// Formats whose encoded form is raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum BinaryFormat {
    /// Protocol Buffers.
    Protobuf,
    /// CBOR.
    Cbor,
}

/// Formats whose encoded form is UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum TextFormat {
    /// JSON.
    Json,
    /// Java-style properties.
    Properties,
    /// HOCON.
    Hocon,
}

/// Any supported serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum SerializationFormat {
    /// A byte-oriented format.
    Binary(BinaryFormat),
    /// A text-oriented format.
    Text(TextFormat),
}

impl BinaryFormat {
    /// Stable wire identifier.
    #[must_use]
    pub const fn identifier(self) -> i8 {
        match self {
            Self::Protobuf => -1,
            Self::Cbor => -2,
        }
    }
}

impl TextFormat {
    /// Stable wire identifier.
    #[must_use]
    pub const fn identifier(self) -> i8 {
        match self {
            Self::Json => 1,
            Self::Properties => 2,
            Self::Hocon => 3,
        }
    }
}

impl From<BinaryFormat> for i8 {
    fn from(format: BinaryFormat) -> Self {
        format.identifier()
    }
}

impl TryFrom<i8> for BinaryFormat {
    type Error = CodecError;

    fn try_from(value: i8) -> Result<Self, CodecError> {
        match value {
            -1 => Ok(Self::Protobuf),
            -2 => Ok(Self::Cbor),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }
}

impl From<TextFormat> for i8 {
    fn from(format: TextFormat) -> Self {
        format.identifier()
    }
}

impl TryFrom<i8> for TextFormat {
    type Error = CodecError;

    fn try_from(value: i8) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Json),
            2 => Ok(Self::Properties),
            3 => Ok(Self::Hocon),
            other => Err(CodecError::UnknownFormat(other)),
        }
    }
}

impl From<SerializationFormat> for i8 {
    fn from(format: SerializationFormat) -> Self {
        format.identifier()
    }
}

impl TryFrom<i8> for SerializationFormat {
    type Error = CodecError;

    fn try_from(value: i8) -> Result<Self, CodecError> {
        if value < 0 {
            BinaryFormat::try_from(value).map(Self::Binary)
        } else {
            TextFormat::try_from(value).map(Self::Text)
        }
    }
}

impl From<BinaryFormat> for SerializationFormat {
    fn from(format: BinaryFormat) -> Self {
        Self::Binary(format)
    }
}

impl From<TextFormat> for SerializationFormat {
    fn from(format: TextFormat) -> Self {
        Self::Text(format)
    }
}

impl SerializationFormat {
    /// CBOR, the default frame and payload format.
    pub const CBOR: Self = Self::Binary(BinaryFormat::Cbor);
    /// JSON.
    pub const JSON: Self = Self::Text(TextFormat::Json);
    /// Protocol Buffers.
    pub const PROTOBUF: Self = Self::Binary(BinaryFormat::Protobuf);
    /// Java-style properties.
    pub const PROPERTIES: Self = Self::Text(TextFormat::Properties);
    /// HOCON.
    pub const HOCON: Self = Self::Text(TextFormat::Hocon);

    /// Every known format.
    pub const ALL: [Self; 5] = [
        Self::PROTOBUF,
        Self::CBOR,
        Self::JSON,
        Self::PROPERTIES,
        Self::HOCON,
    ];

    /// Stable wire identifier.
    #[must_use]
    pub const fn identifier(self) -> i8 {
        match self {
            Self::Binary(format) => format.identifier(),
            Self::Text(format) => format.identifier(),
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Binary(BinaryFormat::Protobuf) => "protobuf",
            Self::Binary(BinaryFormat::Cbor) => "cbor",
            Self::Text(TextFormat::Json) => "json",
            Self::Text(TextFormat::Properties) => "properties",
            Self::Text(TextFormat::Hocon) => "hocon",
        }
    }

    /// Whether a built-in codec exists for this format.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        matches!(
            self,
            Self::Binary(BinaryFormat::Cbor) | Self::Text(TextFormat::Json)
        )
    }

    /// Encode a value into a payload tagged with this format.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized or the format has
    /// no built-in codec.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<SerializedPayload, CodecError> {
        match self {
            Self::Binary(BinaryFormat::Cbor) => {
                let mut buffer = Vec::new();
                ciborium::ser::into_writer(value, &mut buffer)
                    .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
                Ok(SerializedPayload::Binary {
                    bytes: Bytes::from(buffer),
                    format: BinaryFormat::Cbor,
                })
            }
            Self::Text(TextFormat::Json) => {
                let text = serde_json::to_string(value)
                    .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
                Ok(SerializedPayload::Text {
                    text,
                    format: TextFormat::Json,
                })
            }
            unsupported => Err(CodecError::UnsupportedFormat(unsupported)),
        }
    }

    /// Decode a payload using the format it declares.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed for its format or the
    /// format has no built-in codec.
    pub fn decode<T: DeserializeOwned>(payload: &SerializedPayload) -> Result<T, CodecError> {
        match payload {
            SerializedPayload::Binary {
                bytes,
                format: BinaryFormat::Cbor,
            } => ciborium::de::from_reader(bytes.as_ref())
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            SerializedPayload::Text {
                text,
                format: TextFormat::Json,
            } => serde_json::from_str(text)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            other => Err(CodecError::UnsupportedFormat(other.format())),
        }
    }
}

impl Default for SerializationFormat {
    fn default() -> Self {
        Self::CBOR
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.identifier())
    }
}
