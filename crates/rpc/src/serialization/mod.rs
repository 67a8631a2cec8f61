//! Payload and frame serialization.

pub mod format;
pub mod frame_codec;
pub mod payload;

pub use format::{BinaryFormat, SerializationFormat, TextFormat};
pub use frame_codec::{FrameCodec, MAX_FRAME_SIZE};
pub use payload::{PayloadSerializer, SerializedPayload};
