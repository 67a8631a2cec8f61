//! Wire protocol frames and events.

pub mod event;
pub mod frame;

pub use event::{DownstreamEvent, ResponsePayload, StreamFrame, StreamOperation, UpstreamEvent};
pub use frame::{FrameHeader, RpcFrame, RpcReference};
