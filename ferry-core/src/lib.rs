//! Ferry protocol core: message model and length-prefixed framing.
//! No I/O; transports read and write frames produced here.

pub mod protocol;
pub mod wire;

pub use protocol::{FileRequest, FileResponse, Message, MessageType, Payload, RequestId};
pub use wire::{
    decode_body, decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN,
};
