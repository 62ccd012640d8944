//! Archive Protocol
//!
//! Message types exchanged between archive processes and their wire framing.

mod message;
mod frame;

pub use message::*;
pub use frame::{read_frame, write_frame, FrameHeader, WireFrame, MAX_FRAME_SIZE};
