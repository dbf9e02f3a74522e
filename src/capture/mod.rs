pub mod convert;
pub mod decoder;
pub mod frame;

pub use decoder::{DecodeError, FrameDecoder};
pub use frame::Frame;
pub use frame::PixelFormat;
