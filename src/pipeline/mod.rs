pub mod buffer;
pub mod publisher;

pub use buffer::FrameBuffer;
pub use publisher::{Publisher, PublisherState, PublisherStatus};
