//! Audio primitives: the shared frame ring buffer and fallback synthesis.

pub mod fallback;
pub mod ring_buffer;

pub use fallback::{silence_frame, FallbackProvider};
pub use ring_buffer::{BufferError, FrameRingBuffer, FrameRingBufferStats};
