pub mod bridge;
pub mod frame;

pub use bridge::CallbackBridge;
pub use frame::{Frame, FrameView, PixelFormat};
