pub mod device;
pub mod frame;
pub mod pool;
pub mod stage;

pub use device::VideoDevice;
pub use frame::Frame;
pub use frame::PixelFormat;
pub use stage::{CaptureStage, FrameSource};
