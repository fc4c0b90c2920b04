pub mod decoder;
pub mod frame;

pub use frame::{
    AspectPolicy, CaptureTick, FormatDescriptor, FrameBuffer, FrameKey, FrameView, Orientation,
    PixelFormat,
};
