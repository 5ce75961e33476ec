//! facetrack-hw: V4L2 frame source.
//!
//! Opens a camera at a requested resolution and streams frames converted
//! to packed RGB, ready for face analysis.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::Frame;
