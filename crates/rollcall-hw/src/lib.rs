//! rollcall-hw: Frame sources for the rollcall engine.
//!
//! Provides V4L2-based camera capture and a directory replay source, both
//! implementing [`rollcall_core::FrameSource`].

pub mod camera;
pub mod frame;
pub mod replay;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use replay::{ReplayError, ReplaySource};
