mod log_sink;
mod loopback;
mod overlay;

pub use log_sink::LogOutput;
pub use loopback::V4L2Output;
pub use overlay::{draw_overlay, Overlay, BOX_STROKE_WIDTH};

use anyhow::Result;
use image::RgbImage;

/// Consumer of processed frames and the flaw boxes found in them
pub trait OutputSink {
    /// Present a frame together with its overlay
    fn write_frame(&mut self, frame: &RgbImage, overlay: &Overlay) -> Result<()>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}

impl<T: OutputSink + ?Sized> OutputSink for Box<T> {
    fn write_frame(&mut self, frame: &RgbImage, overlay: &Overlay) -> Result<()> {
        (**self).write_frame(frame, overlay)
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }
}
