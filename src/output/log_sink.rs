use super::{OutputSink, Overlay};
use anyhow::Result;
use image::RgbImage;

/// Headless sink: logs box lists instead of rendering them.
pub struct LogOutput {
    width: u32,
    height: u32,
    last: Vec<[u32; 5]>,
}

impl LogOutput {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            last: Vec::new(),
        }
    }
}

impl OutputSink for LogOutput {
    fn write_frame(&mut self, _frame: &RgbImage, overlay: &Overlay) -> Result<()> {
        let boxes: Vec<[u32; 5]> = overlay.boxes.iter().map(|&b| b.into()).collect();
        // Only report when the set of boxes changes.
        if boxes != self.last {
            tracing::info!(
                "Flaws ({}x{}): {}",
                overlay.width,
                overlay.height,
                serde_json::to_string(&boxes)?
            );
            self.last = boxes;
        }
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
