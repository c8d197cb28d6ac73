use super::{draw_overlay, OutputSink, Overlay};
use anyhow::{Context, Result};
use image::RgbImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, FourCC};

pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let (width, height) = match negotiate_format(path, width, height) {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!("Could not set YUYV output format, writing as requested: {e:#}");
                (width, height)
            }
        };

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened at {}x{}", width, height);

        Ok(Self {
            file,
            width,
            height,
        })
    }

    /// Convert RGB frame to YUV422 (YUYV) format
    fn rgb_to_yuyv(rgb_image: &RgbImage) -> Vec<u8> {
        let (width, height) = rgb_image.dimensions();
        let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

        for y in 0..height {
            for x in (0..width).step_by(2) {
                let pixel1 = rgb_image.get_pixel(x, y);
                let pixel2 = if x + 1 < width {
                    rgb_image.get_pixel(x + 1, y)
                } else {
                    pixel1
                };

                let (y1, u1, v1) = rgb_to_yuv(pixel1[0], pixel1[1], pixel1[2]);
                let (y2, u2, v2) = rgb_to_yuv(pixel2[0], pixel2[1], pixel2[2]);

                // Chroma is shared by the pixel pair
                let u = ((u1 as u16 + u2 as u16) / 2) as u8;
                let v = ((v1 as u16 + v2 as u16) / 2) as u8;

                // Y0 U Y1 V
                yuyv.extend_from_slice(&[y1, u, y2, v]);
            }
        }

        yuyv
    }
}

/// Ask the driver for YUYV at the requested size; returns what it granted.
fn negotiate_format(path: &Path, width: u32, height: u32) -> Result<(u32, u32)> {
    let device = Device::with_path(path)
        .with_context(|| format!("Failed to open {} for format negotiation", path.display()))?;

    let mut format = Output::format(&device).context("Failed to query output format")?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");

    let granted = Output::set_format(&device, &format).context("Failed to set output format")?;
    if granted.fourcc != FourCC::new(b"YUYV") {
        anyhow::bail!("driver chose {} instead of YUYV", granted.fourcc);
    }
    if (granted.width, granted.height) != (width, height) {
        tracing::warn!(
            "Output resolution adjusted by driver to {}x{}",
            granted.width,
            granted.height
        );
    }
    Ok((granted.width, granted.height))
}

/// Convert RGB to YUV color space
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32;
    let g = g as f32;
    let b = b as f32;

    let y = (0.299 * r + 0.587 * g + 0.114 * b).clamp(0.0, 255.0) as u8;
    let u = ((-0.147 * r - 0.289 * g + 0.436 * b) + 128.0).clamp(0.0, 255.0) as u8;
    let v = ((0.615 * r - 0.515 * g - 0.100 * b) + 128.0).clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbImage, overlay: &Overlay) -> Result<()> {
        let mut frame = if frame.dimensions() != (self.width, self.height) {
            image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            frame.clone()
        };

        // Boxes are drawn after resizing so the stroke width stays fixed
        draw_overlay(&mut frame, overlay);

        let yuyv_data = Self::rgb_to_yuyv(&frame);
        self.file
            .write_all(&yuyv_data)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn yuyv_packs_two_pixels_into_four_bytes() {
        let frame = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        let yuyv = V4L2Output::rgb_to_yuyv(&frame);
        assert_eq!(yuyv.len(), 4 * 2 * 2);
        assert!(yuyv[0] >= 254);
        assert_eq!(yuyv[0], yuyv[2]);
    }

    #[test]
    fn gray_has_neutral_chroma() {
        let (y, u, v) = rgb_to_yuv(128, 128, 128);
        assert!(y.abs_diff(128) <= 1);
        assert!(u.abs_diff(128) <= 1);
        assert!(v.abs_diff(128) <= 1);
    }
}
