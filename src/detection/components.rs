//! Connected regions of a change map, filtered by relative size and ranked.

use image::Luma;
use imageproc::region_labelling::{connected_components, Connectivity};

use super::types::{ChangeMap, FlawBox};

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Smallest box, as a fraction of the frame, worth reporting (exclusive).
    pub min_area_ratio: f64,
    /// Largest box, as a fraction of the frame, worth reporting (exclusive).
    pub max_area_ratio: f64,
    pub max_boxes: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.001,
            max_area_ratio: 0.5,
            max_boxes: 4,
        }
    }
}

/// Exclusive `(min, max)` box-area bounds for a `width`×`height` frame.
pub fn area_thresholds(width: u32, height: u32, config: &ExtractionConfig) -> (f64, f64) {
    let pixels = width as f64 * height as f64;
    (pixels * config.min_area_ratio, pixels * config.max_area_ratio)
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Extent {
    fn at(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn include(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    fn to_box(self) -> FlawBox {
        FlawBox::new(
            self.min_x,
            self.min_y,
            self.max_x - self.min_x + 1,
            self.max_y - self.min_y + 1,
        )
    }
}

/// Bounding boxes of the 8-connected foreground regions whose box area lies
/// strictly inside [`area_thresholds`], largest first, at most
/// `config.max_boxes` of them. Equal areas keep labelling (raster) order.
pub fn extract_boxes(map: &ChangeMap, config: &ExtractionConfig) -> Vec<FlawBox> {
    let (width, height) = map.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let labels = connected_components(map.as_image(), Connectivity::Eight, Luma([0u8]));

    // Label 0 is the background and never gets an extent.
    let mut extents: Vec<Option<Extent>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if extents.len() <= label {
            extents.resize(label + 1, None);
        }
        extents[label] = Some(match extents[label] {
            Some(mut extent) => {
                extent.include(x, y);
                extent
            }
            None => Extent::at(x, y),
        });
    }

    let (min_area, max_area) = area_thresholds(width, height, config);
    let mut boxes: Vec<FlawBox> = extents
        .into_iter()
        .flatten()
        .map(Extent::to_box)
        .filter(|b| {
            let area = b.area as f64;
            area > min_area && area < max_area
        })
        .collect();

    boxes.sort_by(|a, b| b.area.cmp(&a.area));
    boxes.truncate(config.max_boxes);

    tracing::debug!("{} candidate boxes", boxes.len());
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn map_with(width: u32, height: u32, rects: &[(i32, i32, u32, u32)]) -> ChangeMap {
        let mut image = GrayImage::new(width, height);
        for &(x, y, w, h) in rects {
            draw_filled_rect_mut(
                &mut image,
                Rect::at(x, y).of_size(w, h),
                Luma([ChangeMap::FOREGROUND]),
            );
        }
        ChangeMap::new(image)
    }

    #[test]
    fn thresholds_scale_with_frame() {
        let (lo, hi) = area_thresholds(640, 480, &ExtractionConfig::default());
        assert!((lo - 307.2).abs() < 1e-9);
        assert!((hi - 153_600.0).abs() < 1e-9);
    }

    #[test]
    fn empty_map_has_no_boxes() {
        let map = ChangeMap::empty(640, 480);
        assert!(extract_boxes(&map, &ExtractionConfig::default()).is_empty());
    }

    #[test]
    fn single_region_gives_exact_box() {
        let map = map_with(640, 480, &[(100, 100, 50, 50)]);
        let boxes = extract_boxes(&map, &ExtractionConfig::default());
        assert_eq!(boxes, vec![FlawBox::new(100, 100, 50, 50)]);
        assert_eq!(boxes[0].area, 2500);
    }

    #[test]
    fn filters_by_relative_size() {
        // 10×10 = 100 is below 307.2; 400×400 is above half the frame.
        let map = map_with(
            640,
            480,
            &[(0, 0, 10, 10), (200, 40, 400, 400), (20, 300, 30, 30)],
        );
        let boxes = extract_boxes(&map, &ExtractionConfig::default());
        assert_eq!(boxes, vec![FlawBox::new(20, 300, 30, 30)]);
    }

    #[test]
    fn keeps_four_largest_in_descending_order() {
        let map = map_with(
            640,
            480,
            &[
                (10, 10, 20, 20),
                (100, 10, 40, 40),
                (200, 10, 25, 25),
                (300, 10, 60, 60),
                (10, 200, 30, 30),
                (200, 200, 50, 50),
            ],
        );
        let boxes = extract_boxes(&map, &ExtractionConfig::default());
        let areas: Vec<u32> = boxes.iter().map(|b| b.area).collect();
        assert_eq!(areas, vec![3600, 2500, 1600, 900]);

        let (lo, hi) = area_thresholds(640, 480, &ExtractionConfig::default());
        assert!(boxes
            .iter()
            .all(|b| (b.area as f64) > lo && (b.area as f64) < hi));
    }

    #[test]
    fn diagonal_neighbours_join_one_region() {
        let mut image = GrayImage::new(100, 100);
        for i in 0..40 {
            image.put_pixel(10 + i, 10 + i, Luma([ChangeMap::FOREGROUND]));
        }
        let boxes = extract_boxes(&ChangeMap::new(image), &ExtractionConfig::default());
        assert_eq!(boxes, vec![FlawBox::new(10, 10, 40, 40)]);
    }

    #[test]
    fn full_frame_change_is_not_reported() {
        let image = GrayImage::from_pixel(64, 64, Luma([ChangeMap::FOREGROUND]));
        assert!(extract_boxes(&ChangeMap::new(image), &ExtractionConfig::default()).is_empty());
    }
}
