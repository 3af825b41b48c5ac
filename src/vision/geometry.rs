//! Box geometry
//!
//! Maps raw contour rectangles to padded, normalized quadrilateral boxes.

use serde::{Deserialize, Serialize};

/// Area-to-perimeter multiplier used to size the margin around a contour
pub const DEFAULT_OFFSET_FACTOR: f32 = 1.8;

/// Raster dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in the raster
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Axis-aligned rectangle around one connected component (pixel space)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContourRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl ContourRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// Display metadata for a caller-side renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxStyle {
    /// Stroke colour as RGB
    pub stroke: [u8; 3],
}

impl BoxStyle {
    /// Deterministic, well-spread colour for a box id
    pub fn for_id(id: usize) -> Self {
        // golden-angle hue walk
        let hue = (id as f32 * 137.508) % 360.0;
        Self {
            stroke: hsv_to_rgb(hue, 0.75, 0.95),
        }
    }

    /// Stroke colour as a `#rrggbb` string
    pub fn stroke_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.stroke[0], self.stroke[1], self.stroke[2])
    }
}

/// Candidate text region in normalized image-fraction coordinates
///
/// Corners are ordered top-left, top-right, bottom-right, bottom-left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub id: usize,
    pub corners: [(f32, f32); 4],
    pub style: BoxStyle,
}

impl BoundingBox {
    pub fn top_left(&self) -> (f32, f32) {
        self.corners[0]
    }

    pub fn bottom_right(&self) -> (f32, f32) {
        self.corners[2]
    }

    /// Recover the pixel rectangle on a canvas of the given size
    pub fn to_pixels(&self, canvas: ImageSize) -> PixelBox {
        let (x1, y1) = self.top_left();
        let (x2, y2) = self.bottom_right();
        let width = (x2 - x1) * canvas.width as f32;
        let height = (y2 - y1) * canvas.height as f32;
        PixelBox {
            x: (x1 * canvas.width as f32).round() as i64,
            y: (y1 * canvas.height as f32).round() as i64,
            width: width.round() as i64,
            height: height.round() as i64,
        }
    }
}

/// Integer rectangle in source-image pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl PixelBox {
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Margin added on every side of a contour rectangle
pub fn margin(rect: &ContourRect, factor: f32) -> f32 {
    let w = rect.width as f32;
    let h = rect.height as f32;
    (w * h * factor) / (2.0 * (w + h))
}

/// Expand a contour rectangle by its margin and normalize to [0, 1]
pub fn expand(rect: &ContourRect, id: usize, image_size: ImageSize) -> BoundingBox {
    expand_with_factor(rect, id, image_size, DEFAULT_OFFSET_FACTOR)
}

/// [`expand`] with an explicit margin factor
pub fn expand_with_factor(
    rect: &ContourRect,
    id: usize,
    image_size: ImageSize,
    factor: f32,
) -> BoundingBox {
    let offset = margin(rect, factor);
    let width = image_size.width as f32;
    let height = image_size.height as f32;

    // The trailing -1 on each edge is kept for output parity with boxes
    // produced by earlier releases.
    let x1 = (rect.x as f32 - offset).clamp(0.0, width) - 1.0;
    let x2 = (x1 + rect.width as f32 + 2.0 * offset).clamp(0.0, width) - 1.0;
    let y1 = (rect.y as f32 - offset).clamp(0.0, height) - 1.0;
    let y2 = (y1 + rect.height as f32 + 2.0 * offset).clamp(0.0, height) - 1.0;

    let nx1 = (x1 / width).clamp(0.0, 1.0);
    let nx2 = (x2 / width).clamp(0.0, 1.0);
    let ny1 = (y1 / height).clamp(0.0, 1.0);
    let ny2 = (y2 / height).clamp(0.0, 1.0);

    BoundingBox {
        id,
        corners: [(nx1, ny1), (nx2, ny1), (nx2, ny2), (nx1, ny2)],
        style: BoxStyle::for_id(id),
    }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: ImageSize = ImageSize { width: 512, height: 512 };

    #[test]
    fn test_margin_formula() {
        let rect = ContourRect::new(10, 10, 40, 10);
        // 40 * 10 * 1.8 / (2 * 50) = 7.2
        assert!((margin(&rect, 1.8) - 7.2).abs() < 1e-5);
    }

    #[test]
    fn test_expand_interior_rect() {
        let rect = ContourRect::new(100, 200, 40, 10);
        let bbox = expand(&rect, 3, SIZE);

        let offset = 7.2f32;
        let x1 = 100.0 - offset - 1.0;
        let x2 = x1 + 40.0 + 2.0 * offset - 1.0;
        let y1 = 200.0 - offset - 1.0;
        let y2 = y1 + 10.0 + 2.0 * offset - 1.0;

        assert_eq!(bbox.id, 3);
        assert!((bbox.corners[0].0 - x1 / 512.0).abs() < 1e-6);
        assert!((bbox.corners[0].1 - y1 / 512.0).abs() < 1e-6);
        assert!((bbox.corners[2].0 - x2 / 512.0).abs() < 1e-6);
        assert!((bbox.corners[2].1 - y2 / 512.0).abs() < 1e-6);
    }

    #[test]
    fn test_corner_order() {
        let bbox = expand(&ContourRect::new(50, 60, 20, 8), 0, SIZE);
        let [tl, tr, br, bl] = bbox.corners;
        assert_eq!(tl.1, tr.1);
        assert_eq!(tr.0, br.0);
        assert_eq!(br.1, bl.1);
        assert_eq!(bl.0, tl.0);
        assert!(tl.0 < tr.0);
        assert!(tl.1 < bl.1);
    }

    #[test]
    fn test_corners_stay_normalized_and_never_shrink() {
        let rects = [
            ContourRect::new(0, 0, 3, 3),
            ContourRect::new(0, 0, 512, 512),
            ContourRect::new(509, 509, 3, 3),
            ContourRect::new(1, 400, 200, 4),
            ContourRect::new(250, 0, 5, 90),
            ContourRect::new(300, 300, 120, 60),
        ];

        for rect in rects {
            let bbox = expand(&rect, 0, SIZE);
            for (x, y) in bbox.corners {
                assert!((0.0..=1.0).contains(&x), "x out of range for {:?}: {}", rect, x);
                assert!((0.0..=1.0).contains(&y), "y out of range for {:?}: {}", rect, y);
            }

            // Away from the right/bottom edge the span only grows
            let offset = margin(&rect, DEFAULT_OFFSET_FACTOR);
            let fits_x = rect.x as f32 + rect.width as f32 + offset < 511.0;
            let fits_y = rect.y as f32 + rect.height as f32 + offset < 511.0;
            let px = bbox.to_pixels(SIZE);
            if fits_x {
                assert!(px.width >= rect.width as i64, "{:?} -> {:?}", rect, px);
            }
            if fits_y {
                assert!(px.height >= rect.height as i64, "{:?} -> {:?}", rect, px);
            }
        }
    }

    #[test]
    fn test_style_is_deterministic() {
        assert_eq!(BoxStyle::for_id(7), BoxStyle::for_id(7));
        assert_ne!(BoxStyle::for_id(1), BoxStyle::for_id(2));
        assert_eq!(BoxStyle::for_id(0).stroke_hex().len(), 7);
    }

    #[test]
    fn test_to_pixels_roundtrip() {
        let bbox = BoundingBox {
            id: 0,
            corners: [(0.25, 0.5), (0.75, 0.5), (0.75, 0.75), (0.25, 0.75)],
            style: BoxStyle::for_id(0),
        };
        let px = bbox.to_pixels(ImageSize::new(400, 200));
        assert_eq!(px, PixelBox { x: 100, y: 100, width: 200, height: 50 });
        assert!(!px.is_degenerate());
    }
}
