//! Restores original-quality face regions on top of the compressed background.

use crate::types::FaceRegion;
use image::{GenericImage, GenericImageView, ImageError, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use thiserror::Error;

/// Debug outline colour.
pub const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const OUTLINE_THICKNESS: u32 = 2;

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("buffer dimensions differ: compressed {compressed:?}, original {original:?}")]
    DimensionMismatch {
        compressed: (u32, u32),
        original: (u32, u32),
    },
    #[error("pixel copy failed: {0}")]
    Copy(#[from] ImageError),
}

/// Copy every region of `original` into `compressed`, in place.
///
/// Regions are clipped to the frame and empty ones skipped. All copies read
/// from the same source, so overlaps and ordering don't change the result.
/// Edges are hard cuts; there is no blending. Returns how many regions were
/// restored.
pub fn composite(
    compressed: &mut RgbImage,
    original: &RgbImage,
    regions: &[FaceRegion],
) -> Result<usize, CompositeError> {
    if compressed.dimensions() != original.dimensions() {
        return Err(CompositeError::DimensionMismatch {
            compressed: compressed.dimensions(),
            original: original.dimensions(),
        });
    }

    let (width, height) = original.dimensions();
    let mut restored = 0;
    for region in regions.iter().filter_map(|r| r.clip(width, height)) {
        let patch = original
            .view(region.x, region.y, region.width, region.height)
            .to_image();
        compressed.copy_from(&patch, region.x, region.y)?;
        restored += 1;
    }
    Ok(restored)
}

/// Draw a [`OUTLINE_THICKNESS`]-pixel outline just inside every region.
pub fn draw_outlines(image: &mut RgbImage, regions: &[FaceRegion]) {
    let (width, height) = image.dimensions();
    for region in regions.iter().filter_map(|r| r.clip(width, height)) {
        for inset in 0..OUTLINE_THICKNESS {
            if region.width <= 2 * inset || region.height <= 2 * inset {
                break;
            }
            let rect = Rect::at((region.x + inset) as i32, (region.y + inset) as i32)
                .of_size(region.width - 2 * inset, region.height - 2 * inset);
            draw_hollow_rect_mut(image, rect, OUTLINE_COLOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 200]))
    }

    fn flat(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([7, 7, 7]))
    }

    fn in_any(regions: &[FaceRegion], x: u32, y: u32) -> bool {
        regions.iter().any(|r| r.contains(x, y))
    }

    #[test]
    fn test_no_regions_leaves_compressed_untouched() {
        let mut out = flat(20, 10);
        let restored = composite(&mut out, &original(20, 10), &[]).unwrap();
        assert_eq!(restored, 0);
        assert_eq!(out, flat(20, 10));
    }

    #[test]
    fn test_regions_restore_original_and_nothing_else() {
        let src = original(120, 80);
        let regions = [FaceRegion::new(10, 5, 30, 20), FaceRegion::new(70, 40, 25, 25)];
        let mut out = flat(120, 80);

        assert_eq!(composite(&mut out, &src, &regions).unwrap(), 2);

        for (x, y, px) in out.enumerate_pixels() {
            if in_any(&regions, x, y) {
                assert_eq!(px, src.get_pixel(x, y), "({x},{y}) should be original");
            } else {
                assert_eq!(px, &Rgb([7, 7, 7]), "({x},{y}) should be compressed");
            }
        }
    }

    #[test]
    fn test_composite_twice_is_idempotent() {
        let src = original(50, 50);
        let regions = [FaceRegion::new(5, 5, 20, 20), FaceRegion::new(15, 15, 20, 20)];
        let mut once = flat(50, 50);
        composite(&mut once, &src, &regions).unwrap();
        let mut twice = once.clone();
        composite(&mut twice, &src, &regions).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_overlapping_regions_order_independent() {
        let src = original(50, 50);
        let a = FaceRegion::new(5, 5, 20, 20);
        let b = FaceRegion::new(15, 10, 20, 30);
        let mut ab = flat(50, 50);
        let mut ba = flat(50, 50);
        composite(&mut ab, &src, &[a, b]).unwrap();
        composite(&mut ba, &src, &[b, a]).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_regions_touching_edges() {
        let src = original(40, 30);
        let regions = [
            FaceRegion::new(0, 0, 10, 10),
            FaceRegion::new(30, 20, 10, 10),
            FaceRegion::new(0, 0, 40, 1),
        ];
        let mut out = flat(40, 30);
        assert_eq!(composite(&mut out, &src, &regions).unwrap(), 3);
        assert_eq!(out.get_pixel(0, 0), src.get_pixel(0, 0));
        assert_eq!(out.get_pixel(39, 29), src.get_pixel(39, 29));
        assert_eq!(out.get_pixel(39, 0), src.get_pixel(39, 0));
        assert_eq!(out.get_pixel(20, 15), &Rgb([7, 7, 7]));
    }

    #[test]
    fn test_region_past_edge_is_clipped() {
        let src = original(40, 30);
        let regions = [FaceRegion::new(35, 25, 50, 50), FaceRegion::new(100, 100, 5, 5)];
        let mut out = flat(40, 30);
        assert_eq!(composite(&mut out, &src, &regions).unwrap(), 1);
        assert_eq!(out.get_pixel(39, 29), src.get_pixel(39, 29));
        assert_eq!(out.get_pixel(34, 29), &Rgb([7, 7, 7]));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut out = flat(10, 10);
        let err = composite(&mut out, &original(10, 11), &[]).unwrap_err();
        assert!(matches!(err, CompositeError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_outline_is_two_pixels_inside_region() {
        let mut img = flat(40, 40);
        draw_outlines(&mut img, &[FaceRegion::new(10, 10, 20, 20)]);
        assert_eq!(img.get_pixel(10, 10), &OUTLINE_COLOR);
        assert_eq!(img.get_pixel(11, 20), &OUTLINE_COLOR);
        assert_eq!(img.get_pixel(29, 29), &OUTLINE_COLOR);
        assert_eq!(img.get_pixel(28, 15), &OUTLINE_COLOR);
        assert_eq!(img.get_pixel(12, 20), &Rgb([7, 7, 7]));
        assert_eq!(img.get_pixel(9, 10), &Rgb([7, 7, 7]));
        assert_eq!(img.get_pixel(30, 30), &Rgb([7, 7, 7]));
    }

    #[test]
    fn test_outline_on_clipped_corner_region() {
        let mut img = flat(10, 10);
        draw_outlines(&mut img, &[FaceRegion::new(9, 9, 5, 5), FaceRegion::new(50, 50, 5, 5)]);
        assert_eq!(img.get_pixel(8, 8), &Rgb([7, 7, 7]));
    }
}
