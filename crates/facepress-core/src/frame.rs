//! Grayscale conversion and integral images for cascade evaluation.

use image::{GrayImage, RgbImage};

/// Fixed-point BT.601 luma weights (scaled by 2^14), matching the weights the
/// stock frontal-face cascades were trained against.
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

/// Convert an RGB image to single-channel luma (0.299 R + 0.587 G + 0.114 B).
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    let (width, height) = rgb.dimensions();
    let data = rgb
        .as_raw()
        .chunks_exact(3)
        .map(|px| {
            let y = px[0] as u32 * LUMA_R
                + px[1] as u32 * LUMA_G
                + px[2] as u32 * LUMA_B
                + (1 << (LUMA_SHIFT - 1));
            (y >> LUMA_SHIFT) as u8
        })
        .collect();
    // Length is exactly width * height by construction.
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Summed-area tables over a grayscale frame: plain sums and squared sums.
///
/// Both tables are `(width + 1) × (height + 1)` with a zero first row and
/// column, so a rectangle sum is four lookups.
pub struct IntegralImage {
    width: u32,
    height: u32,
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let (w, h) = (width as usize, height as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let v = raw[y * w + x] as u64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self {
            width,
            height,
            stride,
            sum,
            sq_sum,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Sum of pixels in `[x, x+w) × [y, y+h)`. Caller keeps the rectangle in bounds.
    #[inline]
    pub fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sum, self.stride, x, y, w, h)
    }

    /// Sum of squared pixels in `[x, x+w) × [y, y+h)`.
    #[inline]
    pub fn rect_sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::lookup(&self.sq_sum, self.stride, x, y, w, h)
    }

    #[inline]
    fn lookup(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let a = table[y0 * stride + x0];
        let b = table[y0 * stride + x1];
        let c = table[y1 * stride + x0];
        let d = table[y1 * stride + x1];
        (a + d) - (b + c)
    }
}
