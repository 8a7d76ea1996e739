//! Frontal face detection with a boosted Haar cascade.
//!
//! Scans an image pyramid with the cascade's base window, then merges the
//! overlapping raw hits into face rectangles by similarity grouping.

use crate::cascade::{Cascade, CascadeError, WindowVerdict};
use crate::frame::{self, IntegralImage};
use crate::types::{FaceRegion, Size};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const DEFAULT_SCALE_FACTOR: f64 = 1.1;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 5;
pub const DEFAULT_MIN_SIZE: u32 = 30;
/// Relative tolerance when deciding two raw hits describe the same face.
const GROUP_EPS: f64 = 0.2;
/// Below this scale the window slides two pixels at a time.
const FINE_STEP_SCALE: f64 = 2.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade model not found: {0} — point cascade_path at an OpenCV haarcascade_frontalface_default.xml")]
    ModelNotFound(String),
    #[error("invalid cascade model {path}: {source}")]
    InvalidModel {
        path: String,
        #[source]
        source: CascadeError,
    },
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
    #[error("failed to read cascade model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pluggable face location backend.
///
/// The pipeline only needs rectangles; implement this to swap in another
/// detector, or to feed fixed regions in tests.
pub trait FaceLocator: Send + Sync {
    /// Locate faces in an RGB image. An empty result is not an error.
    fn locate(&self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Multi-scale scan parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Pyramid downscale ratio between consecutive scales (> 1).
    pub scale_factor: f64,
    /// Raw hits a group needs (strictly more than this) to be reported.
    /// Zero disables grouping.
    pub min_neighbors: u32,
    /// Smallest face box considered.
    pub min_size: Size,
    /// Largest face box considered; unbounded when `None`.
    pub max_size: Option<Size>,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: Size::square(DEFAULT_MIN_SIZE),
            max_size: None,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !self.scale_factor.is_finite() || self.scale_factor <= 1.0 {
            return Err(DetectorError::InvalidParams(format!(
                "scale_factor must be > 1.0, got {}",
                self.scale_factor
            )));
        }
        if self.min_size.width == 0 || self.min_size.height == 0 {
            return Err(DetectorError::InvalidParams("min_size must be non-zero".into()));
        }
        if let Some(max) = self.max_size {
            if !max.covers(self.min_size) {
                return Err(DetectorError::InvalidParams(format!(
                    "max_size {}x{} is smaller than min_size {}x{}",
                    max.width, max.height, self.min_size.width, self.min_size.height
                )));
            }
        }
        Ok(())
    }
}

/// Haar-cascade face detector.
pub struct CascadeDetector {
    cascade: Cascade,
    params: DetectorParams,
}

impl CascadeDetector {
    /// Load a cascade XML file from `model_path`.
    pub fn load(
        model_path: impl AsRef<Path>,
        params: DetectorParams,
    ) -> Result<Self, DetectorError> {
        let path = model_path.as_ref();
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(shown));
        }

        let xml = std::fs::read_to_string(path).map_err(|source| DetectorError::Io {
            path: shown.clone(),
            source,
        })?;
        let cascade = Cascade::from_xml(&xml).map_err(|source| DetectorError::InvalidModel {
            path: shown.clone(),
            source,
        })?;

        tracing::info!(
            path = %shown,
            window = ?cascade.window(),
            stages = cascade.stage_count(),
            features = cascade.feature_count(),
            "loaded Haar cascade"
        );

        Self::with_cascade(cascade, params)
    }

    /// Wrap an already-parsed cascade.
    pub fn with_cascade(cascade: Cascade, params: DetectorParams) -> Result<Self, DetectorError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Detect faces in a grayscale frame.
    ///
    /// Result order follows the scan and grouping order, not position or score.
    pub fn detect(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        let window = self.cascade.window();
        let mut candidates = Vec::new();

        for factor in self.scales(width, height) {
            let scaled_w = (width as f64 / factor).round() as u32;
            let scaled_h = (height as f64 / factor).round() as u32;
            let win_w = (window.width as f64 * factor).round() as u32;
            let win_h = (window.height as f64 * factor).round() as u32;

            let scaled: Cow<'_, GrayImage> = if scaled_w == width && scaled_h == height {
                Cow::Borrowed(gray)
            } else {
                Cow::Owned(imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
            };
            let ii = IntegralImage::new(&scaled);

            let before = candidates.len();
            self.scan(&ii, factor, Size::new(win_w, win_h), &mut candidates);
            tracing::trace!(
                factor,
                window = win_w,
                hits = candidates.len() - before,
                "scanned scale"
            );
        }

        let grouped = group_rectangles(&candidates, self.params.min_neighbors, GROUP_EPS);
        let faces: Vec<FaceRegion> = grouped
            .iter()
            .filter_map(|r| r.clip(width, height))
            .collect();

        tracing::debug!(
            width,
            height,
            candidates = candidates.len(),
            faces = faces.len(),
            "cascade detection done"
        );
        faces
    }

    /// Pyramid scale factors whose window fits both the image and the size limits.
    fn scales(&self, width: u32, height: u32) -> Vec<f64> {
        let window = self.cascade.window();
        let mut scales = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_w = (width as f64 / factor).round() as u32;
            let scaled_h = (height as f64 / factor).round() as u32;
            if scaled_w <= window.width || scaled_h <= window.height {
                break;
            }
            let win = Size::new(
                (window.width as f64 * factor).round() as u32,
                (window.height as f64 * factor).round() as u32,
            );
            if let Some(max) = self.params.max_size {
                if !max.covers(win) {
                    break;
                }
            }
            if win.covers(self.params.min_size) {
                scales.push(factor);
            }
            factor *= self.params.scale_factor;
        }
        scales
    }

    fn scan(&self, ii: &IntegralImage, factor: f64, win: Size, out: &mut Vec<FaceRegion>) {
        let window = self.cascade.window();
        let span_x = ii.width() - window.width;
        let span_y = ii.height() - window.height;
        let step = if factor > FINE_STEP_SCALE { 1 } else { 2 };

        let mut y = 0;
        while y < span_y {
            let mut x = 0;
            while x < span_x {
                match self.cascade.evaluate(ii, x, y) {
                    WindowVerdict::Face => out.push(FaceRegion::new(
                        (x as f64 * factor).round() as u32,
                        (y as f64 * factor).round() as u32,
                        win.width,
                        win.height,
                    )),
                    // Nothing here even for the first stage; skip the neighbour too.
                    WindowVerdict::Rejected { stage: 0 } => x += step,
                    WindowVerdict::Rejected { .. } => {}
                }
                x += step;
            }
            y += step;
        }
    }
}

impl FaceLocator for CascadeDetector {
    fn locate(&self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        Ok(self.detect(&frame::to_grayscale(image)))
    }
}

/// Locator that reports the same regions for every image.
///
/// Useful when face positions are known up front.
#[derive(Debug, Clone, Default)]
pub struct FixedLocator {
    regions: Vec<FaceRegion>,
}

impl FixedLocator {
    pub fn new(regions: Vec<FaceRegion>) -> Self {
        Self { regions }
    }
}

impl FaceLocator for FixedLocator {
    fn locate(&self, image: &RgbImage) -> Result<Vec<FaceRegion>, DetectorError> {
        let (w, h) = image.dimensions();
        Ok(self.regions.iter().filter_map(|r| r.clip(w, h)).collect())
    }
}

/// Merge raw detections into faces.
///
/// Hits are partitioned into classes of mutually similar rectangles, each
/// class is averaged, classes with `group_threshold` or fewer members are
/// dropped, and a small rectangle sitting inside a larger, better supported
/// one is discarded. A zero threshold returns the input unchanged.
pub fn group_rectangles(
    rects: &[FaceRegion],
    group_threshold: u32,
    eps: f64,
) -> Vec<FaceRegion> {
    if group_threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, class_count) = partition(rects, |a, b| similar(a, b, eps));

    let mut sums = vec![[0f64; 4]; class_count];
    let mut counts = vec![0u32; class_count];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += rect.x as f64;
        s[1] += rect.y as f64;
        s[2] += rect.width as f64;
        s[3] += rect.height as f64;
        counts[label] += 1;
    }

    let averaged: Vec<FaceRegion> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let inv = 1.0 / n as f64;
            FaceRegion::new(
                (s[0] * inv).round() as u32,
                (s[1] * inv).round() as u32,
                (s[2] * inv).round() as u32,
                (s[3] * inv).round() as u32,
            )
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1) = (r1.x as i64, r1.y as i64);
            let (x2, y2) = (r2.x as i64, r2.y as i64);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && r1.right() as i64 <= r2.right() as i64 + dx
                && r1.bottom() as i64 <= r2.bottom() as i64 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            grouped.push(*r1);
        }
    }
    grouped
}

/// Two rectangles match when every edge is within `eps` of the mean of their
/// smaller dimensions.
fn similar(a: &FaceRegion, b: &FaceRegion, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.right(), b.right())
        && close(a.bottom(), b.bottom())
}

/// Union-find equivalence classes. Labels are numbered in order of first
/// appearance.
fn partition<T>(items: &[T], equivalent: impl Fn(&T, &T) -> bool) -> (Vec<usize>, usize) {
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut parent: Vec<usize> = (0..items.len()).collect();
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            if equivalent(&items[i], &items[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut root_label = vec![usize::MAX; items.len()];
    let mut labels = Vec::with_capacity(items.len());
    let mut count = 0;
    for i in 0..items.len() {
        let root = find(&mut parent, i);
        if root_label[root] == usize::MAX {
            root_label[root] = count;
            count += 1;
        }
        labels.push(root_label[root]);
    }
    (labels, count)
}

/// Resolve where to look for the default frontal-face cascade.
///
/// `FACEPRESS_CASCADE` wins; otherwise the first existing stock OpenCV install
/// location; otherwise `models/haarcascade_frontalface_default.xml`.
pub fn default_cascade_path() -> PathBuf {
    if let Ok(path) = std::env::var("FACEPRESS_CASCADE") {
        return PathBuf::from(path);
    }
    const FILE: &str = "haarcascade_frontalface_default.xml";
    [
        "/usr/share/opencv4/haarcascades",
        "/usr/local/share/opencv4/haarcascades",
        "/usr/share/opencv/haarcascades",
        "/opt/homebrew/share/opencv4/haarcascades",
    ]
    .iter()
    .map(|dir| Path::new(dir).join(FILE))
    .find(|p| p.exists())
    .unwrap_or_else(|| Path::new("models").join(FILE))
}
