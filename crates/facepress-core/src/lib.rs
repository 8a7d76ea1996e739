//! facepress-core — face-preserving photo compression.
//!
//! Each image is re-encoded as a low-quality JPEG, then the regions a Haar
//! cascade finds as faces are copied back from the original, so the file
//! shrinks while faces stay sharp.

pub mod analyzer;
pub mod cascade;
pub mod compositor;
pub mod config;
pub mod detector;
pub mod encoder;
pub mod frame;
pub mod pipeline;
pub mod types;

pub use analyzer::{analyze, SizeAnalysis, SizeReport};
pub use config::Config;
pub use detector::{CascadeDetector, DetectorParams, FaceLocator, FixedLocator};
pub use pipeline::{load_image, ImageOutcome, Pipeline, PipelineError, RunSummary};
pub use types::{FaceRegion, Size};
