//! JPEG round-trip through the scratch directory, and output encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError, ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Background quality; deliberately low so the effect is visible.
pub const DEFAULT_JPEG_QUALITY: u8 = 10;
pub const MAX_JPEG_QUALITY: u8 = 100;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("quality must be between 0 and {MAX_JPEG_QUALITY}, got {0}")]
    InvalidQuality(u8),
    #[error("failed to encode JPEG: {0}")]
    Jpeg(#[source] ImageError),
    #[error("scratch artifact {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode scratch artifact {path}: {source}")]
    DecodeBack {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("cannot infer an output format from {0}")]
    UnknownFormat(PathBuf),
    #[error("failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
}

/// The lossy encoding of one image as persisted in the scratch directory.
#[derive(Debug, Clone)]
pub struct CompressionArtifact {
    pub path: PathBuf,
    /// Encoded size in bytes.
    pub len: u64,
    pub quality: u8,
}

/// Both versions of an image, ready for compositing.
pub struct DualEncoding {
    /// The untouched decoded input.
    pub original: RgbImage,
    /// The scratch artifact, decoded back from disk.
    pub compressed: RgbImage,
    pub artifact: CompressionArtifact,
}

/// Encode `image` as baseline JPEG at `quality`.
///
/// Qualities below 1 are encoded at 1, the encoder's floor.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if quality > MAX_JPEG_QUALITY {
        return Err(EncodeError::InvalidQuality(quality));
    }
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.max(1));
    encoder
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(EncodeError::Jpeg)?;
    Ok(buffer)
}

/// Compress `original` at `quality`, persist it to `scratch_path`, and decode
/// it back from disk.
///
/// The artifact really goes through the file system so the background shows
/// exactly the loss a viewer of the JPEG would see.
pub fn dual_encode(
    original: RgbImage,
    quality: u8,
    scratch_path: &Path,
) -> Result<DualEncoding, EncodeError> {
    let bytes = encode_jpeg(&original, quality)?;
    let scratch_err = |source| EncodeError::Scratch {
        path: scratch_path.to_path_buf(),
        source,
    };

    std::fs::write(scratch_path, &bytes).map_err(scratch_err)?;
    let stored = std::fs::read(scratch_path).map_err(scratch_err)?;

    let compressed = image::load_from_memory_with_format(&stored, ImageFormat::Jpeg)
        .map_err(|source| EncodeError::DecodeBack {
            path: scratch_path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    tracing::debug!(
        path = %scratch_path.display(),
        quality,
        bytes = stored.len(),
        "wrote scratch artifact"
    );

    Ok(DualEncoding {
        original,
        compressed,
        artifact: CompressionArtifact {
            path: scratch_path.to_path_buf(),
            len: stored.len() as u64,
            quality,
        },
    })
}

/// Write `image` to `path` in the format implied by its extension, with that
/// format's default encoder settings.
///
/// `jpeg_quality` overrides the encoder default for JPEG destinations only.
pub fn write_output(
    image: &RgbImage,
    path: &Path,
    jpeg_quality: Option<u8>,
) -> Result<(), EncodeError> {
    let format = ImageFormat::from_path(path)
        .map_err(|_| EncodeError::UnknownFormat(path.to_path_buf()))?;
    let output_err = |source| EncodeError::Output {
        path: path.to_path_buf(),
        source,
    };

    match (format, jpeg_quality) {
        (ImageFormat::Jpeg, Some(quality)) => {
            let bytes = encode_jpeg(image, quality)?;
            std::fs::write(path, bytes).map_err(|e| output_err(ImageError::IoError(e)))
        }
        _ => image.save_with_format(path, format).map_err(output_err),
    }
}
