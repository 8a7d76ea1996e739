//! Batch driver: input directory in, face-preserving composites out.

use crate::analyzer::{analyze, AnalyzerError, SizeAnalysis};
use crate::compositor::{composite, draw_outlines, CompositeError};
use crate::config::{Config, ConfigError};
use crate::detector::{CascadeDetector, DetectorError, FaceLocator};
use crate::encoder::{dual_encode, write_output, CompressionArtifact, DualEncoding, EncodeError};
use crate::types::FaceRegion;
use image::{ImageError, ImageReader, RgbImage};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("composite error: {0}")]
    Composite(#[from] CompositeError),
    #[error("analysis error: {0}")]
    Analyzer(#[from] AnalyzerError),
}

/// What happened to one input image.
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    /// File name shared by the input, the scratch artifact and the output.
    pub name: String,
    pub source: PathBuf,
    pub output: PathBuf,
    /// Regions restored at original quality, clipped to the image.
    pub regions: Vec<FaceRegion>,
    pub artifact: CompressionArtifact,
}

/// An image skipped under `continue_on_error`.
#[derive(Debug, Clone)]
pub struct FailedImage {
    pub source: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: Vec<ImageOutcome>,
    pub failed: Vec<FailedImage>,
    /// Present when the run was configured to analyze.
    pub analysis: Option<SizeAnalysis>,
}

impl RunSummary {
    pub fn faces_restored(&self) -> usize {
        self.processed.iter().map(|o| o.regions.len()).sum()
    }
}

pub struct Pipeline {
    config: Config,
    locator: Box<dyn FaceLocator>,
}

impl Pipeline {
    /// Validate `config` and load its cascade. Fails before touching any
    /// directory if the detector cannot be built.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let detector = CascadeDetector::load(&config.cascade_path, config.detector_params())?;
        Self::with_locator(config, Box::new(detector))
    }

    /// Use a caller-supplied locator instead of the configured cascade.
    pub fn with_locator(
        config: Config,
        locator: Box<dyn FaceLocator>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config, locator })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process every regular file in the input directory, in name order.
    ///
    /// The scratch directory is recreated empty before the first image and
    /// removed after the last unless `keep_scratch` is set. `on_image` is
    /// called after each output is written.
    pub fn run(
        &self,
        mut on_image: impl FnMut(&ImageOutcome),
    ) -> Result<RunSummary, PipelineError> {
        let cfg = &self.config;
        let inputs = list_files(&cfg.input_dir).map_err(|source| PipelineError::Io {
            action: "list",
            path: cfg.input_dir.clone(),
            source,
        })?;

        reset_dir(&cfg.scratch_dir)?;
        std::fs::create_dir_all(&cfg.output_dir).map_err(|source| PipelineError::Io {
            action: "create",
            path: cfg.output_dir.clone(),
            source,
        })?;

        tracing::info!(
            input = %cfg.input_dir.display(),
            output = %cfg.output_dir.display(),
            count = inputs.len(),
            quality = cfg.jpeg_quality,
            "starting batch"
        );

        let mut summary = RunSummary::default();
        for path in inputs {
            match self.process_image(&path) {
                Ok(outcome) => {
                    on_image(&outcome);
                    summary.processed.push(outcome);
                }
                Err(e) if cfg.continue_on_error => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping image");
                    summary.failed.push(FailedImage {
                        source: path,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if cfg.analyze {
            summary.analysis = Some(analyze(&cfg.input_dir, &cfg.scratch_dir, &cfg.output_dir)?);
        }

        if !cfg.keep_scratch {
            remove_path(&cfg.scratch_dir)?;
        }

        tracing::info!(
            processed = summary.processed.len(),
            failed = summary.failed.len(),
            faces = summary.faces_restored(),
            "batch complete"
        );
        Ok(summary)
    }

    /// Load, locate, round-trip, composite and write a single image.
    ///
    /// Expects the scratch and output directories to exist.
    pub fn process_image(&self, path: &Path) -> Result<ImageOutcome, PipelineError> {
        let cfg = &self.config;
        let file_name = path.file_name().ok_or_else(|| PipelineError::Io {
            action: "name",
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
        let name = file_name.to_string_lossy().into_owned();

        let image = load_image(path)?;
        let (width, height) = image.dimensions();
        let regions: Vec<FaceRegion> = self
            .locator
            .locate(&image)?
            .into_iter()
            .filter_map(|r| r.clip(width, height))
            .collect();

        let DualEncoding {
            original,
            mut compressed,
            artifact,
        } = dual_encode(image, cfg.jpeg_quality, &cfg.scratch_dir.join(file_name))?;

        composite(&mut compressed, &original, &regions)?;
        if cfg.draw_outlines {
            draw_outlines(&mut compressed, &regions);
        }

        let output = cfg.output_dir.join(file_name);
        write_output(&compressed, &output, cfg.output_quality)?;

        tracing::debug!(
            name = %name,
            width,
            height,
            faces = regions.len(),
            artifact_bytes = artifact.len,
            "image written"
        );

        Ok(ImageOutcome {
            name,
            source: path.to_path_buf(),
            output,
            regions,
            artifact,
        })
    }
}

/// Decode any supported format, sniffing content rather than trusting the
/// extension. Alpha is dropped.
pub fn load_image(path: &Path) -> Result<RgbImage, PipelineError> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|source| PipelineError::Io {
            action: "open",
            path: path.to_path_buf(),
            source,
        })?;
    let decoded = reader.decode().map_err(|source| PipelineError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.to_rgb8())
}

/// Regular files directly inside `dir`, sorted by name. Symlinks to files
/// count; directories and everything else are skipped.
pub(crate) fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        } else {
            tracing::debug!(path = %path.display(), "skipping non-file entry");
        }
    }
    files.sort();
    Ok(files)
}

fn reset_dir(dir: &Path) -> Result<(), PipelineError> {
    remove_path(dir)?;
    std::fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
        action: "create",
        path: dir.to_path_buf(),
        source,
    })
}

fn remove_path(path: &Path) -> Result<(), PipelineError> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|source| PipelineError::Io {
        action: "remove",
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FixedLocator;
    use image::Rgb;

    fn config_in(root: &Path) -> Config {
        Config {
            input_dir: root.join("in"),
            output_dir: root.join("out"),
            scratch_dir: root.join("tmp"),
            cascade_path: root.join("missing.xml"),
            ..Config::default()
        }
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, ((x + y) * 3) as u8]))
    }

    #[test]
    fn test_list_files_sorted_and_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("a.png"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let names: Vec<_> = list_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.jpg"]);
    }

    #[test]
    fn test_load_image_sniffs_content() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient(12, 8);
        // PNG bytes behind a misleading extension.
        let path = dir.path().join("photo.jpg");
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();
        assert_eq!(load_image(&path).unwrap(), img);
    }

    #[test]
    fn test_load_image_errors() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("notes.txt");
        std::fs::write(&junk, b"not an image").unwrap();
        assert!(matches!(load_image(&junk), Err(PipelineError::Decode { .. })));
        assert!(matches!(
            load_image(&dir.path().join("absent.png")),
            Err(PipelineError::Io { action: "open", .. })
        ));
    }

    #[test]
    fn test_from_config_fails_fast_on_missing_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let err = Pipeline::from_config(config_in(dir.path())).err().unwrap();
        assert!(matches!(err, PipelineError::Detector(DetectorError::ModelNotFound(_))));
        assert!(!dir.path().join("tmp").exists());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(dir.path());
        cfg.jpeg_quality = 150;
        let err = Pipeline::with_locator(cfg, Box::new(FixedLocator::new(vec![])))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_missing_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            Pipeline::with_locator(config_in(dir.path()), Box::new(FixedLocator::new(vec![])))
                .unwrap();
        let err = pipeline.run(|_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::Io { action: "list", .. }));
    }

    #[test]
    fn test_process_image_clips_regions() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        for d in [&cfg.input_dir, &cfg.output_dir, &cfg.scratch_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        let src = cfg.input_dir.join("p.png");
        gradient(40, 30).save(&src).unwrap();

        let locator = FixedLocator::new(vec![FaceRegion::new(30, 20, 50, 50)]);
        let pipeline = Pipeline::with_locator(cfg.clone(), Box::new(locator)).unwrap();
        let outcome = pipeline.process_image(&src).unwrap();

        assert_eq!(outcome.name, "p.png");
        assert_eq!(outcome.regions, vec![FaceRegion::new(30, 20, 10, 10)]);
        assert_eq!(outcome.output, cfg.output_dir.join("p.png"));
        assert!(cfg.scratch_dir.join("p.png").exists());
    }

    #[test]
    fn test_batch_through_cascade_detector() {
        use crate::cascade::fixtures::EDGE_CASCADE_XML;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(dir.path());
        std::fs::create_dir_all(&cfg.input_dir).unwrap();
        cfg.cascade_path = dir.path().join("edge.xml");
        std::fs::write(&cfg.cascade_path, EDGE_CASCADE_XML).unwrap();
        cfg.scale_factor = 1.25;
        cfg.min_neighbors = 0;
        cfg.min_size = 6;
        cfg.keep_scratch = true;

        let edge = RgbImage::from_fn(64, 48, |_, y| {
            if y < 24 {
                Rgb([10, 10, 10])
            } else {
                Rgb([240, 240, 240])
            }
        });
        edge.save(cfg.input_dir.join("edge.png")).unwrap();
        let flat = RgbImage::from_pixel(64, 48, Rgb([90, 90, 90]));
        flat.save(cfg.input_dir.join("flat.png")).unwrap();

        let pipeline = Pipeline::from_config(cfg.clone()).unwrap();
        let summary = pipeline.run(|_| {}).unwrap();
        assert_eq!(summary.processed.len(), 2);

        let edge_outcome = &summary.processed[0];
        assert_eq!(edge_outcome.name, "edge.png");
        assert!(!edge_outcome.regions.is_empty());
        let out = load_image(&edge_outcome.output).unwrap();
        for r in &edge_outcome.regions {
            assert!(r.right() <= 64 && r.bottom() <= 48, "{r:?} out of bounds");
            for y in r.y..r.bottom() {
                for x in r.x..r.right() {
                    assert_eq!(out.get_pixel(x, y), edge.get_pixel(x, y));
                }
            }
        }

        let flat_outcome = &summary.processed[1];
        assert!(flat_outcome.regions.is_empty());
        let compressed = load_image(&cfg.scratch_dir.join("flat.png")).unwrap();
        assert_eq!(load_image(&flat_outcome.output).unwrap(), compressed);
    }

    #[test]
    fn test_scratch_above_input_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(dir.path());
        cfg.scratch_dir = dir.path().to_path_buf();
        std::fs::create_dir_all(&cfg.input_dir).unwrap();
        let photo = cfg.input_dir.join("a.png");
        gradient(8, 8).save(&photo).unwrap();

        let err = Pipeline::with_locator(cfg, Box::new(FixedLocator::new(vec![])))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(photo.exists());
    }

    #[test]
    fn test_remove_path_variants() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        remove_path(&file).unwrap();
        assert!(!file.exists());

        let nested = dir.path().join("d").join("e");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("x"), b"x").unwrap();
        remove_path(&dir.path().join("d")).unwrap();
        assert!(!dir.path().join("d").exists());

        remove_path(&dir.path().join("never")).unwrap();
    }
}
