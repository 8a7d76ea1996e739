use crate::detector::{
    default_cascade_path, DetectorParams, DEFAULT_MIN_NEIGHBORS, DEFAULT_MIN_SIZE,
    DEFAULT_SCALE_FACTOR,
};
use crate::encoder::{DEFAULT_JPEG_QUALITY, MAX_JPEG_QUALITY};
use crate::types::Size;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Batch configuration.
///
/// Resolved in layers: defaults, then an optional TOML file, then
/// `FACEPRESS_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory of source photos (not recursed).
    pub input_dir: PathBuf,
    /// Where composites are written, one per input, same file name.
    pub output_dir: PathBuf,
    /// Holds the compressed intermediates; wiped at start and end of a run.
    pub scratch_dir: PathBuf,
    /// OpenCV Haar cascade XML.
    pub cascade_path: PathBuf,
    /// JPEG quality of the compressed background (0–100).
    pub jpeg_quality: u8,
    /// JPEG quality for JPEG outputs; encoder default when unset.
    pub output_quality: Option<u8>,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Smallest detectable face, in pixels (square).
    pub min_size: u32,
    /// Largest detectable face, in pixels (square).
    pub max_size: Option<u32>,
    /// Outline restored regions on the output.
    pub draw_outlines: bool,
    /// Print a size comparison after the run.
    pub analyze: bool,
    /// Leave the scratch directory in place after the run.
    pub keep_scratch: bool,
    /// Log and skip images that fail instead of aborting the batch.
    pub continue_on_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("images"),
            output_dir: PathBuf::from("output_images"),
            scratch_dir: PathBuf::from("temp"),
            cascade_path: default_cascade_path(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            output_quality: None,
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: DEFAULT_MIN_SIZE,
            max_size: None,
            draw_outlines: false,
            analyze: false,
            keep_scratch: false,
            continue_on_error: false,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        toml::from_str(src).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Load a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&src).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults overridden by `FACEPRESS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `FACEPRESS_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        env_override("FACEPRESS_INPUT_DIR", &mut self.input_dir);
        env_override("FACEPRESS_OUTPUT_DIR", &mut self.output_dir);
        env_override("FACEPRESS_SCRATCH_DIR", &mut self.scratch_dir);
        env_override("FACEPRESS_CASCADE", &mut self.cascade_path);
        env_override("FACEPRESS_JPEG_QUALITY", &mut self.jpeg_quality);
        env_override_opt("FACEPRESS_OUTPUT_QUALITY", &mut self.output_quality);
        env_override("FACEPRESS_SCALE_FACTOR", &mut self.scale_factor);
        env_override("FACEPRESS_MIN_NEIGHBORS", &mut self.min_neighbors);
        env_override("FACEPRESS_MIN_SIZE", &mut self.min_size);
        env_override_opt("FACEPRESS_MAX_SIZE", &mut self.max_size);
        env_flag("FACEPRESS_DRAW_OUTLINES", &mut self.draw_outlines);
        env_flag("FACEPRESS_ANALYZE", &mut self.analyze);
        env_flag("FACEPRESS_KEEP_SCRATCH", &mut self.keep_scratch);
        env_flag("FACEPRESS_CONTINUE_ON_ERROR", &mut self.continue_on_error);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jpeg_quality > MAX_JPEG_QUALITY {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be 0–{MAX_JPEG_QUALITY}, got {}",
                self.jpeg_quality
            )));
        }
        if let Some(q) = self.output_quality.filter(|&q| q > MAX_JPEG_QUALITY) {
            return Err(ConfigError::Invalid(format!(
                "output_quality must be 0–{MAX_JPEG_QUALITY}, got {q}"
            )));
        }
        self.validate_dirs()?;
        self.detector_params()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The scratch directory is deleted recursively, so it must not hold the
    /// inputs or the outputs. Paths are compared after making them absolute
    /// and folding `.` and `..`; symlinks are not resolved.
    fn validate_dirs(&self) -> Result<(), ConfigError> {
        let input = normalized(&self.input_dir)?;
        let output = normalized(&self.output_dir)?;
        let scratch = normalized(&self.scratch_dir)?;

        if input.starts_with(&scratch) || scratch.starts_with(&input) {
            return Err(ConfigError::Invalid(format!(
                "scratch_dir {} overlaps input_dir {}",
                self.scratch_dir.display(),
                self.input_dir.display()
            )));
        }
        if output.starts_with(&scratch) {
            return Err(ConfigError::Invalid(format!(
                "output_dir {} lies inside scratch_dir {}",
                self.output_dir.display(),
                self.scratch_dir.display()
            )));
        }
        if output == input {
            return Err(ConfigError::Invalid(format!(
                "output_dir {} would overwrite the inputs",
                self.output_dir.display()
            )));
        }
        Ok(())
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: Size::square(self.min_size),
            max_size: self.max_size.map(Size::square),
        }
    }
}

fn normalized(path: &Path) -> Result<PathBuf, ConfigError> {
    let absolute = std::path::absolute(path).map_err(|e| {
        ConfigError::Invalid(format!("cannot resolve directory {:?}: {e}", path))
    })?;
    let mut folded = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                folded.pop();
            }
            other => folded.push(other.as_os_str()),
        }
    }
    Ok(folded)
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment override")
            }
        }
    }
}

fn env_override_opt<T: FromStr>(key: &str, slot: &mut Option<T>) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment override")
            }
        }
    }
}

fn env_flag(key: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *slot = v != "0";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.input_dir, PathBuf::from("images"));
        assert_eq!(c.output_dir, PathBuf::from("output_images"));
        assert_eq!(c.scratch_dir, PathBuf::from("temp"));
        assert_eq!(c.jpeg_quality, 10);
        assert_eq!(c.min_neighbors, 5);
        assert_eq!(c.min_size, 30);
        assert!(!c.draw_outlines && !c.analyze && !c.keep_scratch && !c.continue_on_error);
        c.validate().unwrap();
    }

    #[test]
    fn test_toml_overrides_and_keeps_defaults() {
        let c = Config::from_toml_str(
            r#"
            input_dir = "photos"
            jpeg_quality = 5
            max_size = 400
            draw_outlines = true
            "#,
        )
        .unwrap();
        assert_eq!(c.input_dir, PathBuf::from("photos"));
        assert_eq!(c.jpeg_quality, 5);
        assert_eq!(c.max_size, Some(400));
        assert!(c.draw_outlines);
        assert_eq!(c.output_dir, PathBuf::from("output_images"));
        assert!((c.scale_factor - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let err = Config::from_toml_str("jpeg_qualty = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/facepress.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facepress.toml");
        std::fs::write(&path, "min_neighbors = 3\nkeep_scratch = true\n").unwrap();
        let c = Config::load(&path).unwrap();
        assert_eq!(c.min_neighbors, 3);
        assert!(c.keep_scratch);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = Config::default();
        c.jpeg_quality = 101;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.output_quality = Some(200);
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.scale_factor = 0.9;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.min_size = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.max_size = Some(10);
        assert!(c.validate().is_err());
    }

    fn with_dirs(input: &str, output: &str, scratch: &str) -> Config {
        Config {
            input_dir: PathBuf::from(input),
            output_dir: PathBuf::from(output),
            scratch_dir: PathBuf::from(scratch),
            ..Config::default()
        }
    }

    #[test]
    fn test_validate_rejects_dangerous_directories() {
        // scratch is input
        assert!(with_dirs("images", "out", "images").validate().is_err());
        // scratch is output
        assert!(with_dirs("images", "out", "out").validate().is_err());
        // output is input
        assert!(with_dirs("images", "images", "temp").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_scratch_above_input() {
        let err = with_dirs("work/images", "out", "work").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("overlaps")));
        assert!(with_dirs("/data/photos/in", "/data/out", "/data").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_scratch_inside_input() {
        assert!(with_dirs("images", "out", "images/tmp").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_output_inside_scratch() {
        let err = with_dirs("images", "temp/out", "temp").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("inside scratch_dir")));
    }

    #[test]
    fn test_validate_compares_normalized_paths() {
        assert!(with_dirs("images", "./images", "temp").validate().is_err());
        assert!(with_dirs("images", "out/../images", "temp").validate().is_err());
        assert!(with_dirs("images", "out", "./images/../images").validate().is_err());
        assert!(with_dirs("images", "out", "temp/./x/..").validate().is_ok());
    }

    #[test]
    fn test_validate_allows_siblings_and_output_inside_input() {
        assert!(with_dirs("photos", "photos/compressed", "scratch").validate().is_ok());
        assert!(with_dirs("images2", "out", "images").validate().is_ok());
    }

    #[test]
    fn test_detector_params_are_square_sizes() {
        let mut c = Config::default();
        c.max_size = Some(300);
        let p = c.detector_params();
        assert_eq!(p.min_size, Size::square(30));
        assert_eq!(p.max_size, Some(Size::square(300)));
    }

    #[test]
    fn test_env_overrides() {
        // Only this test touches these variables.
        std::env::set_var("FACEPRESS_JPEG_QUALITY", "25");
        std::env::set_var("FACEPRESS_KEEP_SCRATCH", "1");
        std::env::set_var("FACEPRESS_MIN_NEIGHBORS", "not-a-number");
        let mut c = Config::default();
        c.apply_env();
        std::env::remove_var("FACEPRESS_JPEG_QUALITY");
        std::env::remove_var("FACEPRESS_KEEP_SCRATCH");
        std::env::remove_var("FACEPRESS_MIN_NEIGHBORS");

        assert_eq!(c.jpeg_quality, 25);
        assert!(c.keep_scratch);
        assert_eq!(c.min_neighbors, 5);
    }
}
