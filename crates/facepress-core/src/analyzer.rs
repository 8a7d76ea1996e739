//! Post-run file size comparison between original, fully compressed and
//! face-preserving versions of each image. Read-only.

use crate::pipeline::list_files;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("failed to list {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot stat {role} file {path}: {source}")]
    Stat {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sizes of the three variants of one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeReport {
    pub name: String,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub composite_bytes: u64,
}

impl SizeReport {
    /// Size change of the fully compressed artifact, as % of the original.
    pub fn compressed_delta_pct(&self) -> f64 {
        self.delta_pct(self.compressed_bytes)
    }

    /// Size change of the face-preserving composite, as % of the original.
    pub fn composite_delta_pct(&self) -> f64 {
        self.delta_pct(self.composite_bytes)
    }

    /// How far apart the two deltas are, in points of the original size.
    pub fn difference_pct(&self) -> f64 {
        self.compressed_delta_pct() - self.composite_delta_pct()
    }

    fn delta_pct(&self, bytes: u64) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        100.0 * (bytes as f64 - self.original_bytes as f64) / self.original_bytes as f64
    }
}

/// Reports for every image of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SizeAnalysis {
    pub reports: Vec<SizeReport>,
}

impl SizeAnalysis {
    pub fn mean_difference_pct(&self) -> Option<f64> {
        if self.reports.is_empty() {
            return None;
        }
        let total: f64 = self.reports.iter().map(SizeReport::difference_pct).sum();
        Some(total / self.reports.len() as f64)
    }
}

impl fmt::Display for SizeAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "percent diff values:")?;
        for r in &self.reports {
            writeln!(f, "{}", r.name)?;
            writeln!(
                f,
                "  compressed: {:+.1}%  composite: {:+.1}%",
                r.compressed_delta_pct(),
                r.composite_delta_pct()
            )?;
            writeln!(f, "Percent diff: {:.1}", r.difference_pct())?;
            writeln!(f)?;
        }
        if let Some(mean) = self.mean_difference_pct() {
            writeln!(f, "Mean percent diff: {mean:.1}")?;
        }
        Ok(())
    }
}

/// Compare sizes for every file in `output_dir` against its namesakes in
/// `input_dir` and `scratch_dir`.
pub fn analyze(
    input_dir: &Path,
    scratch_dir: &Path,
    output_dir: &Path,
) -> Result<SizeAnalysis, AnalyzerError> {
    let outputs = list_files(output_dir).map_err(|source| AnalyzerError::ListDir {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let mut reports = Vec::with_capacity(outputs.len());
    for output in outputs {
        let Some(name) = output.file_name() else {
            continue;
        };
        let report = SizeReport {
            name: name.to_string_lossy().into_owned(),
            original_bytes: file_len("original", &input_dir.join(name))?,
            compressed_bytes: file_len("compressed", &scratch_dir.join(name))?,
            composite_bytes: file_len("composite", &output)?,
        };
        tracing::debug!(
            name = %report.name,
            original = report.original_bytes,
            compressed = report.compressed_bytes,
            composite = report.composite_bytes,
            "size report"
        );
        reports.push(report);
    }

    Ok(SizeAnalysis { reports })
}

fn file_len(role: &'static str, path: &Path) -> Result<u64, AnalyzerError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|source| AnalyzerError::Stat {
            role,
            path: path.to_path_buf(),
            source,
        })
}
