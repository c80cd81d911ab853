//! Non-interactive one-pass driver.
//!
//! Runs the pipeline over every discovered image with the single configured
//! preset, assembles the results in a staging tree, and packages the PK3.
//! There is no persisted state and no resume: a re-invocation starts from
//! scratch. Per-item failures fall back to the original and are logged; they
//! never abort the pass.

use crate::archive::{self, ArchiveError};
use crate::config::Preset;
use crate::pipeline::{self, Outcome, PipelineError, Stats};
use crate::source::SourceImage;
use crate::tools::UpscaleBackend;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub stats: Stats,
    pub packaged_files: usize,
}

/// Process every image and package the staging tree into `output_pk3`.
///
/// `work_dir` receives a `raw/` copy of each source image and a `staging/`
/// tree of candidates; the caller owns work-dir lifecycle (creation was done
/// here, deletion is a cleanup policy decision).
pub fn run(
    backend: &dyn UpscaleBackend,
    images: &[SourceImage],
    work_dir: &Path,
    output_pk3: &Path,
    preset: &Preset,
    max_dimension: u32,
) -> Result<BatchOutcome, BatchError> {
    let raw_root = work_dir.join("raw");
    let staging_root = work_dir.join("staging");
    std::fs::create_dir_all(&raw_root)?;
    std::fs::create_dir_all(&staging_root)?;

    let mut stats = Stats::default();
    for image in images {
        stats.discovered += 1;

        let raw_path = raw_root.join(&image.rel_path);
        if let Some(parent) = raw_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&raw_path, &image.bytes)?;

        let item = pipeline::produce_candidate(
            backend,
            &raw_path,
            &image.rel_path,
            &staging_root,
            preset,
            max_dimension,
        )?;
        stats.record(&item.outcome);
        match &item.outcome {
            Outcome::Upscaled => {
                tracing::debug!(rel_path = %image.rel_path, "upscaled");
            }
            Outcome::SkippedBySize => {
                tracing::debug!(
                    rel_path = %image.rel_path,
                    width = item.dims.width,
                    height = item.dims.height,
                    "skipped by size, copied original"
                );
            }
            Outcome::FailedFallback { error } => {
                tracing::warn!(
                    rel_path = %image.rel_path,
                    error = %error,
                    "upscale failed, copied original"
                );
            }
        }
    }

    let packaged_files = archive::package_tree(&staging_root, output_pk3)?;
    Ok(BatchOutcome {
        stats,
        packaged_files,
    })
}
