//! Per-image candidate production.
//!
//! [`produce_candidate`] is the single path by which a source texture becomes
//! a staged candidate, used identically by the one-pass batch driver and the
//! review session's initial generation:
//!
//! 1. Read dimensions via the codec. Anything over the size policy is copied
//!    through verbatim (`SkippedBySize`) — engines reject oversized skins and
//!    upscaling them further would only waste GPU minutes.
//! 2. Otherwise run the upscaler: TGA sources are pre-converted to PNG (the
//!    upscaler only eats PNG/JPEG), the output is converted back to the
//!    source's format, and TGA outputs are origin-normalized. Any tool or
//!    codec failure demotes the item to `FailedFallback` with the original
//!    bytes as candidate — one broken image never aborts a run.
//! 3. Previews are produced separately by [`make_preview`]; a preview failure
//!    is logged and never changes an item's outcome.
//!
//! With deterministic external tools the whole step is idempotent: same
//! bytes, same preset, same candidate.

use crate::archive::TMP_DIR_NAME;
use crate::codec::{self, CodecError, Dimensions, ImageFormat};
use crate::config::Preset;
use crate::tools::{ToolError, UpscaleBackend};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// How one image left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Candidate is the upscaler's output.
    Upscaled,
    /// Width or height exceeded the policy; candidate is the source verbatim.
    SkippedBySize,
    /// The attempt failed; candidate is the source verbatim and the error
    /// text is retained for the caller.
    FailedFallback { error: String },
}

/// Result of one pipeline pass over one image.
#[derive(Debug)]
pub struct ProcessedItem {
    pub dims: Dimensions,
    pub outcome: Outcome,
}

/// Run counters for one pipeline pass. Owned by the caller and threaded
/// through explicitly; never global, never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub discovered: u32,
    pub upscaled: u32,
    pub skipped_large: u32,
    pub copied_original: u32,
    pub failed: u32,
}

impl Stats {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Upscaled => self.upscaled += 1,
            Outcome::SkippedBySize => {
                self.skipped_large += 1;
                self.copied_original += 1;
            }
            Outcome::FailedFallback { .. } => {
                self.failed += 1;
                self.copied_original += 1;
            }
        }
    }

    /// Human-readable summary lines, printed after a pass completes.
    pub fn format_summary(&self, max_dimension: u32) -> Vec<String> {
        vec![
            format!("Discovered images: {}", self.discovered),
            format!("Upscaled: {}", self.upscaled),
            format!("Skipped by size (> {max_dimension}): {}", self.skipped_large),
            format!("Copied originals: {}", self.copied_original),
            format!("Failed upscales (fell back to original): {}", self.failed),
        ]
    }
}

fn copy_into(src: &Path, dst: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Upscale `src_path` into `staging_dir/<rel_path>` with the given model.
///
/// Scratch files live under `staging_dir/__tmp/` and are removed on success.
/// The final artifact keeps the source's container format, with mandatory
/// origin normalization for TGA — the downstream engine requires bottom-left
/// scan lines, so that step is not skippable.
pub fn upscale_into(
    backend: &dyn UpscaleBackend,
    src_path: &Path,
    rel_path: &str,
    staging_dir: &Path,
    model: &str,
    scale: u32,
) -> Result<(), PipelineError> {
    let rel = Path::new(rel_path);
    let stem = rel
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "texture".to_string());
    let temp_dir = staging_dir
        .join(TMP_DIR_NAME)
        .join(rel.parent().unwrap_or_else(|| Path::new("")));
    std::fs::create_dir_all(&temp_dir)?;

    let format = ImageFormat::from_extension(rel);

    // The upscaler accepts PNG/JPEG input only.
    let mut generated_input = None;
    let upscale_input = if format == Some(ImageFormat::Tga) {
        let input_png = temp_dir.join(format!("{stem}_input.png"));
        backend.convert(src_path, &input_png)?;
        generated_input = Some(input_png.clone());
        input_png
    } else {
        src_path.to_path_buf()
    };

    let upscaled_png = temp_dir.join(format!("{stem}_upscaled.png"));
    backend.upscale(&upscale_input, &upscaled_png, model, scale)?;

    let final_path = staging_dir.join(rel);
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match format {
        Some(ImageFormat::Tga) => {
            backend.convert(&upscaled_png, &final_path)?;
            codec::normalize_origin(&final_path)?;
        }
        Some(ImageFormat::Jpeg) => {
            backend.convert(&upscaled_png, &final_path)?;
        }
        _ => {
            std::fs::copy(&upscaled_png, &final_path)?;
        }
    }

    if let Some(input_png) = generated_input {
        let _ = std::fs::remove_file(input_png);
    }
    let _ = std::fs::remove_file(upscaled_png);
    Ok(())
}

/// Produce the candidate for one image under `candidate_root/<rel_path>`.
///
/// Never fails for tool or codec reasons — those demote the item to
/// [`Outcome::FailedFallback`] with a verbatim copy of the source as the
/// candidate. Only workspace IO errors (the fallback copy itself failing)
/// propagate.
pub fn produce_candidate(
    backend: &dyn UpscaleBackend,
    original: &Path,
    rel_path: &str,
    candidate_root: &Path,
    preset: &Preset,
    max_dimension: u32,
) -> Result<ProcessedItem, PipelineError> {
    let candidate = candidate_root.join(rel_path);

    let dims = match read_source_dimensions(original, rel_path) {
        Ok(dims) => dims,
        Err(err) => {
            copy_into(original, &candidate)?;
            return Ok(ProcessedItem {
                dims: Dimensions {
                    width: 0,
                    height: 0,
                },
                outcome: Outcome::FailedFallback {
                    error: err.to_string(),
                },
            });
        }
    };

    if dims.width > max_dimension || dims.height > max_dimension {
        copy_into(original, &candidate)?;
        return Ok(ProcessedItem {
            dims,
            outcome: Outcome::SkippedBySize,
        });
    }

    match upscale_into(
        backend,
        original,
        rel_path,
        candidate_root,
        &preset.model,
        preset.scale,
    ) {
        Ok(()) => Ok(ProcessedItem {
            dims,
            outcome: Outcome::Upscaled,
        }),
        Err(err) => {
            copy_into(original, &candidate)?;
            Ok(ProcessedItem {
                dims,
                outcome: Outcome::FailedFallback {
                    error: err.to_string(),
                },
            })
        }
    }
}

fn read_source_dimensions(path: &Path, rel_path: &str) -> Result<Dimensions, PipelineError> {
    let format = ImageFormat::from_extension(Path::new(rel_path))
        .ok_or(CodecError::TruncatedHeader("unknown"))?;
    let bytes = std::fs::read(path)?;
    Ok(codec::read_dimensions(&bytes, format)?)
}

/// Produce a browser-displayable PNG preview of `source`.
///
/// PNG sources are copied as-is; everything else goes through the converter.
/// Callers treat failures as cosmetic: the review record keeps its status.
pub fn make_preview(
    backend: &dyn UpscaleBackend,
    source: &Path,
    preview_png: &Path,
) -> Result<(), PipelineError> {
    if let Some(parent) = preview_png.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if ImageFormat::from_extension(source) == Some(ImageFormat::Png) {
        std::fs::copy(source, preview_png)?;
        return Ok(());
    }
    backend.convert(source, preview_png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{png_bytes, tga_bytes};
    use crate::tools::tests::{MockBackend, RecordedOp};
    use tempfile::TempDir;

    fn preset() -> Preset {
        Preset {
            name: "default".to_string(),
            model: "realesrgan-x4plus".to_string(),
            scale: 4,
        }
    }

    fn write_original(dir: &TempDir, rel: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("original").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn oversized_image_skipped_with_verbatim_candidate() {
        let dir = TempDir::new().unwrap();
        let bytes = png_bytes(2048, 2048);
        let original = write_original(&dir, "models/players/s/big.png", &bytes);
        let candidate_root = dir.path().join("candidate");

        let backend = MockBackend::new();
        let item = produce_candidate(
            &backend,
            &original,
            "models/players/s/big.png",
            &candidate_root,
            &preset(),
            1024,
        )
        .unwrap();

        assert_eq!(item.outcome, Outcome::SkippedBySize);
        assert_eq!(item.dims.width, 2048);
        let candidate = candidate_root.join("models/players/s/big.png");
        assert_eq!(std::fs::read(candidate).unwrap(), bytes);
        assert!(backend.get_operations().is_empty(), "no tool invocations");
    }

    #[test]
    fn png_source_upscaled_without_conversion() {
        let dir = TempDir::new().unwrap();
        let original = write_original(&dir, "models/players/s/a.png", &png_bytes(64, 64));
        let candidate_root = dir.path().join("candidate");

        let backend = MockBackend::new();
        let item = produce_candidate(
            &backend,
            &original,
            "models/players/s/a.png",
            &candidate_root,
            &preset(),
            1024,
        )
        .unwrap();

        assert_eq!(item.outcome, Outcome::Upscaled);
        let ops = backend.get_operations();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0],
            RecordedOp::Upscale { model, scale: 4, .. } if model == "realesrgan-x4plus"
        ));
        let candidate = std::fs::read(candidate_root.join("models/players/s/a.png")).unwrap();
        let tag = format!("upscaled:{}:x4:", preset().model);
        assert!(candidate.windows(tag.len()).any(|w| w == tag.as_bytes()));
    }

    #[test]
    fn tga_source_converted_both_ways_and_normalized() {
        let dir = TempDir::new().unwrap();
        let original = write_original(&dir, "models/players/s/a.tga", &tga_bytes(8, 8, false));
        let candidate_root = dir.path().join("candidate");

        let backend = MockBackend::new();
        let item = produce_candidate(
            &backend,
            &original,
            "models/players/s/a.tga",
            &candidate_root,
            &preset(),
            1024,
        )
        .unwrap();

        assert_eq!(item.outcome, Outcome::Upscaled);
        let ops = backend.get_operations();
        // Pre-convert to PNG, upscale, convert back to TGA.
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], RecordedOp::Convert { output, .. } if output.ends_with("_input.png")));
        assert!(matches!(&ops[1], RecordedOp::Upscale { .. }));
        assert!(matches!(&ops[2], RecordedOp::Convert { output, .. } if output.ends_with("a.tga")));
        // Candidate survived normalize_origin, so it parses as a TGA.
        let candidate = std::fs::read(candidate_root.join("models/players/s/a.tga")).unwrap();
        assert_eq!(candidate[2], 2);
    }

    #[test]
    fn scratch_files_removed_after_success() {
        let dir = TempDir::new().unwrap();
        let original = write_original(&dir, "models/players/s/a.tga", &tga_bytes(8, 8, false));
        let candidate_root = dir.path().join("candidate");

        produce_candidate(
            &MockBackend::new(),
            &original,
            "models/players/s/a.tga",
            &candidate_root,
            &preset(),
            1024,
        )
        .unwrap();

        let tmp = candidate_root.join(TMP_DIR_NAME).join("models/players/s");
        let leftovers: Vec<_> = std::fs::read_dir(&tmp)
            .map(|it| it.flatten().collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }

    #[test]
    fn upscaler_failure_falls_back_to_original() {
        let dir = TempDir::new().unwrap();
        let bytes = png_bytes(64, 64);
        let original = write_original(&dir, "models/players/s/a.png", &bytes);
        let candidate_root = dir.path().join("candidate");

        let backend = MockBackend::failing_for("realesrgan-x4plus");
        let item = produce_candidate(
            &backend,
            &original,
            "models/players/s/a.png",
            &candidate_root,
            &preset(),
            1024,
        )
        .unwrap();

        match &item.outcome {
            Outcome::FailedFallback { error } => assert!(error.contains("mock upscale failure")),
            other => panic!("expected FailedFallback, got {other:?}"),
        }
        let candidate = candidate_root.join("models/players/s/a.png");
        assert_eq!(std::fs::read(candidate).unwrap(), bytes);
    }

    #[test]
    fn unreadable_dimensions_fall_back_to_original() {
        let dir = TempDir::new().unwrap();
        let original = write_original(&dir, "models/players/s/a.png", b"not a png");
        let candidate_root = dir.path().join("candidate");

        let backend = MockBackend::new();
        let item = produce_candidate(
            &backend,
            &original,
            "models/players/s/a.png",
            &candidate_root,
            &preset(),
            1024,
        )
        .unwrap();

        assert!(matches!(item.outcome, Outcome::FailedFallback { .. }));
        assert_eq!(item.dims.width, 0);
        assert!(backend.get_operations().is_empty());
    }

    #[test]
    fn preview_copies_png_directly() {
        let dir = TempDir::new().unwrap();
        let bytes = png_bytes(16, 16);
        let source = write_original(&dir, "a.png", &bytes);
        let preview = dir.path().join("preview/a.png.png");

        let backend = MockBackend::new();
        make_preview(&backend, &source, &preview).unwrap();

        assert_eq!(std::fs::read(&preview).unwrap(), bytes);
        assert!(backend.get_operations().is_empty());
    }

    #[test]
    fn preview_converts_tga() {
        let dir = TempDir::new().unwrap();
        let source = write_original(&dir, "a.tga", &tga_bytes(4, 4, false));
        let preview = dir.path().join("preview/a.tga.png");

        let backend = MockBackend::new();
        make_preview(&backend, &source, &preview).unwrap();

        assert_eq!(backend.get_operations().len(), 1);
        assert!(preview.is_file());
    }

    #[test]
    fn stats_counters_track_outcomes() {
        let mut stats = Stats::default();
        stats.discovered = 3;
        stats.record(&Outcome::Upscaled);
        stats.record(&Outcome::SkippedBySize);
        stats.record(&Outcome::FailedFallback {
            error: "x".to_string(),
        });

        assert_eq!(stats.upscaled, 1);
        assert_eq!(stats.skipped_large, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.copied_original, 2);

        let lines = stats.format_summary(1024);
        assert!(lines[0].contains("3"));
        assert!(lines[2].contains("1024"));
    }
}
