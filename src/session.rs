//! The review session: per-image decision state, manifest persistence, and
//! the rerun/finalize operations behind the review UI.
//!
//! ## State machine
//!
//! Each image has a [`ReviewRecord`] whose status toggles freely between
//! `accepted` and `rejected` by operator decision, with one automatic
//! transition: a failed pipeline run (initial or rerun) forces `rejected`,
//! so a broken candidate can never silently ship as accepted. The session
//! itself has a single terminal flag, `finalized`, set by [`ReviewSession::finalize`].
//!
//! ## Concurrency
//!
//! One coarse mutex guards the whole session. Every mutating operation and
//! every state read runs inside it, including the blocking external-tool work
//! of a rerun — atomic replace-artifacts-then-persist beats read availability
//! here, since throughput is bounded by the upscaler, not the lock. There is
//! no per-record locking and no cancellation of an in-flight rerun.
//!
//! ## Persistence
//!
//! Every mutation ends by bumping the revision counter and rewriting the
//! whole manifest — serialize a full snapshot, write to a temp file, rename
//! over the old one, so a concurrent reader never sees a torn manifest. The
//! failure path of a rerun persists too: artifacts already changed on disk,
//! and the manifest must say so even when the logical call reports failure.
//! Resuming reads the prior manifest once and seeds decisions for every
//! identity that still exists; departed items are dropped silently.

use crate::archive::{self, ArchiveError};
use crate::config::Preset;
use crate::pipeline::{self, Outcome, PipelineError, Stats};
use crate::source::SourceImage;
use crate::tools::UpscaleBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub const MANIFEST_VERSION: u32 = 1;

pub const ORIGINAL_DIR: &str = "original";
pub const CANDIDATE_DIR: &str = "candidate";
pub const PREVIEW_ORIGINAL_DIR: &str = "preview/original";
pub const PREVIEW_CANDIDATE_DIR: &str = "preview/candidate";
pub const FINAL_PACKAGE_DIR: &str = "final_package";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unknown image '{0}'")]
    UnknownImage(String),
    #[error("invalid status '{0}'; must be accepted or rejected")]
    InvalidStatus(String),
    #[error("unknown preset '{0}'")]
    UnknownPreset(String),
    #[error("preset model '{0}' is not available")]
    ModelUnavailable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Operator verdict on one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Accepted,
    Rejected,
}

impl ReviewStatus {
    pub fn parse(s: &str) -> Option<ReviewStatus> {
        match s {
            "accepted" => Some(ReviewStatus::Accepted),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Accepted => "accepted",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

/// Review state for one image. Artifact paths are relative to the review
/// root; original/preview-of-original are written once at discovery, while
/// candidate/preview-of-candidate are overwritten by every successful rerun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub rel_path: String,
    pub width: u32,
    pub height: u32,
    pub status: ReviewStatus,
    pub selected_preset: String,
    pub original_path: String,
    pub candidate_path: String,
    pub preview_original_path: String,
    pub preview_candidate_path: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeSummary {
    pub output_pk3: String,
    pub packaged_files: usize,
    pub summary: Summary,
}

/// The serialized session: sole source of truth for resuming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub output_pk3: String,
    pub presets: Vec<Preset>,
    pub revision: u64,
    pub summary: Summary,
    pub finalized: bool,
    pub finalize_summary: Option<FinalizeSummary>,
    pub images: Vec<ReviewRecord>,
}

/// Result payload of a successful rerun.
#[derive(Debug, Clone, Serialize)]
pub struct RerunOutcome {
    pub summary: Summary,
    pub rel_path: String,
    pub selected_preset: String,
}

/// Decision fields salvaged from a prior manifest.
#[derive(Debug, Clone)]
pub struct PriorDecision {
    pub status: ReviewStatus,
    pub selected_preset: String,
}

/// Load prior decisions from a manifest file, keyed by identity.
///
/// Deliberately tolerant: a missing, unreadable, or garbled manifest yields
/// an empty map, and individual entries with malformed fields are skipped.
/// Resume must never be blocked by a damaged file from a crashed run.
pub fn load_prior_decisions(manifest_path: &Path) -> BTreeMap<String, PriorDecision> {
    let mut out = BTreeMap::new();
    let Ok(text) = std::fs::read_to_string(manifest_path) else {
        return out;
    };
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
        return out;
    };
    let Some(images) = payload.get("images").and_then(|v| v.as_array()) else {
        return out;
    };
    for item in images {
        let Some(rel_path) = item.get("rel_path").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(status) = item
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(ReviewStatus::parse)
        else {
            continue;
        };
        let Some(preset) = item.get("selected_preset").and_then(|v| v.as_str()) else {
            continue;
        };
        out.insert(
            rel_path.to_string(),
            PriorDecision {
                status,
                selected_preset: preset.to_string(),
            },
        );
    }
    out
}

fn preview_rel(rel_path: &str) -> String {
    format!("{rel_path}.png")
}

/// Build review records for the current discovery set, running the pipeline
/// once per image and seeding decisions from `prior`.
///
/// Seeding is keyed by identity intersection: an item present in both the
/// prior manifest and the current set inherits its status and preset, but
/// only if that preset is still configured — otherwise (and for new items)
/// it defaults to the first preset and `accepted`. Prior items absent from
/// the current set are dropped.
pub fn prepare_records(
    backend: &dyn UpscaleBackend,
    images: &[SourceImage],
    review_root: &Path,
    prior: &BTreeMap<String, PriorDecision>,
    presets: &[Preset],
    max_dimension: u32,
) -> Result<(BTreeMap<String, ReviewRecord>, Stats), SessionError> {
    let mut records = BTreeMap::new();
    let mut stats = Stats::default();
    let default_preset = &presets[0];

    for image in images {
        stats.discovered += 1;

        let original = review_root.join(ORIGINAL_DIR).join(&image.rel_path);
        if let Some(parent) = original.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&original, &image.bytes)?;

        let (mut status, selected_preset) = match prior.get(&image.rel_path) {
            Some(p) if presets.iter().any(|cp| cp.name == p.selected_preset) => {
                (p.status, p.selected_preset.clone())
            }
            _ => (ReviewStatus::Accepted, default_preset.name.clone()),
        };
        let preset = presets
            .iter()
            .find(|p| p.name == selected_preset)
            .expect("selected preset validated against configured list");

        let candidate_root = review_root.join(CANDIDATE_DIR);
        let item = pipeline::produce_candidate(
            backend,
            &original,
            &image.rel_path,
            &candidate_root,
            preset,
            max_dimension,
        )?;
        stats.record(&item.outcome);

        let mut last_error = None;
        if let Outcome::FailedFallback { error } = &item.outcome {
            status = ReviewStatus::Rejected;
            last_error = Some(error.clone());
            tracing::warn!(
                rel_path = %image.rel_path,
                error = %error,
                "initial upscale failed; candidate falls back to original"
            );
        }

        let preview = preview_rel(&image.rel_path);
        let preview_original = review_root.join(PREVIEW_ORIGINAL_DIR).join(&preview);
        let preview_candidate = review_root.join(PREVIEW_CANDIDATE_DIR).join(&preview);
        if let Err(err) = pipeline::make_preview(backend, &original, &preview_original) {
            tracing::warn!(rel_path = %image.rel_path, error = %err, "original preview failed");
        }
        let candidate = candidate_root.join(&image.rel_path);
        if let Err(err) = pipeline::make_preview(backend, &candidate, &preview_candidate) {
            tracing::warn!(rel_path = %image.rel_path, error = %err, "candidate preview failed");
        }

        records.insert(
            image.rel_path.clone(),
            ReviewRecord {
                rel_path: image.rel_path.clone(),
                width: item.dims.width,
                height: item.dims.height,
                status,
                selected_preset,
                original_path: format!("{ORIGINAL_DIR}/{}", image.rel_path),
                candidate_path: format!("{CANDIDATE_DIR}/{}", image.rel_path),
                preview_original_path: format!("{PREVIEW_ORIGINAL_DIR}/{preview}"),
                preview_candidate_path: format!("{PREVIEW_CANDIDATE_DIR}/{preview}"),
                last_error,
            },
        );
    }

    Ok((records, stats))
}

struct SessionState {
    presets: Vec<Preset>,
    records: BTreeMap<String, ReviewRecord>,
    revision: u64,
    finalized: bool,
    finalize_summary: Option<FinalizeSummary>,
}

impl SessionState {
    fn summary(&self) -> Summary {
        let accepted = self
            .records
            .values()
            .filter(|r| r.status == ReviewStatus::Accepted)
            .count();
        Summary {
            total: self.records.len(),
            accepted,
            rejected: self.records.len() - accepted,
        }
    }

    fn manifest(&self, output_pk3: &Path) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            output_pk3: output_pk3.display().to_string(),
            presets: self.presets.clone(),
            revision: self.revision,
            summary: self.summary(),
            finalized: self.finalized,
            finalize_summary: self.finalize_summary.clone(),
            // BTreeMap iteration gives the identity-sorted order the
            // manifest promises.
            images: self.records.values().cloned().collect(),
        }
    }
}

/// A live review session. All mutation and all state reads go through the
/// single internal lock; see the module docs for the concurrency contract.
pub struct ReviewSession {
    review_root: PathBuf,
    manifest_path: PathBuf,
    output_pk3: PathBuf,
    backend: Box<dyn UpscaleBackend>,
    state: Mutex<SessionState>,
}

impl ReviewSession {
    pub fn new(
        backend: Box<dyn UpscaleBackend>,
        review_root: PathBuf,
        manifest_path: PathBuf,
        output_pk3: PathBuf,
        presets: Vec<Preset>,
        records: BTreeMap<String, ReviewRecord>,
    ) -> ReviewSession {
        ReviewSession {
            review_root,
            manifest_path,
            output_pk3,
            backend,
            state: Mutex::new(SessionState {
                presets,
                records,
                revision: 0,
                finalized: false,
                finalize_summary: None,
            }),
        }
    }

    pub fn review_root(&self) -> &Path {
        &self.review_root
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Full state snapshot at the current revision. Safe to poll.
    pub fn snapshot(&self) -> Manifest {
        let state = self.state.lock().expect("session lock poisoned");
        state.manifest(&self.output_pk3)
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().expect("session lock poisoned").finalized
    }

    pub fn finalize_summary(&self) -> Option<FinalizeSummary> {
        self.state
            .lock()
            .expect("session lock poisoned")
            .finalize_summary
            .clone()
    }

    /// Persist the current state. Used once after construction so a session
    /// that crashes before any operator action can still be resumed.
    pub fn persist(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().expect("session lock poisoned");
        self.save_manifest_locked(&mut state)
    }

    /// Record an operator decision for one image.
    pub fn decide(&self, rel_path: &str, status: &str) -> Result<Summary, SessionError> {
        let status =
            ReviewStatus::parse(status).ok_or_else(|| SessionError::InvalidStatus(status.into()))?;
        let mut state = self.state.lock().expect("session lock poisoned");
        let record = state
            .records
            .get_mut(rel_path)
            .ok_or_else(|| SessionError::UnknownImage(rel_path.to_string()))?;
        record.status = status;
        self.save_manifest_locked(&mut state)?;
        Ok(state.summary())
    }

    /// Re-run the pipeline for one image with the requested preset.
    ///
    /// Runs entirely inside the session lock, external tools included.
    /// Success overwrites the candidate and its preview, selects the preset,
    /// clears `last_error`, and moves the record to `accepted`. Failure
    /// restores the pre-call status, records the error, and still persists —
    /// artifacts may already have changed on disk — before re-surfacing the
    /// error to the caller.
    pub fn rerun(&self, rel_path: &str, preset_name: &str) -> Result<RerunOutcome, SessionError> {
        let mut state = self.state.lock().expect("session lock poisoned");

        let (original_path, preview_candidate_path, previous_status) = {
            let record = state
                .records
                .get(rel_path)
                .ok_or_else(|| SessionError::UnknownImage(rel_path.to_string()))?;
            (
                record.original_path.clone(),
                record.preview_candidate_path.clone(),
                record.status,
            )
        };
        let preset = state
            .presets
            .iter()
            .find(|p| p.name == preset_name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownPreset(preset_name.to_string()))?;
        if !self.backend.has_model(&preset.model) {
            return Err(SessionError::ModelUnavailable(preset.model));
        }

        let original = self.review_root.join(&original_path);
        let candidate_root = self.review_root.join(CANDIDATE_DIR);
        let preview_candidate = self.review_root.join(&preview_candidate_path);

        let attempt = pipeline::upscale_into(
            self.backend.as_ref(),
            &original,
            rel_path,
            &candidate_root,
            &preset.model,
            preset.scale,
        )
        .and_then(|()| {
            pipeline::make_preview(
                self.backend.as_ref(),
                &candidate_root.join(rel_path),
                &preview_candidate,
            )
        });

        let record = state
            .records
            .get_mut(rel_path)
            .expect("record existence checked above");
        match attempt {
            Ok(()) => {
                record.selected_preset = preset.name.clone();
                record.status = ReviewStatus::Accepted;
                record.last_error = None;
                self.save_manifest_locked(&mut state)?;
                Ok(RerunOutcome {
                    summary: state.summary(),
                    rel_path: rel_path.to_string(),
                    selected_preset: preset.name,
                })
            }
            Err(err) => {
                record.status = previous_status;
                record.last_error = Some(err.to_string());
                self.save_manifest_locked(&mut state)?;
                Err(err.into())
            }
        }
    }

    /// Materialize the output PK3 from current decisions.
    ///
    /// Idempotent and repeatable: each call rebuilds the package tree from
    /// scratch (stale trees are discarded first), choosing the candidate for
    /// accepted images and the original for rejected ones.
    pub fn finalize(&self) -> Result<FinalizeSummary, SessionError> {
        let mut state = self.state.lock().expect("session lock poisoned");

        let final_root = self.review_root.join(FINAL_PACKAGE_DIR);
        if final_root.exists() {
            std::fs::remove_dir_all(&final_root)?;
        }
        std::fs::create_dir_all(&final_root)?;

        let mut copied = 0;
        for (rel_path, record) in &state.records {
            let selected = match record.status {
                ReviewStatus::Accepted => &record.candidate_path,
                ReviewStatus::Rejected => &record.original_path,
            };
            let dst = final_root.join(rel_path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(self.review_root.join(selected), &dst)?;
            copied += 1;
        }

        archive::package_tree(&final_root, &self.output_pk3)?;

        state.finalized = true;
        let summary = FinalizeSummary {
            output_pk3: self.output_pk3.display().to_string(),
            packaged_files: copied,
            summary: state.summary(),
        };
        state.finalize_summary = Some(summary.clone());
        self.save_manifest_locked(&mut state)?;
        Ok(summary)
    }

    /// Bump the revision and atomically replace the manifest file with a
    /// full snapshot. Write-then-rename keeps concurrent readers from ever
    /// observing a partially written manifest.
    fn save_manifest_locked(&self, state: &mut SessionState) -> Result<(), SessionError> {
        state.revision += 1;
        let manifest = state.manifest(&self.output_pk3);
        let json = serde_json::to_string_pretty(&manifest)?;
        if let Some(parent) = self.manifest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.manifest_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.manifest_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::png_bytes;
    use crate::tools::tests::MockBackend;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn presets() -> Vec<Preset> {
        vec![
            Preset {
                name: "default".to_string(),
                model: "model-a".to_string(),
                scale: 4,
            },
            Preset {
                name: "alt".to_string(),
                model: "model-b".to_string(),
                scale: 2,
            },
        ]
    }

    fn images() -> Vec<SourceImage> {
        vec![
            SourceImage {
                rel_path: "models/players/sarge/body.png".to_string(),
                bytes: png_bytes(64, 64),
            },
            SourceImage {
                rel_path: "models/players/sarge/head.png".to_string(),
                bytes: png_bytes(32, 32),
            },
        ]
    }

    fn build_session(backend: MockBackend, dir: &TempDir) -> ReviewSession {
        let review_root = dir.path().join("review");
        let (records, _stats) = prepare_records(
            &backend,
            &images(),
            &review_root,
            &BTreeMap::new(),
            &presets(),
            1024,
        )
        .unwrap();
        let session = ReviewSession::new(
            Box::new(backend),
            review_root.clone(),
            review_root.join("manifest.json"),
            dir.path().join("out/z_mod_upscaled_skins.pk3"),
            presets(),
            records,
        );
        session.persist().unwrap();
        session
    }

    fn read_manifest(session: &ReviewSession) -> Manifest {
        let text = std::fs::read_to_string(session.manifest_path()).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn prepare_defaults_to_first_preset_accepted() {
        let dir = TempDir::new().unwrap();
        let session = build_session(MockBackend::new(), &dir);

        let manifest = session.snapshot();
        assert_eq!(manifest.images.len(), 2);
        for record in &manifest.images {
            assert_eq!(record.status, ReviewStatus::Accepted);
            assert_eq!(record.selected_preset, "default");
            assert_eq!(record.last_error, None);
        }
        // Sorted by identity.
        assert_eq!(manifest.images[0].rel_path, "models/players/sarge/body.png");
        assert!(
            session
                .review_root()
                .join(&manifest.images[0].candidate_path)
                .is_file()
        );
        assert!(
            session
                .review_root()
                .join(&manifest.images[0].preview_candidate_path)
                .is_file()
        );
    }

    #[test]
    fn prepare_size_skip_keeps_status_and_copies_source() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::new();
        let review_root = dir.path().join("review");
        let imgs = vec![SourceImage {
            rel_path: "models/players/s/big.png".to_string(),
            bytes: png_bytes(2048, 2048),
        }];

        let (records, stats) = prepare_records(
            &backend,
            &imgs,
            &review_root,
            &BTreeMap::new(),
            &presets(),
            1024,
        )
        .unwrap();

        assert_eq!(stats.skipped_large, 1);
        let record = &records["models/players/s/big.png"];
        assert_eq!(record.status, ReviewStatus::Accepted);
        assert_eq!(record.width, 2048);
        assert_eq!(record.last_error, None);
        let candidate = std::fs::read(review_root.join(&record.candidate_path)).unwrap();
        assert_eq!(candidate, png_bytes(2048, 2048));
    }

    #[test]
    fn prepare_failure_rejects_with_error() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend::failing_for("model-a");
        let review_root = dir.path().join("review");

        let (records, stats) = prepare_records(
            &backend,
            &images(),
            &review_root,
            &BTreeMap::new(),
            &presets(),
            1024,
        )
        .unwrap();

        assert_eq!(stats.failed, 2);
        for record in records.values() {
            assert_eq!(record.status, ReviewStatus::Rejected);
            assert!(record.last_error.as_deref().unwrap().contains("mock"));
            // Fallback candidate is the original, byte for byte.
            let original = std::fs::read(review_root.join(&record.original_path)).unwrap();
            let candidate = std::fs::read(review_root.join(&record.candidate_path)).unwrap();
            assert_eq!(original, candidate);
        }
    }

    #[test]
    fn decide_toggles_and_persists() {
        let dir = TempDir::new().unwrap();
        let session = build_session(MockBackend::new(), &dir);
        let rev_before = session.snapshot().revision;

        let summary = session
            .decide("models/players/sarge/head.png", "rejected")
            .unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 1);

        let manifest = read_manifest(&session);
        assert_eq!(manifest.revision, rev_before + 1);
        let head = manifest
            .images
            .iter()
            .find(|r| r.rel_path.ends_with("head.png"))
            .unwrap();
        assert_eq!(head.status, ReviewStatus::Rejected);

        // Toggle back.
        session
            .decide("models/players/sarge/head.png", "accepted")
            .unwrap();
        assert_eq!(session.snapshot().summary.accepted, 2);
    }

    #[test]
    fn decide_rejects_unknown_identity_and_status() {
        let dir = TempDir::new().unwrap();
        let session = build_session(MockBackend::new(), &dir);
        let rev_before = session.snapshot().revision;

        assert!(matches!(
            session.decide("models/players/ghost.png", "accepted"),
            Err(SessionError::UnknownImage(_))
        ));
        assert!(matches!(
            session.decide("models/players/sarge/head.png", "maybe"),
            Err(SessionError::InvalidStatus(_))
        ));
        // Failed validation must not persist anything.
        assert_eq!(read_manifest(&session).revision, rev_before);
    }

    #[test]
    fn rerun_success_updates_record_and_artifacts() {
        let dir = TempDir::new().unwrap();
        let session = build_session(MockBackend::new(), &dir);
        session
            .decide("models/players/sarge/head.png", "rejected")
            .unwrap();

        let outcome = session
            .rerun("models/players/sarge/head.png", "alt")
            .unwrap();
        assert_eq!(outcome.selected_preset, "alt");
        assert_eq!(outcome.summary.accepted, 2);

        let manifest = session.snapshot();
        let head = manifest
            .images
            .iter()
            .find(|r| r.rel_path.ends_with("head.png"))
            .unwrap();
        assert_eq!(head.status, ReviewStatus::Accepted);
        assert_eq!(head.selected_preset, "alt");
        assert_eq!(head.last_error, None);

        // New candidate carries the alt preset's model tag.
        let candidate = std::fs::read(session.review_root().join(&head.candidate_path)).unwrap();
        let tag = b"upscaled:model-b:x2:";
        assert!(candidate.windows(tag.len()).any(|w| w == tag));
    }

    #[test]
    fn rerun_failure_reverts_status_keeps_artifacts_and_persists() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend {
            failing_models: HashSet::from(["model-b".to_string()]),
            ..MockBackend::default()
        };
        let session = build_session(backend, &dir);

        let rel = "models/players/sarge/head.png";
        let record_before = session
            .snapshot()
            .images
            .iter()
            .find(|r| r.rel_path == rel)
            .cloned()
            .unwrap();
        let candidate_path = session.review_root().join(&record_before.candidate_path);
        let preview_path = session
            .review_root()
            .join(&record_before.preview_candidate_path);
        let candidate_before = std::fs::read(&candidate_path).unwrap();
        let preview_before = std::fs::read(&preview_path).unwrap();
        let rev_before = session.snapshot().revision;

        let err = session.rerun(rel, "alt").unwrap_err();
        assert!(matches!(err, SessionError::Pipeline(_)));

        let manifest = read_manifest(&session);
        // The failure itself was persisted.
        assert_eq!(manifest.revision, rev_before + 1);
        let record = manifest
            .images
            .iter()
            .find(|r| r.rel_path == rel)
            .unwrap();
        assert_eq!(record.status, record_before.status, "status reverted");
        assert_eq!(record.selected_preset, "default", "preset unchanged");
        assert!(record.last_error.as_deref().unwrap().contains("mock"));

        // Prior artifacts intact.
        assert_eq!(std::fs::read(&candidate_path).unwrap(), candidate_before);
        assert_eq!(std::fs::read(&preview_path).unwrap(), preview_before);

        // A later successful rerun clears the error and overwrites both.
        session.rerun(rel, "default").unwrap();
        let record = session
            .snapshot()
            .images
            .iter()
            .find(|r| r.rel_path == rel)
            .cloned()
            .unwrap();
        assert_eq!(record.last_error, None);
        assert_eq!(record.status, ReviewStatus::Accepted);
    }

    #[test]
    fn rerun_validation_errors_do_not_persist() {
        let dir = TempDir::new().unwrap();
        let backend = MockBackend {
            installed_models: HashSet::from(["model-a".to_string()]),
            ..MockBackend::default()
        };
        let session = build_session(backend, &dir);
        let rev_before = read_manifest(&session).revision;

        assert!(matches!(
            session.rerun("models/players/ghost.png", "default"),
            Err(SessionError::UnknownImage(_))
        ));
        assert!(matches!(
            session.rerun("models/players/sarge/head.png", "nope"),
            Err(SessionError::UnknownPreset(_))
        ));
        assert!(matches!(
            session.rerun("models/players/sarge/head.png", "alt"),
            Err(SessionError::ModelUnavailable(_))
        ));
        assert_eq!(read_manifest(&session).revision, rev_before);
    }

    #[test]
    fn finalize_selects_by_status_and_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let session = build_session(MockBackend::new(), &dir);
        session
            .decide("models/players/sarge/head.png", "rejected")
            .unwrap();

        let first = session.finalize().unwrap();
        assert_eq!(first.packaged_files, 2);
        assert!(session.is_finalized());
        let pk3_path = std::path::PathBuf::from(&first.output_pk3);
        let first_bytes = std::fs::read(&pk3_path).unwrap();

        let entries = archive::read_matching(&pk3_path, |_| true).unwrap();
        let by_name: BTreeMap<&str, &[u8]> = entries
            .iter()
            .map(|(n, b)| (n.as_str(), b.as_slice()))
            .collect();
        // Rejected image ships the original; accepted ships the candidate.
        assert_eq!(
            by_name["models/players/sarge/head.png"],
            &png_bytes(32, 32)[..]
        );
        let body = by_name["models/players/sarge/body.png"];
        assert!(body.windows(9).any(|w| w == b"upscaled:"));

        // No intervening decisions: identical output.
        let second = session.finalize().unwrap();
        assert_eq!(second.packaged_files, 2);
        assert_eq!(std::fs::read(&pk3_path).unwrap(), first_bytes);

        let manifest = read_manifest(&session);
        assert!(manifest.finalized);
        assert_eq!(manifest.finalize_summary.unwrap().packaged_files, 2);
    }

    #[test]
    fn resume_seeds_intersection_and_drops_departed() {
        let dir = TempDir::new().unwrap();
        let session = build_session(MockBackend::new(), &dir);
        session
            .decide("models/players/sarge/head.png", "rejected")
            .unwrap();
        session.rerun("models/players/sarge/body.png", "alt").unwrap();

        let prior = load_prior_decisions(session.manifest_path());
        assert_eq!(prior.len(), 2);

        // Second pass discovers head plus a brand-new image; body is gone.
        let second_pass = vec![
            SourceImage {
                rel_path: "models/players/sarge/head.png".to_string(),
                bytes: png_bytes(32, 32),
            },
            SourceImage {
                rel_path: "models/players/sarge/new.png".to_string(),
                bytes: png_bytes(16, 16),
            },
        ];
        let review_root = dir.path().join("review2");
        let (records, _) = prepare_records(
            &MockBackend::new(),
            &second_pass,
            &review_root,
            &prior,
            &presets(),
            1024,
        )
        .unwrap();

        assert_eq!(records.len(), 2);
        assert!(!records.contains_key("models/players/sarge/body.png"));
        assert_eq!(
            records["models/players/sarge/head.png"].status,
            ReviewStatus::Rejected
        );
        assert_eq!(
            records["models/players/sarge/new.png"].status,
            ReviewStatus::Accepted
        );
        assert_eq!(records["models/players/sarge/new.png"].selected_preset, "default");
    }

    #[test]
    fn resume_falls_back_when_preset_no_longer_configured() {
        let dir = TempDir::new().unwrap();
        let prior = BTreeMap::from([(
            "models/players/sarge/head.png".to_string(),
            PriorDecision {
                status: ReviewStatus::Rejected,
                selected_preset: "retired-preset".to_string(),
            },
        )]);

        let (records, _) = prepare_records(
            &MockBackend::new(),
            &images(),
            &dir.path().join("review"),
            &prior,
            &presets(),
            1024,
        )
        .unwrap();

        let head = &records["models/players/sarge/head.png"];
        assert_eq!(head.selected_preset, "default");
        assert_eq!(head.status, ReviewStatus::Accepted);
    }

    #[test]
    fn prior_decisions_tolerate_garbage_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");

        assert!(load_prior_decisions(&path).is_empty());

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load_prior_decisions(&path).is_empty());

        std::fs::write(
            &path,
            serde_json::json!({
                "images": [
                    {"rel_path": "a.png", "status": "weird", "selected_preset": "p"},
                    {"rel_path": "b.png", "status": "rejected", "selected_preset": "p"},
                    {"status": "accepted", "selected_preset": "p"},
                ]
            })
            .to_string(),
        )
        .unwrap();
        let prior = load_prior_decisions(&path);
        assert_eq!(prior.len(), 1);
        assert_eq!(prior["b.png"].status, ReviewStatus::Rejected);
    }
}
