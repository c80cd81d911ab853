//! # texup
//!
//! Batch texture upscaler for id-tech mods. Point it at a game root, pick a
//! mod, and every `models/players/**` texture is run through Real-ESRGAN and
//! repackaged as a load-last PK3 override — either in one non-interactive
//! pass, or through a local web UI where each image is accepted, rejected, or
//! re-run with a different preset before anything ships.
//!
//! # Architecture
//!
//! ```text
//! batch ─┐
//!        ├─▶ pipeline ─▶ codec
//! session┘      │
//!    ▲          └─▶ tools (external upscaler/converter)
//!    │
//! server (HTTP review UI)
//! ```
//!
//! The batch driver and the review session are the two consumers of the item
//! pipeline; the pipeline consumes the codec for dimension checks and TGA
//! origin normalization, and the tools layer for external processes. The
//! server is a thin transport over the session. Nothing reaches back down.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`codec`] | Binary image parsing: PNG/JPEG dimensions, full TGA decode and origin normalization |
//! | [`source`] | Source resolution (PK3 or directory) and player-texture discovery |
//! | [`archive`] | Deterministic PK3 (zip) packaging and reading |
//! | [`tools`] | External tool invocation behind the `UpscaleBackend` trait, with hard timeouts |
//! | [`config`] | Preset parsing, stock preset list, startup validation |
//! | [`pipeline`] | Per-image candidate production: size policy, format round-trip, fallback on failure |
//! | [`session`] | Review state machine: persisted manifest, decisions, reruns, finalize, resume |
//! | [`server`] | axum transport translating HTTP/JSON into session calls |
//! | [`batch`] | The one-pass non-interactive driver |
//!
//! # Design Decisions
//!
//! ## Crash tolerance over throughput
//!
//! Review mode exists because upscaled player skins are frequently worse than
//! the original (flat-color Quake-era textures upscale badly), so a human
//! pass is the norm, and a human pass over hundreds of images takes longer
//! than any process should be trusted to stay alive. The session therefore
//! persists its full manifest after every mutation via atomic
//! write-then-rename, and resuming is just re-running the same command: prior
//! decisions are re-seeded for every image that still exists.
//!
//! ## One coarse lock
//!
//! All session operations, including the blocking external-tool work of a
//! rerun, serialize through a single mutex. Fine-grained locking would buy
//! nothing: write throughput is bounded by GPU inference latency, and the
//! operator is the only client.
//!
//! ## Hand-rolled TGA codec
//!
//! The engine requires TGA files with bottom-left origin; ImageMagick writes
//! top-left. Rather than depend on a full image stack for one header fixup,
//! [`codec`] implements the TGA container directly (including RLE decode) and
//! rewrites files in place, preserving every byte it does not understand.

pub mod archive;
pub mod batch;
pub mod codec;
pub mod config;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod source;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_helpers;
