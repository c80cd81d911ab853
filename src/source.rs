//! Source resolution and image discovery.
//!
//! A run needs exactly one source of player textures for the selected mod:
//! either a PK3 archive or a plain directory tree. Resolution walks a fixed
//! candidate order — explicit `--source-pk3`, the canonical `z_<mod>.pk3` in
//! the dist directory, any other `z_*.pk3` there, explicit `--source-dir`,
//! then `mods/<mod>` — and takes the first candidate that exists. Failing
//! all of them is fatal, with the error listing mods that would have worked.
//!
//! Discovery then yields every `models/players/**` image (`.tga`, `.png`,
//! `.jpg`, `.jpeg`) as an owned `(relative path, bytes)` pair, so the rest of
//! the pipeline never cares which source kind it came from.

use crate::archive::{self, ArchiveError};
use crate::codec::ImageFormat;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Engine-relative directory that holds player skins.
const PLAYERS_PREFIX: &str = "models/players/";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(
        "could not resolve a valid source for mod '{mod_name}'; checked --source-pk3, dist PK3s, \
         --source-dir, and mods/{mod_name}; available mod candidates: {available}"
    )]
    NotFound { mod_name: String, available: String },
    #[error("no reviewable images found under {PLAYERS_PREFIX} in the selected source")]
    NoImages,
}

/// What kind of source a run reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pk3,
    Dir,
}

/// A resolved texture source.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub path: PathBuf,
}

/// One discovered image: identity plus owned input bytes.
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Relative path within the source, forward slashes. Unique per run.
    pub rel_path: String,
    pub bytes: Vec<u8>,
}

fn is_texture_path(rel: &str) -> bool {
    rel.to_ascii_lowercase().starts_with(PLAYERS_PREFIX)
        && ImageFormat::from_extension(Path::new(rel)).is_some()
}

/// Mods that have either a source directory or a dist PK3 — used to make the
/// resolution error actionable.
pub fn find_available_mods(root_dir: &Path) -> Vec<String> {
    let mut mods = std::collections::BTreeSet::new();

    let mods_root = root_dir.join("mods");
    if let Ok(entries) = std::fs::read_dir(&mods_root) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                mods.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }

    let dist_root = root_dir.join("dist");
    if let Ok(entries) = std::fs::read_dir(&dist_root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let has_pk3 = path.join(format!("z_{name}.pk3")).exists()
                || list_dist_pk3s(&path).next().is_some();
            if has_pk3 {
                mods.insert(name);
            }
        }
    }

    mods.into_iter().collect()
}

fn list_dist_pk3s(dir: &Path) -> impl Iterator<Item = PathBuf> {
    let mut pk3s: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("z_") && n.ends_with(".pk3"))
        })
        .collect();
    pk3s.sort();
    pk3s.into_iter()
}

/// Resolve the texture source for `mod_name` under `root_dir`.
pub fn resolve_source(
    root_dir: &Path,
    mod_name: &str,
    source_pk3: Option<&Path>,
    source_dir: Option<&Path>,
) -> Result<SourceSpec, SourceError> {
    let dist_dir = root_dir.join("dist").join(mod_name);
    let mod_dir = root_dir.join("mods").join(mod_name);
    let canonical_pk3 = dist_dir.join(format!("z_{mod_name}.pk3"));

    let mut candidates: Vec<SourceSpec> = Vec::new();
    if let Some(pk3) = source_pk3 {
        candidates.push(SourceSpec {
            kind: SourceKind::Pk3,
            path: pk3.to_path_buf(),
        });
    }
    candidates.push(SourceSpec {
        kind: SourceKind::Pk3,
        path: canonical_pk3.clone(),
    });
    for pk3 in list_dist_pk3s(&dist_dir).filter(|p| *p != canonical_pk3) {
        candidates.push(SourceSpec {
            kind: SourceKind::Pk3,
            path: pk3,
        });
    }
    if let Some(dir) = source_dir {
        candidates.push(SourceSpec {
            kind: SourceKind::Dir,
            path: dir.to_path_buf(),
        });
    }
    candidates.push(SourceSpec {
        kind: SourceKind::Dir,
        path: mod_dir,
    });

    for candidate in candidates {
        let ok = match candidate.kind {
            SourceKind::Pk3 => candidate.path.is_file(),
            SourceKind::Dir => candidate.path.is_dir(),
        };
        if ok {
            let path = candidate.path.canonicalize()?;
            return Ok(SourceSpec {
                kind: candidate.kind,
                path,
            });
        }
    }

    let available = find_available_mods(root_dir);
    Err(SourceError::NotFound {
        mod_name: mod_name.to_string(),
        available: if available.is_empty() {
            "(none found)".to_string()
        } else {
            available.join(", ")
        },
    })
}

/// Resolve the output PK3 path: explicit flag, or the load-last override
/// next to the mod's dist archives.
pub fn resolve_output(root_dir: &Path, mod_name: &str, output_pk3: Option<&Path>) -> PathBuf {
    match output_pk3 {
        Some(path) => path.to_path_buf(),
        None => root_dir
            .join("dist")
            .join(mod_name)
            .join(format!("z_{mod_name}_upscaled_skins.pk3")),
    }
}

/// Discover every player texture in the source, sorted by identity.
pub fn discover_images(source: &SourceSpec) -> Result<Vec<SourceImage>, SourceError> {
    let mut images = match source.kind {
        SourceKind::Pk3 => archive::read_matching(&source.path, is_texture_path)?
            .into_iter()
            .map(|(rel_path, bytes)| SourceImage { rel_path, bytes })
            .collect(),
        SourceKind::Dir => {
            let mut out = Vec::new();
            let players_root = source.path.join("models").join("players");
            if players_root.is_dir() {
                for entry in WalkDir::new(&players_root) {
                    let entry = entry?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let rel = entry
                        .path()
                        .strip_prefix(&source.path)
                        .expect("walkdir yields paths under the source root");
                    let rel_path = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !is_texture_path(&rel_path) {
                        continue;
                    }
                    out.push(SourceImage {
                        rel_path,
                        bytes: std::fs::read(entry.path())?,
                    });
                }
            }
            out
        }
    };
    images.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(images)
}
