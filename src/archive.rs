//! PK3 packaging.
//!
//! PK3 files are plain zip archives; the engine loads them alphabetically,
//! which is why the output name starts with `z_` — it must override the base
//! archives. Writing is deterministic: entries are added in sorted path
//! order, deflate-compressed, with the zip crate's fixed default timestamp
//! (the `time` feature is off). Packaging the same tree twice yields
//! byte-identical archives, which finalize relies on.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Directory name for scratch files that must never be packaged.
pub const TMP_DIR_NAME: &str = "__tmp";

/// Relative path rendered with forward slashes, as zip entry names require.
fn zip_entry_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn in_tmp_dir(rel: &Path) -> bool {
    rel.components()
        .any(|c| matches!(c, Component::Normal(name) if name == TMP_DIR_NAME))
}

/// Package every file under `source_root` into a PK3 at `output`, replacing
/// any existing archive. Returns the number of files written.
pub fn package_tree(source_root: &Path, output: &Path) -> Result<usize, ArchiveError> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if output.exists() {
        std::fs::remove_file(output)?;
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(source_root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();
        if in_tmp_dir(&rel) {
            continue;
        }
        paths.push(rel);
    }
    paths.sort();

    let mut zip = ZipWriter::new(BufWriter::new(File::create(output)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for rel in &paths {
        let name = zip_entry_name(rel);
        zip.start_file(&name, options)?;
        let mut reader = BufReader::new(File::open(source_root.join(rel))?);
        io::copy(&mut reader, &mut zip)?;
        tracing::debug!(entry = %name, "added to PK3");
    }
    zip.finish()?;
    Ok(paths.len())
}

/// Read every archive entry whose (forward-slash) name passes `want`.
/// Entries come back in archive order with backslashes normalized.
pub fn read_matching(
    archive: &Path,
    want: impl Fn(&str) -> bool,
) -> Result<Vec<(String, Vec<u8>)>, ArchiveError> {
    let mut zip = zip::ZipArchive::new(BufReader::new(File::open(archive)?))?;
    let mut out = Vec::new();
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/");
        if !want(&name) {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        io::copy(&mut entry, &mut bytes)?;
        out.push((name, bytes));
    }
    Ok(out)
}
