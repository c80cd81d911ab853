//! Run configuration: upscale presets and startup validation.
//!
//! A [`Preset`] is a named `(model, scale)` pair the operator can select per
//! image in review mode. The preset list is fixed at startup: CLI flags are
//! parsed, deduplicated by name, then filtered down to presets whose model
//! files actually exist on disk. An empty result is fatal — a review session
//! with nothing runnable is useless.
//!
//! Everything here fails fast. A bad preset spec, a non-positive scale, or a
//! missing model is a [`ConfigError`] before any image is touched.

use crate::tools::have_model_files;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid preset '{0}': expected name:model:scale")]
    BadPresetSpec(String),
    #[error("invalid preset '{0}': name, model, and scale must be non-empty")]
    EmptyPresetField(String),
    #[error("invalid preset '{0}': scale must be a positive integer")]
    BadPresetScale(String),
    #[error("no usable presets: missing model files for {0}")]
    NoUsablePresets(String),
    #[error("--max-dimension must be greater than 0")]
    BadMaxDimension,
    #[error("--scale must be greater than 0")]
    BadScale,
}

/// A named upscale configuration: which model, at which scale factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub model: String,
    pub scale: u32,
}

/// Parse one `name:model:scale` preset spec.
pub fn parse_preset(raw: &str) -> Result<Preset, ConfigError> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return Err(ConfigError::BadPresetSpec(raw.to_string()));
    }
    let name = parts[0].trim();
    let model = parts[1].trim();
    let scale_raw = parts[2].trim();
    if name.is_empty() || model.is_empty() || scale_raw.is_empty() {
        return Err(ConfigError::EmptyPresetField(raw.to_string()));
    }
    let scale: u32 = scale_raw
        .parse()
        .map_err(|_| ConfigError::BadPresetScale(raw.to_string()))?;
    if scale == 0 {
        return Err(ConfigError::BadPresetScale(raw.to_string()));
    }
    Ok(Preset {
        name: name.to_string(),
        model: model.to_string(),
        scale,
    })
}

/// Build the session preset list.
///
/// Explicit `--preset` specs win; without any, a stock list is derived from
/// the primary `--model`/`--scale` plus the two companion models shipped with
/// every Real-ESRGAN release. Duplicate names keep the first occurrence.
/// Presets whose `.param`/`.bin` files are missing from `models_dir` are
/// dropped; dropping all of them is a [`ConfigError::NoUsablePresets`].
pub fn build_presets(
    specs: &[String],
    model: &str,
    scale: u32,
    models_dir: &Path,
) -> Result<Vec<Preset>, ConfigError> {
    let mut presets = Vec::new();
    if specs.is_empty() {
        presets.push(Preset {
            name: "default".to_string(),
            model: model.to_string(),
            scale,
        });
        presets.push(Preset {
            name: "realesrnet".to_string(),
            model: "realesrnet-x4plus".to_string(),
            scale,
        });
        presets.push(Preset {
            name: "anime".to_string(),
            model: "realesrgan-x4plus-anime".to_string(),
            scale,
        });
    } else {
        for spec in specs {
            presets.push(parse_preset(spec)?);
        }
    }

    let mut seen = std::collections::HashSet::new();
    presets.retain(|p| seen.insert(p.name.clone()));

    let all_models: Vec<String> = presets.iter().map(|p| p.model.clone()).collect();
    presets.retain(|p| have_model_files(models_dir, &p.model));
    if presets.is_empty() {
        return Err(ConfigError::NoUsablePresets(all_models.join(", ")));
    }
    Ok(presets)
}
