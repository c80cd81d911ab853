//! External tool collaborators: the Real-ESRGAN upscaler and the platform
//! image converter.
//!
//! The rest of the crate only sees the [`UpscaleBackend`] trait, so pipeline
//! and session logic can be exercised in tests with the recording mock below.
//! The production implementation, [`NcnnBackend`], shells out to
//! `realesrgan-ncnn-vulkan` and to `sips` (macOS) or ImageMagick (Linux).
//!
//! Every invocation runs under a hard wall-clock timeout; an expired timer is
//! reported exactly like a non-zero exit, with the command line in the error
//! text. Tool acquisition is not handled here — [`Toolchain::locate`] only
//! validates that an existing install satisfies the requested model and fails
//! with an installation error otherwise.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

/// Hard limit on any single upscaler or converter invocation.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command timed out after {timeout}s: {command}")]
    Timeout { command: String, timeout: u64 },
    #[error("command failed ({status}): {command}{stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("upscaler binary not found or not executable: {0}")]
    MissingBinary(PathBuf),
    #[error("model '{model}' not found in {models_dir}")]
    MissingModel { model: String, models_dir: PathBuf },
    #[error("required converter 'sips' not found on macOS")]
    SipsNotFound,
    #[error("required converter not found on Linux; install ImageMagick ('magick' or 'convert')")]
    ImageMagickNotFound,
    #[error("unsupported platform '{0}'; only macOS and Linux are supported")]
    UnsupportedPlatform(String),
    #[error("converter does not support target extension '{0}'")]
    UnsupportedTarget(String),
}

/// True when both `.param` and `.bin` files for `model` exist.
pub fn have_model_files(models_dir: &Path, model: &str) -> bool {
    models_dir.join(format!("{model}.param")).is_file()
        && models_dir.join(format!("{model}.bin")).is_file()
}

/// A validated upscaler install: binary path plus model directory.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub tool_bin: PathBuf,
    pub models_dir: PathBuf,
}

impl Toolchain {
    /// Validate an existing install for `model`. Fails if the binary is
    /// missing or not executable, or if the model files are absent.
    pub fn locate(tool_bin: &Path, models_dir: &Path, model: &str) -> Result<Toolchain, ToolError> {
        if !is_executable_file(tool_bin) {
            return Err(ToolError::MissingBinary(tool_bin.to_path_buf()));
        }
        if !have_model_files(models_dir, model) {
            return Err(ToolError::MissingModel {
                model: model.to_string(),
                models_dir: models_dir.to_path_buf(),
            });
        }
        Ok(Toolchain {
            tool_bin: tool_bin.to_path_buf(),
            models_dir: models_dir.to_path_buf(),
        })
    }
}

fn is_executable_file(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Which converter flavor was found on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConverterKind {
    Sips,
    ImageMagick,
}

/// Platform image converter command.
#[derive(Debug, Clone)]
pub struct Converter {
    kind: ConverterKind,
    bin: PathBuf,
}

impl Converter {
    /// Detect the available converter: `sips` on macOS, `magick` or
    /// `convert` on Linux.
    pub fn detect() -> Result<Converter, ToolError> {
        if cfg!(target_os = "macos") {
            return match find_in_path("sips") {
                Some(bin) => Ok(Converter {
                    kind: ConverterKind::Sips,
                    bin,
                }),
                None => Err(ToolError::SipsNotFound),
            };
        }
        if cfg!(target_os = "linux") {
            for name in ["magick", "convert"] {
                if let Some(bin) = find_in_path(name) {
                    return Ok(Converter {
                        kind: ConverterKind::ImageMagick,
                        bin,
                    });
                }
            }
            return Err(ToolError::ImageMagickNotFound);
        }
        Err(ToolError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ))
    }

    fn command(&self, source: &Path, output: &Path) -> Result<Command, ToolError> {
        let mut cmd = Command::new(&self.bin);
        match self.kind {
            ConverterKind::Sips => {
                let ext = output
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_default();
                let format = match ext.as_str() {
                    "jpg" | "jpeg" => "jpeg",
                    "png" | "tga" => &ext,
                    other => return Err(ToolError::UnsupportedTarget(other.to_string())),
                };
                cmd.args(["-s", "format", format])
                    .arg(source)
                    .arg("--out")
                    .arg(output);
            }
            ConverterKind::ImageMagick => {
                cmd.arg(source).arg(output);
            }
        }
        Ok(cmd)
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn render_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run a tool to completion under [`TOOL_TIMEOUT`]. Expiry kills the child
/// and is reported like any other failure.
fn run_tool(mut cmd: Command) -> Result<(), ToolError> {
    let command = render_command(&cmd);
    tracing::debug!(%command, "running external tool");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let Some(status) = child.wait_timeout(TOOL_TIMEOUT)? else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(ToolError::Timeout {
            command,
            timeout: TOOL_TIMEOUT.as_secs(),
        });
    };

    let output = child.wait_with_output()?;
    if !status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ToolError::Failed {
            command,
            status: status.code().unwrap_or(-1),
            stderr: if stderr.is_empty() {
                String::new()
            } else {
                format!("\n{stderr}")
            },
        });
    }
    Ok(())
}

/// The two operations the pipeline needs from the outside world.
///
/// `upscale` and `convert` must leave a file at `output` on success and may
/// leave anything (or nothing) behind on failure. `has_model` answers preset
/// availability without touching the network.
pub trait UpscaleBackend: Send + Sync {
    /// Upscale `input` into `output` (PNG) with the given model and scale.
    fn upscale(&self, input: &Path, output: &Path, model: &str, scale: u32)
    -> Result<(), ToolError>;

    /// Convert `source` into `output`, format chosen by output extension.
    fn convert(&self, source: &Path, output: &Path) -> Result<(), ToolError>;

    /// Whether the model files for `model` are installed.
    fn has_model(&self, model: &str) -> bool;
}

/// Production backend: realesrgan-ncnn-vulkan plus the platform converter.
pub struct NcnnBackend {
    toolchain: Toolchain,
    converter: Converter,
}

impl NcnnBackend {
    pub fn new(toolchain: Toolchain, converter: Converter) -> Self {
        Self {
            toolchain,
            converter,
        }
    }
}

impl UpscaleBackend for NcnnBackend {
    fn upscale(
        &self,
        input: &Path,
        output: &Path,
        model: &str,
        scale: u32,
    ) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.toolchain.tool_bin);
        cmd.arg("-i")
            .arg(input)
            .arg("-o")
            .arg(output)
            .args(["-n", model])
            .args(["-s", &scale.to_string()])
            .args(["-f", "png"])
            .arg("-m")
            .arg(&self.toolchain.models_dir);
        run_tool(cmd)
    }

    fn convert(&self, source: &Path, output: &Path) -> Result<(), ToolError> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        run_tool(self.converter.command(source, output)?)
    }

    fn has_model(&self, model: &str) -> bool {
        have_model_files(&self.toolchain.models_dir, model)
    }
}
