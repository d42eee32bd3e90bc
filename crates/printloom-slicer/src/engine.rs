//! Slicing engine: runs an external slicer binary under a wall-clock limit.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use printloom_core::{PrinterProfile, SliceOutcome, SlicingConfig};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::definition::{resolve_definition, setting_overrides};
use crate::error::{Result, SliceError};
use crate::orca::OrcaSlicer;
use crate::stats::{estimate, parse_file};

/// Default wall-clock limit for one slice.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const STDERR_TAIL: usize = 2048;

/// Slicer family behind the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlicerEngine {
    /// CuraEngine (`slice -j <definition>`).
    #[default]
    Cura,
    /// OrcaSlicer, or any binary with the PrusaSlicer command line.
    Orca,
}

impl SlicerEngine {
    /// Binary looked up on `PATH` when none is configured.
    pub fn default_binary(&self) -> &'static str {
        match self {
            SlicerEngine::Cura => "CuraEngine",
            SlicerEngine::Orca => "orca-slicer",
        }
    }
}

/// Slicer binary settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicerOptions {
    /// Which command line the binary speaks.
    pub engine: SlicerEngine,
    /// Path to the slicer binary. Defaults to the engine's usual name.
    pub binary: Option<PathBuf>,
    /// Arguments placed before the slicer's own, for wrappers such as `flatpak run`.
    pub prefix_args: Vec<String>,
    /// Directory with hand-maintained `<profile>.def.json` files (CuraEngine only).
    pub definitions_dir: Option<PathBuf>,
    /// Wall-clock limit.
    #[serde(with = "secs")]
    pub timeout: Duration,
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl Default for SlicerOptions {
    fn default() -> Self {
        Self {
            engine: SlicerEngine::default(),
            binary: None,
            prefix_args: Vec::new(),
            definitions_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SlicerOptions {
    /// Binary to launch.
    pub fn binary(&self) -> PathBuf {
        self.binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.engine.default_binary()))
    }

    /// Build the slicer selected by [`SlicerOptions::engine`].
    pub fn into_slicer(self) -> Arc<dyn Slicer> {
        match self.engine {
            SlicerEngine::Cura => Arc::new(CuraEngineSlicer::new(self)),
            SlicerEngine::Orca => Arc::new(OrcaSlicer::new(self)),
        }
    }
}

/// Result of a successful slice.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolpathResult {
    /// Toolpath file.
    pub output_path: PathBuf,
    /// Estimated print duration.
    pub estimated_duration: Duration,
    /// Estimated material (g).
    pub estimated_material_g: f64,
    /// Layer count.
    pub total_layers: u32,
    /// At least one statistic came from the fallback estimator.
    pub estimated: bool,
}

impl ToolpathResult {
    /// Values recorded on a print task.
    pub fn outcome(&self) -> SliceOutcome {
        SliceOutcome {
            toolpath_path: self.output_path.clone(),
            estimated_duration_secs: self.estimated_duration.as_secs(),
            estimated_material_g: self.estimated_material_g,
            total_layers: self.total_layers,
        }
    }
}

/// Turns a model into a toolpath.
#[async_trait]
pub trait Slicer: Send + Sync {
    /// Slice `model` for `profile` with `config`, writing the toolpath to `output`.
    async fn slice(
        &self,
        model: &Path,
        profile: &PrinterProfile,
        config: &SlicingConfig,
        output: &Path,
    ) -> Result<ToolpathResult>;
}

/// CuraEngine command-line slicer.
#[derive(Debug, Clone, Default)]
pub struct CuraEngineSlicer {
    options: SlicerOptions,
}

impl CuraEngineSlicer {
    /// Create a slicer with the given options.
    pub fn new(options: SlicerOptions) -> Self {
        Self { options }
    }

    /// Options in use.
    pub fn options(&self) -> &SlicerOptions {
        &self.options
    }

    /// Arguments passed to the binary.
    pub fn command_args(
        &self,
        model: &Path,
        definition: &Path,
        config: &SlicingConfig,
        output: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.options.prefix_args.iter().map(OsString::from).collect();
        args.extend(["slice", "-v", "-j"].map(OsString::from));
        args.push(definition.into());
        args.push("-l".into());
        args.push(model.into());
        args.push("-o".into());
        args.push(output.into());
        for (key, value) in setting_overrides(config) {
            args.push("-s".into());
            args.push(format!("{key}={value}").into());
        }
        args
    }
}

#[async_trait]
impl Slicer for CuraEngineSlicer {
    async fn slice(
        &self,
        model: &Path,
        profile: &PrinterProfile,
        config: &SlicingConfig,
        output: &Path,
    ) -> Result<ToolpathResult> {
        let scratch = prepare(model, config, output).await?;
        let definition = resolve_definition(profile, self.options.definitions_dir.as_deref(), &scratch)?;
        let args = self.command_args(model, &definition, config, output);
        run(&self.options, args, model, profile, config, output).await
    }
}

/// Check inputs, create the output directory and clear a stale toolpath.
/// Returns the output directory.
pub(crate) async fn prepare(model: &Path, config: &SlicingConfig, output: &Path) -> Result<PathBuf> {
    if !model.is_file() {
        return Err(SliceError::ModelNotFound(model.to_path_buf()));
    }
    config
        .validate()
        .map_err(|e| SliceError::InvalidConfig(e.to_string()))?;

    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir).await?;
    if tokio::fs::try_exists(output).await? {
        tokio::fs::remove_file(output).await?;
    }
    Ok(dir)
}

/// Run the slicer to completion in its own process group and read the
/// statistics from its toolpath.
pub(crate) async fn run(
    options: &SlicerOptions,
    args: Vec<OsString>,
    model: &Path,
    profile: &PrinterProfile,
    config: &SlicingConfig,
    output: &Path,
) -> Result<ToolpathResult> {
    let binary = options.binary();
    tracing::debug!(binary = %binary.display(), engine = ?options.engine, ?args, "launching slicer");

    let mut command = Command::new(&binary);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|source| SliceError::Launch { binary, source })?;
    let pid = child.id();

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = match tokio::time::timeout(options.timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            tracing::warn!(timeout = ?options.timeout, model = %model.display(), "slicer timed out, killing process group");
            terminate(&mut child, pid).await;
            stderr_task.abort();
            return Err(SliceError::Timeout(options.timeout));
        }
    };
    // Helpers the slicer spawned must not outlive it.
    kill_group(pid);

    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(SliceError::Failed {
            code: status.code(),
            stderr: tail(&stderr),
        });
    }

    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => {}
        _ => return Err(SliceError::MissingOutput(output.to_path_buf())),
    }

    let parsed = parse_file(output)?;
    let stats = estimate(&parsed, config, profile);
    if stats.estimated {
        tracing::info!(output = %output.display(), "toolpath lacks statistics markers, using approximation");
    }

    Ok(ToolpathResult {
        output_path: output.to_path_buf(),
        estimated_duration: Duration::from_secs(stats.time_secs),
        estimated_material_g: stats.material_g,
        total_layers: stats.total_layers,
        estimated: stats.estimated,
    })
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(text.len());
    text[start..].to_string()
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child leads its own group, so its pid is the group id.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "slicer already exited");
    }
}
