//! OrcaSlicer backend.
//!
//! OrcaSlicer inherits the PrusaSlicer command line: `--export-gcode`,
//! `--output` and one flag per overridden setting, with the model last.
//! Bambu machines are selected by their built-in printer preset.

use std::ffi::OsString;
use std::path::Path;

use async_trait::async_trait;
use printloom_core::{AdhesionType, FirmwareFlavor, PrinterProfile, SlicingConfig};

use crate::engine::{prepare, run, Slicer, SlicerOptions, ToolpathResult};
use crate::error::Result;

/// Walls and solid layers Orca is asked for on every slice.
const PERIMETERS: u32 = 3;
const SOLID_LAYERS: u32 = 4;

/// Setting flags for a slicing config, in a stable order.
pub fn setting_flags(config: &SlicingConfig) -> Vec<String> {
    let mut flags = vec![
        "--layer-height".to_string(),
        config.layer_height().to_string(),
        "--fill-density".to_string(),
        format!("{}%", config.infill_density()),
        "--perimeters".to_string(),
        PERIMETERS.to_string(),
        "--top-solid-layers".to_string(),
        SOLID_LAYERS.to_string(),
        "--bottom-solid-layers".to_string(),
        SOLID_LAYERS.to_string(),
        "--speed".to_string(),
        config.print_speed().to_string(),
        "--travel-speed".to_string(),
        config.travel_speed().to_string(),
        "--temperature".to_string(),
        config.nozzle_temperature().to_string(),
        "--bed-temperature".to_string(),
        config.bed_temperature().to_string(),
    ];
    if config.support_enabled() {
        flags.push("--support-material".to_string());
    }
    let adhesion = match config.adhesion() {
        AdhesionType::None => None,
        AdhesionType::Skirt => Some(("--skirts", "3")),
        AdhesionType::Brim => Some(("--brim-width", "5")),
        AdhesionType::Raft => Some(("--raft-layers", "3")),
    };
    if let Some((flag, value)) = adhesion {
        flags.push(flag.to_string());
        flags.push(value.to_string());
    }
    flags
}

/// OrcaSlicer command-line slicer.
#[derive(Debug, Clone, Default)]
pub struct OrcaSlicer {
    options: SlicerOptions,
}

impl OrcaSlicer {
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
        profile: &PrinterProfile,
        config: &SlicingConfig,
        output: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.options.prefix_args.iter().map(OsString::from).collect();
        args.push("--export-gcode".into());
        args.push("--output".into());
        args.push(output.into());
        if profile.flavor == FirmwareFlavor::Bambu {
            args.push("--printer".into());
            args.push(profile.name.as_str().into());
        }
        args.extend(setting_flags(config).into_iter().map(OsString::from));
        args.push(model.into());
        args
    }
}

#[async_trait]
impl Slicer for OrcaSlicer {
    async fn slice(
        &self,
        model: &Path,
        profile: &PrinterProfile,
        config: &SlicingConfig,
        output: &Path,
    ) -> Result<ToolpathResult> {
        prepare(model, config, output).await?;
        let args = self.command_args(model, profile, config, output);
        run(&self.options, args, model, profile, config, output).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::engine::SlicerEngine;
    use crate::error::SliceError;

    fn script(dir: &Path, body: &str) -> SlicerOptions {
        let path = dir.join("fake-orca.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        SlicerOptions {
            engine: SlicerEngine::Orca,
            binary: Some(PathBuf::from("/bin/sh")),
            prefix_args: vec![path.to_string_lossy().into_owned()],
            definitions_dir: None,
            timeout: Duration::from_secs(10),
        }
    }

    // Records its arguments next to the toolpath and writes Prusa-style footers.
    const WRITE_OUTPUT: &str = r#"out=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
printf '%s\n' "$@" > "$out.args"
printf 'G28\nG1 X1 Y1\n; total layers count = 42\n; filament used [mm] = 1100.0\n; filament used [g] = 3.21\n; estimated printing time (normal mode) = 12m 34s\n' > "$out""#;

    fn model(dir: &Path) -> PathBuf {
        let path = dir.join("cube.stl");
        std::fs::write(&path, "solid cube\nendsolid cube\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_slice_reads_prusa_footer() {
        let dir = tempfile::tempdir().unwrap();
        let slicer = OrcaSlicer::new(script(dir.path(), WRITE_OUTPUT));
        let output = dir.path().join("out/cube.gcode");
        let model = model(dir.path());

        let result = slicer
            .slice(&model, &PrinterProfile::bambu_x1c(), &SlicingConfig::standard(), &output)
            .await
            .unwrap();

        assert_eq!(result.total_layers, 42);
        assert_eq!(result.estimated_duration, Duration::from_secs(12 * 60 + 34));
        assert!((result.estimated_material_g - 3.21).abs() < 1e-9);
        assert!(!result.estimated);

        let args = std::fs::read_to_string(dir.path().join("out/cube.gcode.args")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args.last().copied(), Some(model.to_str().unwrap()));
        assert!(args.windows(2).any(|w| w == ["--printer", "Bambu Lab X1 Carbon"]));
        // Generated machine definitions are a CuraEngine concern.
        assert!(!dir.path().join("out/bambu_x1c.def.json").exists());
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let slicer = OrcaSlicer::new(script(dir.path(), "echo 'no printer preset' >&2\nexit 1"));
        let err = slicer
            .slice(&model(dir.path()), &PrinterProfile::generic(), &SlicingConfig::standard(), &dir.path().join("o.gcode"))
            .await
            .unwrap_err();
        match err {
            SliceError::Failed { code, stderr } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("no printer preset"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_command_args() {
        let slicer = OrcaSlicer::default();
        let config = SlicingConfig::builder()
            .layer_height(0.2)
            .infill_density(15)
            .support_enabled(true)
            .adhesion(AdhesionType::Raft)
            .build()
            .unwrap();
        let args = slicer.command_args(Path::new("m.stl"), &PrinterProfile::generic(), &config, Path::new("o.gcode"));
        let args: Vec<_> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(&args[..3], ["--export-gcode", "--output", "o.gcode"]);
        assert!(!args.contains(&"--printer".to_string()));
        assert!(args.windows(2).any(|w| w == ["--layer-height", "0.2"]));
        assert!(args.windows(2).any(|w| w == ["--fill-density", "15%"]));
        assert!(args.windows(2).any(|w| w == ["--raft-layers", "3"]));
        assert!(args.contains(&"--support-material".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("m.stl"));
    }

    #[test]
    fn test_no_adhesion_flag_for_none() {
        let config = SlicingConfig::builder().adhesion(AdhesionType::None).build().unwrap();
        let flags = setting_flags(&config);
        assert!(!flags.iter().any(|f| f == "--skirts" || f == "--brim-width" || f == "--raft-layers"));
    }
}
