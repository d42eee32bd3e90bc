//! CuraEngine machine definitions and per-setting overrides.

use std::path::{Path, PathBuf};

use printloom_core::{FirmwareFlavor, PrinterProfile, SlicingConfig};
use serde_json::{json, Value};

use crate::error::Result;

fn gcode_flavor(flavor: FirmwareFlavor) -> &'static str {
    match flavor {
        FirmwareFlavor::Marlin | FirmwareFlavor::Bambu => "RepRap (Marlin/Sprinter)",
        FirmwareFlavor::Klipper => "RepRap (RepRap)",
    }
}

/// Build a `.def.json` document describing the machine.
pub fn machine_definition(profile: &PrinterProfile) -> Value {
    json!({
        "version": 2,
        "name": profile.name,
        "inherits": "fdmprinter",
        "metadata": {
            "visible": true,
            "machine_extruder_trains": { "0": "fdmextruder" }
        },
        "overrides": {
            "machine_name": { "default_value": profile.name },
            "machine_width": { "default_value": profile.bed_x },
            "machine_depth": { "default_value": profile.bed_y },
            "machine_height": { "default_value": profile.bed_z },
            "machine_heated_bed": { "default_value": profile.heated_bed },
            "machine_nozzle_size": { "default_value": profile.nozzle_diameter },
            "material_diameter": { "default_value": profile.filament_diameter },
            "machine_max_feedrate_x": { "default_value": profile.max_travel_speed },
            "machine_max_feedrate_y": { "default_value": profile.max_travel_speed },
            "machine_gcode_flavor": { "default_value": gcode_flavor(profile.flavor) }
        }
    })
}

/// Locate the definition for `profile`.
///
/// A hand-maintained `definitions_dir/<id>.def.json` wins. Otherwise one is
/// generated into `scratch_dir`.
pub fn resolve_definition(
    profile: &PrinterProfile,
    definitions_dir: Option<&Path>,
    scratch_dir: &Path,
) -> Result<PathBuf> {
    let file_name = format!("{}.def.json", profile.id);

    if let Some(dir) = definitions_dir {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    let path = scratch_dir.join(file_name);
    let body = serde_json::to_vec_pretty(&machine_definition(profile))?;
    std::fs::write(&path, body)?;
    Ok(path)
}

/// `-s key=value` overrides for a slicing config, in a stable order.
pub fn setting_overrides(config: &SlicingConfig) -> Vec<(&'static str, String)> {
    vec![
        ("layer_height", config.layer_height().to_string()),
        ("infill_sparse_density", config.infill_density().to_string()),
        ("speed_print", config.print_speed().to_string()),
        ("speed_travel", config.travel_speed().to_string()),
        ("support_enable", config.support_enabled().to_string()),
        ("adhesion_type", config.adhesion().as_str().to_string()),
        ("material_print_temperature", config.nozzle_temperature().to_string()),
        ("material_bed_temperature", config.bed_temperature().to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_definition() {
        let dir = tempfile::tempdir().unwrap();
        let profile = PrinterProfile::bambu_x1c();
        let path = resolve_definition(&profile, None, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "bambu_x1c.def.json");

        let doc: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["inherits"], "fdmprinter");
        assert_eq!(doc["overrides"]["machine_width"]["default_value"], 256.0);
    }

    #[test]
    fn test_existing_definition_wins() {
        let defs = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let existing = defs.path().join("generic.def.json");
        std::fs::write(&existing, "{}").unwrap();

        let path =
            resolve_definition(&PrinterProfile::generic(), Some(defs.path()), scratch.path())
                .unwrap();
        assert_eq!(path, existing);
    }

    #[test]
    fn test_overrides() {
        let overrides = setting_overrides(&SlicingConfig::standard());
        let keys: Vec<_> = overrides.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys[0], "layer_height");
        assert!(keys.contains(&"adhesion_type"));
        assert!(overrides.iter().any(|(k, v)| *k == "support_enable" && (v == "true" || v == "false")));
    }
}
