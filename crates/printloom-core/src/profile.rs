//! Printer hardware profiles.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Firmware dialect of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FirmwareFlavor {
    /// Marlin firmware (Ender, Prusa).
    #[default]
    Marlin,
    /// Klipper firmware.
    Klipper,
    /// Bambu Lab printers.
    Bambu,
}

impl FirmwareFlavor {
    /// Name used in slicer machine definitions.
    pub fn definition_name(&self) -> &'static str {
        match self {
            FirmwareFlavor::Marlin | FirmwareFlavor::Bambu => "Marlin",
            FirmwareFlavor::Klipper => "Klipper",
        }
    }
}

/// Printer profile with machine-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterProfile {
    /// Stable identifier, also used to look up slicer definition files.
    pub id: String,
    /// Profile name.
    pub name: String,
    /// Firmware flavor.
    pub flavor: FirmwareFlavor,
    /// Build volume X (mm).
    pub bed_x: f64,
    /// Build volume Y (mm).
    pub bed_y: f64,
    /// Build volume Z (mm).
    pub bed_z: f64,
    /// Is the bed heated?
    pub heated_bed: bool,
    /// Nozzle diameter (mm).
    pub nozzle_diameter: f64,
    /// Filament diameter (mm).
    pub filament_diameter: f64,
    /// Maximum print speed (mm/s).
    pub max_print_speed: u32,
    /// Maximum travel speed (mm/s).
    pub max_travel_speed: u32,
    /// File formats the device accepts (e.g. "gcode.3mf").
    pub supported_formats: Vec<String>,
}

impl Default for PrinterProfile {
    fn default() -> Self {
        Self::generic()
    }
}

impl PrinterProfile {
    /// Generic printer profile.
    pub fn generic() -> Self {
        Self {
            id: "generic".into(),
            name: "Generic".into(),
            flavor: FirmwareFlavor::Marlin,
            bed_x: 220.0,
            bed_y: 220.0,
            bed_z: 250.0,
            heated_bed: true,
            nozzle_diameter: 0.4,
            filament_diameter: 1.75,
            max_print_speed: 150,
            max_travel_speed: 300,
            supported_formats: vec!["gcode".into()],
        }
    }

    fn bambu(id: &str, name: &str, bed_z: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            flavor: FirmwareFlavor::Bambu,
            bed_x: 256.0,
            bed_y: 256.0,
            bed_z,
            heated_bed: true,
            nozzle_diameter: 0.4,
            filament_diameter: 1.75,
            max_print_speed: 500,
            max_travel_speed: 500,
            supported_formats: vec!["gcode.3mf".into()],
        }
    }

    /// Bambu Lab X1 Carbon profile.
    pub fn bambu_x1c() -> Self {
        Self::bambu("bambu_x1c", "Bambu Lab X1 Carbon", 256.0)
    }

    /// Bambu Lab P1S profile.
    pub fn bambu_p1s() -> Self {
        Self::bambu("bambu_p1s", "Bambu Lab P1S", 256.0)
    }

    /// Bambu Lab A1 profile.
    pub fn bambu_a1() -> Self {
        Self::bambu("bambu_a1", "Bambu Lab A1", 256.0)
    }

    /// Bambu Lab H2D profile.
    pub fn bambu_h2d() -> Self {
        let mut profile = Self::bambu("bambu_h2d", "Bambu Lab H2D", 325.0);
        profile.bed_x = 325.0;
        profile.bed_y = 320.0;
        profile
    }

    /// Get all built-in profiles.
    pub fn all_profiles() -> Vec<Self> {
        vec![
            Self::generic(),
            Self::bambu_x1c(),
            Self::bambu_p1s(),
            Self::bambu_a1(),
            Self::bambu_h2d(),
        ]
    }

    /// Find a built-in profile by id.
    pub fn builtin(id: &str) -> Option<Self> {
        Self::all_profiles().into_iter().find(|p| p.id == id)
    }

    /// Check if a position is within build volume.
    pub fn in_bounds(&self, x: f64, y: f64, z: f64) -> bool {
        x >= 0.0 && x <= self.bed_x && y >= 0.0 && y <= self.bed_y && z >= 0.0 && z <= self.bed_z
    }

    /// Whether the device accepts files with this name.
    pub fn accepts(&self, file_name: &str) -> bool {
        self.supported_formats
            .iter()
            .any(|ext| file_name.ends_with(&format!(".{ext}")))
    }

    /// Validate physical parameters.
    pub fn validate(&self) -> Result<()> {
        if self.nozzle_diameter <= 0.0 || self.filament_diameter <= 0.0 {
            return Err(TaskError::InvalidPrinter(
                "nozzle and filament diameter must be positive".into(),
            ));
        }
        if self.bed_x <= 0.0 || self.bed_y <= 0.0 || self.bed_z <= 0.0 {
            return Err(TaskError::InvalidPrinter("bed volume must be positive".into()));
        }
        if self.max_print_speed == 0 || self.max_travel_speed == 0 {
            return Err(TaskError::InvalidPrinter("speeds must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        for profile in PrinterProfile::all_profiles() {
            assert!(profile.validate().is_ok(), "{}", profile.id);
            assert!(profile.bed_x > 0.0);
            assert!(profile.nozzle_diameter > 0.0);
        }
    }

    #[test]
    fn test_in_bounds() {
        let profile = PrinterProfile::bambu_x1c();
        assert!(profile.in_bounds(100.0, 100.0, 100.0));
        assert!(!profile.in_bounds(-1.0, 100.0, 100.0));
        assert!(!profile.in_bounds(300.0, 100.0, 100.0));
    }

    #[test]
    fn test_accepts_container_only_for_bambu() {
        assert!(PrinterProfile::bambu_p1s().accepts("cube.gcode.3mf"));
        assert!(!PrinterProfile::bambu_p1s().accepts("cube.gcode"));
        assert!(PrinterProfile::generic().accepts("cube.gcode"));
    }

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(PrinterProfile::builtin("bambu_h2d").unwrap().name, "Bambu Lab H2D");
        assert!(PrinterProfile::builtin("nope").is_none());
    }
}
