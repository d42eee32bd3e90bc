//! Slicing and connection value objects.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Bed adhesion mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdhesionType {
    /// No adhesion aid.
    None,
    /// Skirt around the part.
    Skirt,
    /// Brim attached to the first layer.
    #[default]
    Brim,
    /// Raft under the part.
    Raft,
}

impl AdhesionType {
    /// Name used by slicer settings.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdhesionType::None => "none",
            AdhesionType::Skirt => "skirt",
            AdhesionType::Brim => "brim",
            AdhesionType::Raft => "raft",
        }
    }
}

/// Filament material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialType {
    /// Polylactic acid.
    #[default]
    Pla,
    /// ABS.
    Abs,
    /// PETG.
    Petg,
    /// Flexible TPU.
    Tpu,
}

impl MaterialType {
    /// Filament density in g/cm³.
    pub fn density(&self) -> f64 {
        match self {
            MaterialType::Pla => 1.24,
            MaterialType::Abs => 1.04,
            MaterialType::Petg => 1.27,
            MaterialType::Tpu => 1.21,
        }
    }

    /// Upper-case name used in printer metadata ("PLA", "PETG", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialType::Pla => "PLA",
            MaterialType::Abs => "ABS",
            MaterialType::Petg => "PETG",
            MaterialType::Tpu => "TPU",
        }
    }
}

/// Slicing parameters.
///
/// Immutable once built: every constructor path runs [`SlicingConfig::validate`],
/// including deserialization, so an invalid config never enters the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSlicingConfig")]
pub struct SlicingConfig {
    layer_height: f64,
    infill_density: u8,
    print_speed: u32,
    travel_speed: u32,
    support_enabled: bool,
    adhesion: AdhesionType,
    material: MaterialType,
    nozzle_temperature: u32,
    bed_temperature: u32,
}

#[derive(Deserialize)]
struct RawSlicingConfig {
    layer_height: f64,
    infill_density: u8,
    print_speed: u32,
    travel_speed: u32,
    #[serde(default)]
    support_enabled: bool,
    #[serde(default)]
    adhesion: AdhesionType,
    #[serde(default)]
    material: MaterialType,
    nozzle_temperature: u32,
    bed_temperature: u32,
}

impl TryFrom<RawSlicingConfig> for SlicingConfig {
    type Error = TaskError;

    fn try_from(raw: RawSlicingConfig) -> Result<Self> {
        let config = Self {
            layer_height: raw.layer_height,
            infill_density: raw.infill_density,
            print_speed: raw.print_speed,
            travel_speed: raw.travel_speed,
            support_enabled: raw.support_enabled,
            adhesion: raw.adhesion,
            material: raw.material,
            nozzle_temperature: raw.nozzle_temperature,
            bed_temperature: raw.bed_temperature,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for SlicingConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl SlicingConfig {
    /// Start building a config from the `standard` preset.
    pub fn builder() -> SlicingConfigBuilder {
        SlicingConfigBuilder {
            inner: Self::standard(),
        }
    }

    /// Fast draft preset.
    pub fn fast() -> Self {
        Self {
            layer_height: 0.3,
            infill_density: 10,
            print_speed: 60,
            travel_speed: 120,
            support_enabled: false,
            adhesion: AdhesionType::Skirt,
            material: MaterialType::Pla,
            nozzle_temperature: 200,
            bed_temperature: 60,
        }
    }

    /// Balanced preset.
    pub fn standard() -> Self {
        Self {
            layer_height: 0.2,
            infill_density: 20,
            print_speed: 50,
            travel_speed: 100,
            support_enabled: true,
            adhesion: AdhesionType::Brim,
            material: MaterialType::Pla,
            nozzle_temperature: 210,
            bed_temperature: 60,
        }
    }

    /// Fine preset.
    pub fn high_quality() -> Self {
        Self {
            layer_height: 0.1,
            infill_density: 30,
            print_speed: 30,
            travel_speed: 80,
            support_enabled: true,
            adhesion: AdhesionType::Raft,
            material: MaterialType::Pla,
            nozzle_temperature: 215,
            bed_temperature: 65,
        }
    }

    /// Look up a preset by name (`fast`, `standard`, `high_quality`).
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "fast" => Ok(Self::fast()),
            "standard" => Ok(Self::standard()),
            "high_quality" => Ok(Self::high_quality()),
            other => Err(TaskError::InvalidConfig(format!("unknown preset: {other}"))),
        }
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if !(0.1..=0.3).contains(&self.layer_height) {
            return Err(TaskError::InvalidConfig(
                "layer_height must be between 0.1 and 0.3mm".into(),
            ));
        }
        if self.infill_density > 100 {
            return Err(TaskError::InvalidConfig(
                "infill_density must be between 0 and 100".into(),
            ));
        }
        if self.print_speed == 0 || self.travel_speed == 0 {
            return Err(TaskError::InvalidConfig(
                "print_speed and travel_speed must be positive".into(),
            ));
        }
        if self.nozzle_temperature == 0 {
            return Err(TaskError::InvalidConfig(
                "nozzle_temperature must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Layer height (mm).
    pub fn layer_height(&self) -> f64 {
        self.layer_height
    }

    /// Infill density (percent).
    pub fn infill_density(&self) -> u8 {
        self.infill_density
    }

    /// Print speed (mm/s).
    pub fn print_speed(&self) -> u32 {
        self.print_speed
    }

    /// Travel speed (mm/s).
    pub fn travel_speed(&self) -> u32 {
        self.travel_speed
    }

    /// Whether supports are generated.
    pub fn support_enabled(&self) -> bool {
        self.support_enabled
    }

    /// Bed adhesion mode.
    pub fn adhesion(&self) -> AdhesionType {
        self.adhesion
    }

    /// Filament material.
    pub fn material(&self) -> MaterialType {
        self.material
    }

    /// Nozzle temperature (°C).
    pub fn nozzle_temperature(&self) -> u32 {
        self.nozzle_temperature
    }

    /// Bed temperature (°C).
    pub fn bed_temperature(&self) -> u32 {
        self.bed_temperature
    }
}

/// Builder for [`SlicingConfig`]; validation runs once in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct SlicingConfigBuilder {
    inner: SlicingConfig,
}

impl SlicingConfigBuilder {
    /// Layer height (mm).
    pub fn layer_height(mut self, value: f64) -> Self {
        self.inner.layer_height = value;
        self
    }

    /// Infill density (percent).
    pub fn infill_density(mut self, value: u8) -> Self {
        self.inner.infill_density = value;
        self
    }

    /// Print speed (mm/s).
    pub fn print_speed(mut self, value: u32) -> Self {
        self.inner.print_speed = value;
        self
    }

    /// Travel speed (mm/s).
    pub fn travel_speed(mut self, value: u32) -> Self {
        self.inner.travel_speed = value;
        self
    }

    /// Enable or disable supports.
    pub fn support_enabled(mut self, value: bool) -> Self {
        self.inner.support_enabled = value;
        self
    }

    /// Bed adhesion mode.
    pub fn adhesion(mut self, value: AdhesionType) -> Self {
        self.inner.adhesion = value;
        self
    }

    /// Filament material.
    pub fn material(mut self, value: MaterialType) -> Self {
        self.inner.material = value;
        self
    }

    /// Nozzle temperature (°C).
    pub fn nozzle_temperature(mut self, value: u32) -> Self {
        self.inner.nozzle_temperature = value;
        self
    }

    /// Bed temperature (°C).
    pub fn bed_temperature(mut self, value: u32) -> Self {
        self.inner.bed_temperature = value;
        self
    }

    /// Validate and produce the config.
    pub fn build(self) -> Result<SlicingConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

/// Printer connection parameters.
///
/// The access code is a secret: `Debug` redacts it and nothing in this
/// workspace logs the struct in full.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Printer IP address or host name.
    pub host: String,
    /// Port override (protocol default when `None`).
    #[serde(default)]
    pub port: Option<u16>,
    /// Access code (from the printer's LAN mode settings).
    pub access_code: String,
    /// Device serial number.
    pub serial: String,
    /// Whether the transport uses TLS.
    #[serde(default = "default_tls")]
    pub use_tls: bool,
}

fn default_tls() -> bool {
    true
}

impl ConnectionConfig {
    /// Create a new configuration with TLS enabled.
    pub fn new(
        host: impl Into<String>,
        serial: impl Into<String>,
        access_code: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            access_code: access_code.into(),
            serial: serial.into(),
            use_tls: true,
        }
    }

    /// Check that the required fields are present.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TaskError::InvalidPrinter("host is required".into()));
        }
        if self.serial.trim().is_empty() {
            return Err(TaskError::InvalidPrinter("serial is required".into()));
        }
        if self.access_code.is_empty() {
            return Err(TaskError::InvalidPrinter("access code is required".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("access_code", &"***")
            .field("serial", &self.serial)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for name in ["fast", "standard", "high_quality"] {
            let config = SlicingConfig::preset(name).unwrap();
            assert!(config.validate().is_ok(), "{name}");
        }
        assert!(SlicingConfig::preset("ludicrous").is_err());
    }

    #[test]
    fn test_builder_rejects_invalid_layer_height() {
        let result = SlicingConfig::builder().layer_height(0.5).build();
        assert!(matches!(result, Err(TaskError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_zero_speed() {
        assert!(SlicingConfig::builder().print_speed(0).build().is_err());
        assert!(SlicingConfig::builder().travel_speed(0).build().is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let bad = r#"{"layer_height":0.2,"infill_density":150,"print_speed":50,
            "travel_speed":100,"nozzle_temperature":210,"bed_temperature":60}"#;
        assert!(serde_json::from_str::<SlicingConfig>(bad).is_err());

        let good = r#"{"layer_height":0.2,"infill_density":15,"print_speed":50,
            "travel_speed":100,"material":"petg","nozzle_temperature":240,"bed_temperature":80}"#;
        let config: SlicingConfig = serde_json::from_str(good).unwrap();
        assert_eq!(config.material(), MaterialType::Petg);
        assert_eq!(config.adhesion(), AdhesionType::Brim);
    }

    #[test]
    fn test_connection_debug_redacts_access_code() {
        let config = ConnectionConfig::new("192.168.1.50", "01S00A000000001", "12345678");
        let debug = format!("{config:?}");
        assert!(!debug.contains("12345678"));
        assert!(debug.contains("01S00A000000001"));
    }
}
