//! Toolpath statistics.
//!
//! Slicers embed their own estimates as comment markers in the toolpath.
//! Two dialects are recognised:
//!
//! - CuraEngine: `;LAYER_COUNT:`, `;LAYER:`, `;TIME:`, `;Filament used: 1.23m`
//! - Prusa/Orca: `; total layers count = `, `; estimated printing time (normal mode) = 1h 2m 3s`,
//!   `; filament used [g] = `, `; filament used [mm] = `
//!
//! When a marker is missing the value comes from [`estimate`], a deterministic
//! approximation that is not a substitute for a real slicer estimate.

use std::f64::consts::PI;
use std::path::Path;
use std::sync::OnceLock;

use printloom_core::{PrinterProfile, SlicingConfig};
use regex::Regex;

use crate::error::Result;

/// Model height assumed by the fallback estimator (mm).
pub const ASSUMED_MODEL_HEIGHT_MM: f64 = 50.0;

/// Print speed at which the per-layer base time applies (mm/s).
const REFERENCE_SPEED: f64 = 50.0;

/// Statistics found in a toolpath. `None` means the marker was absent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParsedStats {
    /// Declared layer count.
    pub layer_count: Option<u32>,
    /// Highest `;LAYER:` index seen plus one.
    pub layers_seen: Option<u32>,
    /// Estimated print time (s).
    pub time_secs: Option<u64>,
    /// Filament mass (g).
    pub material_g: Option<f64>,
    /// Filament length (mm).
    pub filament_mm: Option<f64>,
}

/// Final statistics for a toolpath.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolpathStats {
    /// Layer count.
    pub total_layers: u32,
    /// Print time (s).
    pub time_secs: u64,
    /// Material mass (g).
    pub material_g: f64,
    /// At least one value came from the fallback estimator.
    pub estimated: bool,
}

fn cura_time() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^;TIME:(\d+)").expect("invalid regex pattern"))
}

fn cura_filament() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^;Filament used:\s*([\d.]+)m").expect("invalid regex pattern")
    })
}

fn key_value() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^;\s*([^=]+?)\s*=\s*(.+?)\s*$").expect("invalid regex pattern"))
}

fn duration_part() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*([dhms])").expect("invalid regex pattern"))
}

/// Parse `1d 2h 3m 4s` style durations into seconds.
pub fn parse_duration(text: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut matched = false;
    for caps in duration_part().captures_iter(text) {
        let value: u64 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "d" => 86_400,
            "h" => 3_600,
            "m" => 60,
            _ => 1,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
        matched = true;
    }
    matched.then_some(total)
}

/// Scan toolpath text for statistics markers.
pub fn parse_stats(text: &str) -> ParsedStats {
    let mut stats = ParsedStats::default();

    for line in text.lines() {
        let line = line.trim_end();
        if !line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix(";LAYER_COUNT:") {
            stats.layer_count = rest.trim().parse().ok().or(stats.layer_count);
        } else if let Some(rest) = line.strip_prefix(";LAYER:") {
            if let Ok(index) = rest.trim().parse::<i64>() {
                let seen = u32::try_from(index + 1).unwrap_or(0);
                stats.layers_seen = Some(stats.layers_seen.unwrap_or(0).max(seen));
            }
        } else if let Some(caps) = cura_time().captures(line) {
            stats.time_secs = caps[1].parse().ok().or(stats.time_secs);
        } else if let Some(caps) = cura_filament().captures(line) {
            if let Ok(metres) = caps[1].parse::<f64>() {
                stats.filament_mm = Some(metres * 1000.0);
            }
        } else if let Some(caps) = key_value().captures(line) {
            let key = caps[1].to_ascii_lowercase();
            let value = &caps[2];
            if key == "total layers count" || key == "total layer number" {
                stats.layer_count = value.parse().ok().or(stats.layer_count);
            } else if key.starts_with("estimated printing time") {
                if stats.time_secs.is_none() {
                    stats.time_secs = parse_duration(value);
                }
            } else if key == "filament used [g]" {
                stats.material_g = first_number(value).or(stats.material_g);
            } else if key == "filament used [mm]" {
                stats.filament_mm = first_number(value).or(stats.filament_mm);
            }
        }
    }

    stats
}

// Multi-extruder files list one value per tool separated by commas.
fn first_number(value: &str) -> Option<f64> {
    value.split(',').next()?.trim().parse().ok()
}

/// Read and parse a toolpath file.
pub fn parse_file(path: &Path) -> Result<ParsedStats> {
    let bytes = std::fs::read(path)?;
    Ok(parse_stats(&String::from_utf8_lossy(&bytes)))
}

/// Fallback layer count: assumed model height over layer height.
pub fn estimate_layers(config: &SlicingConfig) -> u32 {
    ((ASSUMED_MODEL_HEIGHT_MM / config.layer_height()).round() as u32).max(1)
}

/// Fallback time per layer (s). Denser infill and slower speeds take longer.
pub fn per_layer_secs(config: &SlicingConfig) -> f64 {
    let base = 30.0 + f64::from(config.infill_density()) / 100.0 * 30.0;
    base * (REFERENCE_SPEED / f64::from(config.print_speed().max(1)))
}

/// Fallback printed volume (cm³): a shell share plus an infill share per layer.
pub fn volume_estimate_cm3(layers: u32, config: &SlicingConfig) -> f64 {
    let fill = 0.15 + f64::from(config.infill_density()) / 100.0;
    f64::from(layers) * 0.4 * fill
}

/// Filament mass (g) for a length of filament (mm).
pub fn filament_mass(length_mm: f64, filament_diameter: f64, density: f64) -> f64 {
    let radius = filament_diameter / 2.0;
    let volume_cm3 = PI * radius * radius * length_mm / 1000.0;
    volume_cm3 * density
}

/// Combine parsed markers with the fallback estimator.
pub fn estimate(parsed: &ParsedStats, config: &SlicingConfig, profile: &PrinterProfile) -> ToolpathStats {
    let mut estimated = false;
    let density = config.material().density();

    let total_layers = match parsed.layer_count.or(parsed.layers_seen).filter(|n| *n > 0) {
        Some(n) => n,
        None => {
            estimated = true;
            estimate_layers(config)
        }
    };

    let time_secs = match parsed.time_secs.filter(|t| *t > 0) {
        Some(t) => t,
        None => {
            estimated = true;
            (f64::from(total_layers) * per_layer_secs(config)).round().max(1.0) as u64
        }
    };

    let from_length = parsed
        .filament_mm
        .filter(|mm| *mm > 0.0)
        .map(|mm| filament_mass(mm, profile.filament_diameter, density));
    let material_g = match parsed.material_g.filter(|g| *g > 0.0).or(from_length) {
        Some(g) => g,
        None => {
            estimated = true;
            volume_estimate_cm3(total_layers, config) * density
        }
    };

    ToolpathStats {
        total_layers,
        time_secs,
        material_g,
        estimated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURA: &str = ";FLAVOR:Marlin\n;TIME:6143\n;Filament used: 2.5m\n;Layer height: 0.2\n;LAYER_COUNT:120\n;LAYER:0\nG1 X10 Y10\n;LAYER:1\nG1 X20\n";

    const ORCA: &str = "; HEADER_BLOCK_START\n; total layers count = 87\n; HEADER_BLOCK_END\nG1 X1\n; filament used [mm] = 1523.40\n; filament used [g] = 4.55\n; estimated printing time (normal mode) = 1h 2m 3s\n";

    #[test]
    fn test_parse_cura_markers() {
        let parsed = parse_stats(CURA);
        assert_eq!(parsed.layer_count, Some(120));
        assert_eq!(parsed.layers_seen, Some(2));
        assert_eq!(parsed.time_secs, Some(6143));
        assert_eq!(parsed.filament_mm, Some(2500.0));
    }

    #[test]
    fn test_parse_orca_markers() {
        let parsed = parse_stats(ORCA);
        assert_eq!(parsed.layer_count, Some(87));
        assert_eq!(parsed.time_secs, Some(3723));
        assert_eq!(parsed.material_g, Some(4.55));
        assert_eq!(parsed.filament_mm, Some(1523.40));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1d 0h 1m"), Some(86_460));
        assert_eq!(parse_duration("45s"), Some(45));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert_eq!(parse_duration("300000000000000d"), None);
        assert_eq!(parse_duration("18446744073709551615s 1s"), None);
    }

    #[test]
    fn test_marker_values_are_not_estimated() {
        let config = SlicingConfig::standard();
        let stats = estimate(&parse_stats(ORCA), &config, &PrinterProfile::bambu_x1c());
        assert!(!stats.estimated);
        assert_eq!(stats.total_layers, 87);
        assert_eq!(stats.material_g, 4.55);
    }

    #[test]
    fn test_filament_length_converts_to_mass() {
        let config = SlicingConfig::standard();
        let stats = estimate(&parse_stats(CURA), &config, &PrinterProfile::generic());
        // 2500 mm of 1.75 mm PLA is about 7.45 g
        assert!((stats.material_g - 7.45).abs() < 0.05, "{}", stats.material_g);
        assert!(!stats.estimated);
    }

    #[test]
    fn test_fallback_is_positive_and_deterministic() {
        let config = SlicingConfig::builder()
            .layer_height(0.2)
            .infill_density(0)
            .build()
            .unwrap();
        let profile = PrinterProfile::generic();
        let a = estimate(&parse_stats("G28\nG1 X0\n"), &config, &profile);
        let b = estimate(&ParsedStats::default(), &config, &profile);
        assert!(a.estimated);
        assert_eq!(a, b);
        assert_eq!(a.total_layers, 250);
        assert!(a.time_secs > 0);
        assert!(a.material_g > 0.0);
    }

    #[test]
    fn test_layers_seen_used_without_count() {
        let parsed = parse_stats(";LAYER:0\n;LAYER:1\n;LAYER:2\n;TIME:100\n");
        let stats = estimate(&parsed, &SlicingConfig::standard(), &PrinterProfile::generic());
        assert_eq!(stats.total_layers, 3);
        assert_eq!(stats.time_secs, 100);
        assert!(stats.estimated);
    }
}
