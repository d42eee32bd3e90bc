//! `.gcode.3mf` containers for Bambu printers.
//!
//! A container is a 3MF package whose plate carries a pre-sliced toolpath at
//! `Metadata/plate_1.gcode`. The payload is stored byte for byte, so
//! [`unwrap`] returns exactly what [`wrap`] was given.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use printloom_core::SlicingConfig;
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{BambuError, Result};

/// Archive path of the toolpath payload.
pub const PAYLOAD_ENTRY: &str = "Metadata/plate_1.gcode";

/// Archive path of the optional plate thumbnail.
pub const THUMBNAIL_ENTRY: &str = "Metadata/plate_1.png";

/// Entries every container must have.
pub const REQUIRED_ENTRIES: [&str; 7] = [
    "[Content_Types].xml",
    "_rels/.rels",
    "3D/3dmodel.model",
    PAYLOAD_ENTRY,
    "Metadata/plate_1.json",
    "Metadata/model_settings.config",
    "Metadata/slice_info.config",
];

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
    <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
    <Default Extension="model" ContentType="application/vnd.ms-package.3dmanufacturing-3dmodel+xml"/>
    <Default Extension="gcode" ContentType="text/x.gcode"/>
    <Default Extension="json" ContentType="application/json"/>
    <Default Extension="config" ContentType="text/xml"/>
    <Default Extension="png" ContentType="image/png"/>
</Types>"#;

const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
    <Relationship Target="/3D/3dmodel.model" Id="rel-1" Type="http://schemas.microsoft.com/3dmanufacturing/2013/01/3dmodel"/>
</Relationships>"#;

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Descriptive data written next to the payload.
#[derive(Debug, Clone, Default)]
pub struct ContainerMetadata {
    /// Printer model name, e.g. "Bambu Lab X1 Carbon".
    pub printer_model: Option<String>,
    /// Settings the toolpath was sliced with.
    pub settings: Option<SlicingConfig>,
    /// Estimated print time (s).
    pub estimated_secs: Option<u64>,
    /// Estimated material (g).
    pub estimated_material_g: Option<f64>,
    /// PNG preview to embed.
    pub thumbnail: Option<PathBuf>,
}

#[derive(Serialize)]
struct Entry {
    #[serde(rename = "@key")]
    key: &'static str,
    #[serde(rename = "@value")]
    value: String,
}

fn entry(key: &'static str, value: impl ToString) -> Entry {
    Entry {
        key,
        value: value.to_string(),
    }
}

#[derive(Serialize)]
struct Plate {
    metadata: Vec<Entry>,
}

#[derive(Serialize)]
struct Header {
    header_item: Vec<Entry>,
}

#[derive(Serialize)]
struct SliceInfo {
    header: Header,
    plate: Plate,
}

#[derive(Serialize)]
struct ModelSettings {
    plate: Plate,
}

fn to_xml<T: Serialize>(value: &T) -> Result<String> {
    let body = quick_xml::se::to_string_with_root("config", value)
        .map_err(|e| BambuError::Conversion(e.to_string()))?;
    Ok(format!("{XML_DECL}{body}"))
}

impl ContainerMetadata {
    fn model_xml(&self) -> String {
        format!(
            r#"{XML_DECL}<model unit="millimeter" xml:lang="en-US" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02" xmlns:p="http://schemas.microsoft.com/3dmanufacturing/production/2015/06">
    <metadata name="Application">printloom-{}</metadata>
    <resources/>
    <build/>
</model>"#,
            env!("CARGO_PKG_VERSION")
        )
    }

    fn plate_json(&self) -> String {
        serde_json::json!({
            "plate_index": 1,
            "plate_name": "Plate 1",
            "printer_model": self.printer_model,
            "prediction": self.estimated_secs,
            "weight": self.estimated_material_g,
            "objects": []
        })
        .to_string()
    }

    fn model_settings_xml(&self) -> Result<String> {
        let mut metadata = vec![
            entry("plater_id", 1),
            entry("plater_name", "Plate 1"),
            entry("locked", false),
            entry("gcode_file", PAYLOAD_ENTRY),
        ];
        if self.thumbnail.is_some() {
            metadata.push(entry("thumbnail_file", THUMBNAIL_ENTRY));
        }
        to_xml(&ModelSettings {
            plate: Plate { metadata },
        })
    }

    fn slice_info_xml(&self) -> Result<String> {
        let header = Header {
            header_item: vec![
                entry("X-BBL-Client-Type", "slicer"),
                entry("X-BBL-Client-Version", env!("CARGO_PKG_VERSION")),
            ],
        };

        let mut metadata = vec![entry("index", 1)];
        if let Some(model) = &self.printer_model {
            metadata.push(entry("printer_model", model));
        }
        if let Some(secs) = self.estimated_secs {
            metadata.push(entry("prediction", secs));
        }
        if let Some(grams) = self.estimated_material_g {
            metadata.push(entry("weight", format!("{grams:.2}")));
        }
        if let Some(settings) = &self.settings {
            metadata.extend([
                entry("layer_height", settings.layer_height()),
                entry("sparse_infill_density", format!("{}%", settings.infill_density())),
                entry("print_speed", settings.print_speed()),
                entry("support_used", settings.support_enabled()),
                entry("filament_type", settings.material().as_str()),
                entry("nozzle_temperature", settings.nozzle_temperature()),
                entry("bed_temperature", settings.bed_temperature()),
            ]);
        }

        to_xml(&SliceInfo {
            header,
            plate: Plate { metadata },
        })
    }
}

/// Container path for a toolpath: `cube.gcode` becomes `cube.gcode.3mf`.
pub fn container_path(toolpath: &Path) -> PathBuf {
    let name = toolpath
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".gcode").unwrap_or(&name);
    toolpath.with_file_name(format!("{stem}.gcode.3mf"))
}

/// Package a toolpath payload in memory.
pub fn wrap_bytes(payload: &[u8], metadata: &ContainerMetadata) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(BambuError::Conversion("toolpath is empty".into()));
    }

    let thumbnail = match &metadata.thumbnail {
        Some(path) => Some(std::fs::read(path).map_err(|e| {
            BambuError::Conversion(format!("cannot read thumbnail {}: {e}", path.display()))
        })?),
        None => None,
    };

    let mut buffer = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut buffer);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    let entries: [(&str, Vec<u8>); 6] = [
        ("[Content_Types].xml", CONTENT_TYPES.as_bytes().to_vec()),
        ("_rels/.rels", RELS.as_bytes().to_vec()),
        ("3D/3dmodel.model", metadata.model_xml().into_bytes()),
        ("Metadata/plate_1.json", metadata.plate_json().into_bytes()),
        ("Metadata/model_settings.config", metadata.model_settings_xml()?.into_bytes()),
        ("Metadata/slice_info.config", metadata.slice_info_xml()?.into_bytes()),
    ];
    for (name, body) in entries {
        zip.start_file(name, options)?;
        zip.write_all(&body)?;
    }

    zip.start_file(PAYLOAD_ENTRY, options)?;
    zip.write_all(payload)?;

    if let Some(png) = thumbnail {
        zip.start_file(THUMBNAIL_ENTRY, options)?;
        zip.write_all(&png)?;
    }

    zip.finish()?;
    Ok(buffer.into_inner())
}

/// Package `toolpath` into `output`, replacing it atomically.
pub fn wrap_to(toolpath: &Path, output: &Path, metadata: &ContainerMetadata) -> Result<()> {
    let payload = std::fs::read(toolpath).map_err(|e| {
        BambuError::Conversion(format!("cannot read toolpath {}: {e}", toolpath.display()))
    })?;
    let bytes = wrap_bytes(&payload, metadata)?;

    let partial = output.with_extension("3mf.part");
    std::fs::write(&partial, bytes)?;
    std::fs::rename(&partial, output)?;
    tracing::debug!(toolpath = %toolpath.display(), container = %output.display(), "packaged toolpath");
    Ok(())
}

/// Package `toolpath` next to itself and return the container path.
pub fn wrap(toolpath: &Path, metadata: &ContainerMetadata) -> Result<PathBuf> {
    let output = container_path(toolpath);
    wrap_to(toolpath, &output, metadata)?;
    Ok(output)
}

/// Extract the toolpath payload.
pub fn unwrap(container: &Path) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(container)?)?;
    let mut entry = archive
        .by_name(PAYLOAD_ENTRY)
        .map_err(|_| BambuError::Conversion(format!("{PAYLOAD_ENTRY} missing")))?;
    let mut payload = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut payload)?;
    Ok(payload)
}

/// Check that a container has every required entry and a non-empty payload.
pub fn validate(container: &Path) -> Result<()> {
    let archive = ZipArchive::new(File::open(container)?)?;
    let names: Vec<&str> = archive.file_names().collect();

    let missing: Vec<&str> = REQUIRED_ENTRIES
        .iter()
        .copied()
        .filter(|required| !names.contains(required))
        .collect();
    if !missing.is_empty() {
        return Err(BambuError::Conversion(format!("missing entries: {}", missing.join(", "))));
    }

    if unwrap(container)?.is_empty() {
        return Err(BambuError::Conversion("toolpath payload is empty".into()));
    }
    Ok(())
}
