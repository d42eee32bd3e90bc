//! Bambu printer commands.
//!
//! Commands are published on `device/<serial>/request`. The printer never
//! replies to them directly; their effect shows up in later reports.

use serde_json::json;

/// Command to send to the printer.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterCommand {
    /// Request a full status push.
    PushAll,
    /// Start printing an uploaded container.
    ProjectFile {
        /// File name on the device storage.
        file: String,
        /// 1-based plate inside the container.
        plate: u32,
        /// Feed filament from the AMS.
        use_ams: bool,
    },
    /// Pause current print.
    Pause,
    /// Resume paused print.
    Resume,
    /// Stop current print.
    Stop,
}

impl PrinterCommand {
    /// Start command with the defaults used for single-plate containers.
    pub fn project_file(file: impl Into<String>) -> Self {
        PrinterCommand::ProjectFile {
            file: file.into(),
            plate: 1,
            use_ams: false,
        }
    }

    /// Protocol verb.
    pub fn verb(&self) -> &'static str {
        match self {
            PrinterCommand::PushAll => "pushall",
            PrinterCommand::ProjectFile { .. } => "project_file",
            PrinterCommand::Pause => "pause",
            PrinterCommand::Resume => "resume",
            PrinterCommand::Stop => "stop",
        }
    }

    /// Convert command to JSON payload.
    pub fn to_json(&self, sequence_id: u64) -> serde_json::Value {
        let sequence_id = sequence_id.to_string();
        match self {
            PrinterCommand::PushAll => json!({
                "pushing": {
                    "sequence_id": sequence_id,
                    "command": "pushall"
                }
            }),

            PrinterCommand::ProjectFile { file, plate, use_ams } => {
                let subtask = file.strip_suffix(".gcode.3mf").unwrap_or(file);
                json!({
                    "print": {
                        "sequence_id": sequence_id,
                        "command": "project_file",
                        "param": format!("Metadata/plate_{plate}.gcode"),
                        "subtask_name": subtask,
                        "url": format!("file:///sdcard/{file}"),
                        "bed_type": "auto",
                        "timelapse": false,
                        "bed_leveling": true,
                        "flow_cali": false,
                        "vibration_cali": false,
                        "layer_inspect": false,
                        "use_ams": use_ams,
                        "profile_id": "0",
                        "project_id": "0",
                        "subtask_id": "0",
                        "task_id": "0"
                    }
                })
            }

            PrinterCommand::Pause | PrinterCommand::Resume | PrinterCommand::Stop => json!({
                "print": {
                    "sequence_id": sequence_id,
                    "command": self.verb()
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_all_command() {
        let json = PrinterCommand::PushAll.to_json(0);
        assert_eq!(json["pushing"]["command"], "pushall");
    }

    #[test]
    fn test_control_commands() {
        for (cmd, verb) in [
            (PrinterCommand::Pause, "pause"),
            (PrinterCommand::Resume, "resume"),
            (PrinterCommand::Stop, "stop"),
        ] {
            let json = cmd.to_json(7);
            assert_eq!(json["print"]["command"].as_str(), Some(verb));
            assert_eq!(json["print"]["sequence_id"], "7");
        }
    }

    #[test]
    fn test_project_file() {
        let json = PrinterCommand::project_file("benchy.gcode.3mf").to_json(3);
        let print = &json["print"];
        assert_eq!(print["command"], "project_file");
        assert_eq!(print["param"], "Metadata/plate_1.gcode");
        assert_eq!(print["subtask_name"], "benchy");
        assert_eq!(print["url"], "file:///sdcard/benchy.gcode.3mf");
        assert_eq!(print["use_ams"], false);
    }
}
