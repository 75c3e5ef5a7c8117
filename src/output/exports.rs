use anyhow::Result;
use serde::Serialize;
use std::io::Write;

use crate::cache::{Cached, UpdateInfo};
use crate::config::OutputFormat;
use crate::tracked::ConsolidatedStatus;

use super::report::HistoryReport;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusDocument<'a> {
    #[serde(flatten)]
    status: &'a ConsolidatedStatus,
    update_info: &'a UpdateInfo,
}

/// Writes a status in a machine-friendly format.
///
/// - JSON: the status with its `updateInfo` attached
/// - Text: the plain-text rendering, one entry per block
pub fn export_status(
    cached: &Cached<ConsolidatedStatus>,
    format: OutputFormat,
    pretty: bool,
    output: &mut dyn Write,
) -> Result<()> {
    match format {
        OutputFormat::Summary => {
            // Summary format is handled separately in cli.rs
            unreachable!("Summary format should be handled in CLI")
        }
        OutputFormat::Json => write_json(
            &StatusDocument {
                status: &cached.value,
                update_info: &cached.info,
            },
            pretty,
            output,
        ),
        OutputFormat::Text => {
            write!(output, "{}", cached.value)?;
            writeln!(
                output,
                "hash {} (refreshing: {}, running: {})",
                cached.info.hash_code_hex, cached.info.update_required, cached.info.running_updates
            )?;
            Ok(())
        }
    }
}

pub fn export_history(
    report: &HistoryReport,
    format: OutputFormat,
    pretty: bool,
    output: &mut dyn Write,
) -> Result<()> {
    match format {
        OutputFormat::Summary => {
            unreachable!("Summary format should be handled in CLI")
        }
        OutputFormat::Json => write_json(report, pretty, output),
        OutputFormat::Text => {
            write!(output, "{report}")?;
            Ok(())
        }
    }
}

/// Writes only the update info, for polling clients.
pub fn export_update_info(info: &UpdateInfo, pretty: bool, output: &mut dyn Write) -> Result<()> {
    write_json(info, pretty, output)
}

fn write_json<T: Serialize + ?Sized>(value: &T, pretty: bool, output: &mut dyn Write) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    writeln!(output, "{json}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PartialDataWarning;
    use std::sync::Arc;

    fn cached() -> Cached<ConsolidatedStatus> {
        let mut status = ConsolidatedStatus::new("master");
        status.warnings.push(PartialDataWarning::new("down", "unreachable"));
        status.post_process(1);
        Cached {
            value: Arc::new(status),
            info: UpdateInfo {
                update_required: false,
                running_updates: 1,
                hash_code_hex: "ff00".to_string(),
            },
        }
    }

    #[test]
    fn json_status_carries_update_info() {
        let mut buffer = Vec::new();
        export_status(&cached(), OutputFormat::Json, false, &mut buffer).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(value["trackedBranch"], "master");
        assert_eq!(value["runningUpdates"], 1);
        assert_eq!(value["updateInfo"]["hashCodeHex"], "ff00");
        assert_eq!(value["warnings"][0]["entity"], "down");
    }

    #[test]
    fn text_status_ends_with_hash() {
        let mut buffer = Vec::new();
        export_status(&cached(), OutputFormat::Text, false, &mut buffer).unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("master: 0 failed"));
        assert!(text.contains("warning: down: unreachable"));
        assert!(text.trim_end().ends_with("hash ff00 (refreshing: false, running: 1)"));
    }

    #[test]
    fn update_info_is_compact_unless_pretty() {
        let info = cached().info;

        let mut compact = Vec::new();
        export_update_info(&info, false, &mut compact).unwrap();
        let mut pretty = Vec::new();
        export_update_info(&info, true, &mut pretty).unwrap();

        assert_eq!(String::from_utf8(compact).unwrap().lines().count(), 1);
        assert!(String::from_utf8(pretty).unwrap().lines().count() > 1);
    }

    #[test]
    fn history_json_uses_camel_case() {
        let report = HistoryReport {
            tracked_branch: "master".to_string(),
            dates: vec!["19.02.2018".to_string()],
            rows: vec![],
            threshold: 0.2,
            low_pass_rate: vec![],
            warnings: vec![],
        };

        let mut buffer = Vec::new();
        export_history(&report, OutputFormat::Json, false, &mut buffer).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(value["trackedBranch"], "master");
        assert_eq!(value["lowPassRate"], serde_json::json!([]));
    }
}
