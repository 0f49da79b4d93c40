use std::fs;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use muster_types::InstallResult;

use crate::cache::ManagedDirs;

/// Reports older than the last run kept in `Archives/`.
const MAX_ARCHIVED_REPORTS: usize = 100;

/// The run report: what the run saw, planned, did, and complained about.
/// Accumulated in memory and persisted at run end.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Report {
    #[serde(rename = "StartTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "EndTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(rename = "MachineInfo", default, skip_serializing_if = "plist::Dictionary::is_empty")]
    pub machine_info: plist::Dictionary,
    #[serde(rename = "Conditions", default, skip_serializing_if = "plist::Dictionary::is_empty")]
    pub conditions: plist::Dictionary,
    #[serde(rename = "ManifestName", default, skip_serializing_if = "Option::is_none")]
    pub manifest_name: Option<String>,
    #[serde(rename = "ItemsToInstall", default, skip_serializing_if = "Vec::is_empty")]
    pub items_to_install: Vec<plist::Dictionary>,
    #[serde(rename = "ItemsToRemove", default, skip_serializing_if = "Vec::is_empty")]
    pub items_to_remove: Vec<plist::Dictionary>,
    #[serde(rename = "InstallResults", default, skip_serializing_if = "Vec::is_empty")]
    pub install_results: Vec<InstallResult>,
    #[serde(rename = "RemovalResults", default, skip_serializing_if = "Vec::is_empty")]
    pub removal_results: Vec<InstallResult>,
    #[serde(rename = "Warnings", default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(rename = "Errors", default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Report {
    pub fn start() -> Report {
        Report {
            start_time: Some(timestamp()),
            ..Default::default()
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{}", message);
        self.errors.push(message);
    }

    /// Archives the previous on-disk report, then persists this one.
    pub fn save(&mut self, dirs: &ManagedDirs) {
        self.end_time = Some(timestamp());
        let path = dirs.report_path();
        if path.exists() {
            archive_previous(dirs);
        }
        if let Err(e) = plist::to_file_xml(&path, self) {
            log::error!("Could not write run report: {}", e);
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn archive_previous(dirs: &ManagedDirs) {
    let archive_dir = dirs.archives_dir();
    let _ = fs::create_dir_all(&archive_dir);
    let stamp = Utc::now().format("%Y-%m-%d-%H%M%S");
    let dest = archive_dir.join(format!("ManagedInstallReport-{}.plist", stamp));
    if let Err(e) = fs::rename(dirs.report_path(), &dest) {
        log::warn!("Could not archive previous report: {}", e);
        return;
    }

    // Prune to the newest MAX_ARCHIVED_REPORTS.
    let mut archived: Vec<_> = match fs::read_dir(&archive_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |e| e == "plist"))
            .collect(),
        Err(_) => return,
    };
    if archived.len() <= MAX_ARCHIVED_REPORTS {
        return;
    }
    archived.sort();
    let excess = archived.len() - MAX_ARCHIVED_REPORTS;
    for path in archived.into_iter().take(excess) {
        let _ = fs::remove_file(path);
    }
}
