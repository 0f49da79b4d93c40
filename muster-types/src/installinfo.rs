use serde::{Deserialize, Serialize};

use crate::package::PkgInfo;

/// A planned install. The full catalog record is carried along (flattened)
/// so the executor and the UI see every forwarded key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstallItem {
    #[serde(flatten)]
    pub info: PkgInfo,

    /// Cache filename of the downloaded installer artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_to_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<bool>,
    /// Human-readable reason this item cannot proceed, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A planned removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RemovalItem {
    #[serde(flatten)]
    pub info: PkgInfo,

    /// Receipt identifiers to forget, already filtered for shared receipts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstaller_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A self-service catalog entry with its UI-facing status annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptionalItem {
    #[serde(flatten)]
    pub info: PkgInfo,

    #[serde(default)]
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub will_be_installed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub will_be_removed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licensed_seat_info_available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removal_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_to_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Outcome of applying one plan item. `status` 0 is success, non-zero the
/// failing tool or script exit code (negative for engine-level failures).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub status: i32,
    pub time: plist::Date,
    #[serde(default)]
    pub duration_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_kbytes_per_sec: Option<u32>,
    #[serde(default)]
    pub unattended: bool,
}

/// The persisted plan: the sole artifact between the planner and the
/// executor. Rewritten after each run to hold only residual work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstallInfo {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_installs: Vec<InstallItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removals: Vec<RemovalItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_updates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_installs: Vec<OptionalItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub featured_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problem_items: Vec<InstallItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processed_installs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processed_uninstalls: Vec<String>,
}

impl InstallInfo {
    /// True when the executor has something to do.
    pub fn needs_action(&self) -> bool {
        !self.managed_installs.is_empty() || !self.removals.is_empty()
    }

    pub fn install_count(&self) -> usize {
        self.managed_installs.len()
    }

    pub fn removal_count(&self) -> usize {
        self.removals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installinfo_roundtrip_equality() {
        let mut info = InstallInfo::default();
        let mut item = InstallItem::default();
        item.info.name = "AppB".into();
        item.info.version = "2.0".into();
        item.installer_item = Some("AppB-2.0.pkg".into());
        item.version_to_install = Some("2.0".into());
        info.managed_installs.push(item);
        info.processed_installs.push("AppB".into());

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &info).unwrap();
        let again: InstallInfo = plist::from_bytes(&buf).unwrap();
        assert_eq!(info, again);
        assert!(info.needs_action());
    }

    #[test]
    fn test_empty_plan_needs_no_action() {
        let info = InstallInfo::default();
        assert!(!info.needs_action());
        assert_eq!(info.install_count(), 0);
        assert_eq!(info.removal_count(), 0);
    }
}
