use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::version::trim_version;

/// A catalog document is a flat list of item records.
pub type Catalog = Vec<PkgInfo>;

/// The closed set of installer subtypes the executor dispatches on.
///
/// Serialized as the raw `installer_type` string; an absent key means a flat
/// or bundle package handled by the platform installer tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstallerType {
    Package,
    CopyFromDmg,
    NoPkg,
    StartOsInstall,
    StageOsInstaller,
    Profile,
    Adobe(String),
    Other(String),
}

impl Default for InstallerType {
    fn default() -> Self {
        InstallerType::Package
    }
}

impl FromStr for InstallerType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => InstallerType::Package,
            "copy_from_dmg" => InstallerType::CopyFromDmg,
            "nopkg" => InstallerType::NoPkg,
            "startosinstall" => InstallerType::StartOsInstall,
            "stage_os_installer" => InstallerType::StageOsInstaller,
            "profile" => InstallerType::Profile,
            other if other.starts_with("Adobe") => InstallerType::Adobe(other.to_string()),
            other => InstallerType::Other(other.to_string()),
        })
    }
}

impl Display for InstallerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallerType::Package => "",
            InstallerType::CopyFromDmg => "copy_from_dmg",
            InstallerType::NoPkg => "nopkg",
            InstallerType::StartOsInstall => "startosinstall",
            InstallerType::StageOsInstaller => "stage_os_installer",
            InstallerType::Profile => "profile",
            InstallerType::Adobe(s) | InstallerType::Other(s) => s,
        };
        f.write_str(s)
    }
}

impl Serialize for InstallerType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InstallerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

/// Restart requirement declared by an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RestartAction {
    #[default]
    None,
    RequireLogout,
    RecommendRestart,
    RequireRestart,
    RequireShutdown,
}

impl RestartAction {
    pub fn is_none(&self) -> bool {
        *self == RestartAction::None
    }

    pub fn post_action(&self) -> PostAction {
        match self {
            RestartAction::None => PostAction::None,
            RestartAction::RequireLogout => PostAction::Logout,
            RestartAction::RecommendRestart | RestartAction::RequireRestart => PostAction::Restart,
            RestartAction::RequireShutdown => PostAction::Shutdown,
        }
    }
}

/// What the machine must do once a run completes. Aggregated across items by
/// maximum weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PostAction {
    #[default]
    None,
    Logout,
    Restart,
    Shutdown,
}

/// How an installed item is taken off the machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UninstallMethod {
    RemovePackages,
    RemoveCopiedItems,
    RemoveApp,
    UninstallScript,
    RemoveProfile,
    Other(String),
}

impl FromStr for UninstallMethod {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "removepackages" => UninstallMethod::RemovePackages,
            "remove_copied_items" => UninstallMethod::RemoveCopiedItems,
            "remove_app" => UninstallMethod::RemoveApp,
            "uninstall_script" => UninstallMethod::UninstallScript,
            "remove_profile" => UninstallMethod::RemoveProfile,
            other => UninstallMethod::Other(other.to_string()),
        })
    }
}

impl Display for UninstallMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            UninstallMethod::RemovePackages => "removepackages",
            UninstallMethod::RemoveCopiedItems => "remove_copied_items",
            UninstallMethod::RemoveApp => "remove_app",
            UninstallMethod::UninstallScript => "uninstall_script",
            UninstallMethod::RemoveProfile => "remove_profile",
            UninstallMethod::Other(s) => s,
        };
        f.write_str(s)
    }
}

impl Serialize for UninstallMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UninstallMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(UninstallMethod::Other(String::new())))
    }
}

/// One install-evidence probe from an item's `installs` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstallsEntry {
    Application {
        #[serde(rename = "CFBundleIdentifier", default, skip_serializing_if = "Option::is_none")]
        bundle_id: Option<String>,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Bundle {
        path: String,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        version: Option<String>,
    },
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        md5checksum: Option<String>,
    },
    Plist {
        path: String,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        version: Option<String>,
    },
    StartosinstallApp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(
            rename = "CFBundleShortVersionString",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        version: Option<String>,
    },
    /// Probe types this client does not understand are carried but treated
    /// as satisfied, so one exotic probe does not force endless reinstalls.
    #[serde(other)]
    Unknown,
}

/// A platform package receipt declared by an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Receipt {
    #[serde(default)]
    pub packageid: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One entry of a `copy_from_dmg` item's `items_to_copy` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyItem {
    pub source_item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Policy block for the remove-if-unused feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnusedSoftwareRemovalInfo {
    #[serde(default)]
    pub removal_days: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundle_ids: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The canonical catalog record for one software item.
///
/// Unknown keys are preserved in `extra` so the planner can forward them into
/// the plan untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PkgInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catalogs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_hash: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub featured: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub precache: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update_for: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installs: Vec<InstallsEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receipts: Vec<Receipt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_type: Option<InstallerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_item_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_item_hash: Option<String>,
    /// Kilobytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_item_size: Option<u64>,
    /// Kilobytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items_to_copy: Vec<CopyItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall_method: Option<UninstallMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstaller_item_location: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub uninstallable: bool,

    #[serde(rename = "RestartAction", default, skip_serializing_if = "RestartAction::is_none")]
    pub restart_action: RestartAction,
    /// `None` means "derive from the installs list"; an explicit empty list
    /// disables blocking entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_applications: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unattended_install: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unattended_uninstall: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_install_after_date: Option<plist::Date>,
    #[serde(rename = "OnDemand", default, skip_serializing_if = "is_false")]
    pub on_demand: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub autoremove: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unused_software_removal_info: Option<UnusedSoftwareRemovalInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_muster_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_architectures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installable_condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preinstall_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postinstall_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preuninstall_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postuninstall_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installcheck_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstallcheck_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall_script: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preinstall_alert: Option<plist::Dictionary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preuninstall_alert: Option<plist::Dictionary>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub installer_environment: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: plist::Dictionary,
}

impl PkgInfo {
    pub fn installer_kind(&self) -> InstallerType {
        self.installer_type.clone().unwrap_or_default()
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// `Name-Version`, the reference form used for versioned lookups.
    pub fn name_with_version(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn version_trimmed(&self) -> String {
        trim_version(&self.version)
    }

    /// Bundle identifiers supplied by application-style install probes; the
    /// implicit input to the unused-software policy and blocking checks.
    pub fn bundle_ids_from_installs(&self) -> Vec<&str> {
        self.installs
            .iter()
            .filter_map(|entry| match entry {
                InstallsEntry::Application { bundle_id: Some(id), .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Names of applications that, when running, defer unattended actions.
    pub fn blocking_application_names(&self) -> Vec<String> {
        if let Some(apps) = &self.blocking_applications {
            return apps.clone();
        }
        // No explicit key: application install probes stand in.
        self.installs
            .iter()
            .filter_map(|entry| match entry {
                InstallsEntry::Application { path: Some(p), .. } => file_name_string(p),
                _ => None,
            })
            .collect()
    }

    pub fn is_os_installer(&self) -> bool {
        matches!(
            self.installer_kind(),
            InstallerType::StartOsInstall | InstallerType::StageOsInstaller
        )
    }
}

fn file_name_string(p: &str) -> Option<String> {
    std::path::Path::new(p)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
