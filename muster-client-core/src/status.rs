use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use md5::{Digest, Md5};

use muster_types::{InstallerType, InstallsEntry, LooseVersion, PkgInfo};

use crate::conditions::{FactValue, Facts};
use crate::platform::{EmbeddedScriptRunner, ProfileStore};

/// Three-way answer for "is this item installed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstalledState {
    NotInstalled,
    SameVersionInstalled,
    NewerVersionInstalled,
}

/// An application found on the machine, keyed by bundle identifier.
#[derive(Debug, Clone, Default)]
pub struct InstalledApp {
    pub version: String,
    pub path: String,
}

/// Answers installation-state questions for catalog items by weighing the
/// declared evidence: check scripts, OS versions, profiles, install probes,
/// then receipts.
pub struct StatusOracle<'a> {
    /// Filesystem root the probes resolve against; `/` in production.
    pub fs_root: PathBuf,
    pub facts: &'a Facts,
    /// Platform receipt database contents: packageid -> version.
    pub receipts: &'a HashMap<String, String>,
    /// Application inventory: bundle id -> installed app.
    pub apps: &'a HashMap<String, InstalledApp>,
    pub scripts: Option<&'a dyn EmbeddedScriptRunner>,
    pub profiles: Option<&'a dyn ProfileStore>,
}

fn compare_versions(actual: &str, expected: &str) -> InstalledState {
    let actual = LooseVersion::new(actual);
    let expected = LooseVersion::new(expected);
    if actual < expected {
        InstalledState::NotInstalled
    } else if actual == expected {
        InstalledState::SameVersionInstalled
    } else {
        InstalledState::NewerVersionInstalled
    }
}

/// Any `NotInstalled` wins; any `Newer` without a `NotInstalled` wins; all
/// same means same.
fn aggregate(states: impl IntoIterator<Item = InstalledState>) -> InstalledState {
    let mut out = InstalledState::SameVersionInstalled;
    let mut any = false;
    for state in states {
        any = true;
        match state {
            InstalledState::NotInstalled => return InstalledState::NotInstalled,
            InstalledState::NewerVersionInstalled => out = InstalledState::NewerVersionInstalled,
            InstalledState::SameVersionInstalled => {}
        }
    }
    if any {
        out
    } else {
        InstalledState::NotInstalled
    }
}

impl<'a> StatusOracle<'a> {
    fn resolve(&self, path: &str) -> PathBuf {
        self.fs_root.join(path.trim_start_matches('/'))
    }

    fn os_version(&self) -> String {
        match self.facts.get("os_vers") {
            Some(FactValue::Str(s)) => s.clone(),
            _ => String::new(),
        }
    }

    fn run_check_script(&self, label: &str, content: &str, item: &PkgInfo) -> Option<i32> {
        let runner = self.scripts?;
        match runner.run_script(label, content, item) {
            Ok(code) => Some(code),
            Err(e) => {
                log::warn!("{} for {} could not be run: {}", label, item.name, e);
                None
            }
        }
    }

    fn profile_identifier(item: &PkgInfo) -> String {
        item.extra
            .get("PayloadIdentifier")
            .and_then(|v| v.as_string())
            .map(str::to_string)
            .unwrap_or_else(|| item.name.clone())
    }

    fn bundle_version(&self, bundle_path: &Path) -> Option<String> {
        let info = bundle_path.join("Contents").join("Info.plist");
        let dict: plist::Dictionary = plist::from_file(info).ok()?;
        dict.get("CFBundleShortVersionString")
            .and_then(|v| v.as_string())
            .map(str::to_string)
    }

    fn probe_state(&self, entry: &InstallsEntry) -> InstalledState {
        match entry {
            InstallsEntry::Application {
                bundle_id,
                version,
                path,
            } => {
                let actual = if let Some(p) = path {
                    let full = self.resolve(p);
                    if !full.exists() {
                        return InstalledState::NotInstalled;
                    }
                    self.bundle_version(&full)
                } else if let Some(id) = bundle_id {
                    self.apps.get(id).map(|a| a.version.clone())
                } else {
                    None
                };
                match (actual, version) {
                    (None, _) => InstalledState::NotInstalled,
                    (Some(_), None) => InstalledState::SameVersionInstalled,
                    (Some(actual), Some(expected)) => compare_versions(&actual, expected),
                }
            }
            InstallsEntry::Bundle { path, version } => {
                let full = self.resolve(path);
                if !full.exists() {
                    return InstalledState::NotInstalled;
                }
                match version {
                    None => InstalledState::SameVersionInstalled,
                    Some(expected) => match self.bundle_version(&full) {
                        Some(actual) => compare_versions(&actual, expected),
                        None => InstalledState::NotInstalled,
                    },
                }
            }
            InstallsEntry::File { path, md5checksum } => {
                let full = self.resolve(path);
                if !full.exists() {
                    return InstalledState::NotInstalled;
                }
                match md5checksum {
                    None => InstalledState::SameVersionInstalled,
                    Some(expected) => match md5_of_file(&full) {
                        Some(actual) if actual.eq_ignore_ascii_case(expected) => {
                            InstalledState::SameVersionInstalled
                        }
                        _ => InstalledState::NotInstalled,
                    },
                }
            }
            InstallsEntry::Plist { path, version } => {
                let full = self.resolve(path);
                let dict: Option<plist::Dictionary> = plist::from_file(&full).ok();
                let dict = match dict {
                    Some(d) => d,
                    None => return InstalledState::NotInstalled,
                };
                match version {
                    None => InstalledState::SameVersionInstalled,
                    Some(expected) => {
                        match dict
                            .get("CFBundleShortVersionString")
                            .and_then(|v| v.as_string())
                        {
                            Some(actual) => compare_versions(actual, expected),
                            None => InstalledState::NotInstalled,
                        }
                    }
                }
            }
            InstallsEntry::StartosinstallApp { version, .. } => match version {
                Some(expected) => compare_versions(&self.os_version(), expected),
                None => InstalledState::SameVersionInstalled,
            },
            InstallsEntry::Unknown => InstalledState::SameVersionInstalled,
        }
    }

    fn probe_exists(&self, entry: &InstallsEntry) -> bool {
        match entry {
            InstallsEntry::Application {
                bundle_id, path, ..
            } => {
                if let Some(p) = path {
                    return self.resolve(p).exists();
                }
                bundle_id
                    .as_ref()
                    .map_or(false, |id| self.apps.contains_key(id))
            }
            InstallsEntry::Bundle { path, .. }
            | InstallsEntry::File { path, .. }
            | InstallsEntry::Plist { path, .. } => self.resolve(path).exists(),
            InstallsEntry::StartosinstallApp { .. } | InstallsEntry::Unknown => true,
        }
    }

    /// The planner's central question for installs.
    pub fn installed_state(&self, item: &PkgInfo) -> InstalledState {
        // On-demand items are always "not installed" so they re-run.
        if item.on_demand {
            return InstalledState::NotInstalled;
        }

        if let Some(script) = &item.installcheck_script {
            if let Some(code) = self.run_check_script("installcheck_script", script, item) {
                return if code == 0 {
                    InstalledState::NotInstalled
                } else {
                    InstalledState::SameVersionInstalled
                };
            }
        }

        match item.installer_kind() {
            InstallerType::StartOsInstall | InstallerType::StageOsInstaller => {
                return compare_versions(&self.os_version(), &item.version);
            }
            InstallerType::Profile => {
                let installed = self
                    .profiles
                    .map(|p| p.is_installed(&Self::profile_identifier(item)))
                    .unwrap_or(false);
                return if installed {
                    InstalledState::SameVersionInstalled
                } else {
                    InstalledState::NotInstalled
                };
            }
            _ => {}
        }

        if !item.installs.is_empty() {
            return aggregate(item.installs.iter().map(|e| self.probe_state(e)));
        }

        if !item.receipts.is_empty() {
            return aggregate(item.receipts.iter().filter(|r| !r.optional).map(|r| {
                match self.receipts.get(&r.packageid) {
                    Some(installed_version) => compare_versions(installed_version, &r.version),
                    None => InstalledState::NotInstalled,
                }
            }));
        }

        InstalledState::NotInstalled
    }

    /// Version-insensitive: is any version of this item present? Drives
    /// "should we offer this as an update".
    pub fn some_version_installed(&self, item: &PkgInfo) -> bool {
        if item.on_demand {
            return false;
        }
        if let Some(script) = &item.installcheck_script {
            if let Some(code) = self.run_check_script("installcheck_script", script, item) {
                return code != 0;
            }
        }
        match item.installer_kind() {
            InstallerType::StartOsInstall | InstallerType::StageOsInstaller => {
                return self.installed_state(item) != InstalledState::NotInstalled;
            }
            InstallerType::Profile => {
                return self
                    .profiles
                    .map(|p| p.is_installed(&Self::profile_identifier(item)))
                    .unwrap_or(false);
            }
            _ => {}
        }
        if !item.installs.is_empty() {
            return item.installs.iter().all(|e| self.probe_exists(e));
        }
        if !item.receipts.is_empty() {
            return item
                .receipts
                .iter()
                .filter(|r| !r.optional)
                .all(|r| self.receipts.contains_key(&r.packageid));
        }
        false
    }

    /// Looser still, consulted before uninstalls: any probe finding the item
    /// is enough, so removals do not silently skip.
    pub fn evidence_this_is_installed(&self, item: &PkgInfo) -> bool {
        if let Some(script) = &item.uninstallcheck_script {
            if let Some(code) = self.run_check_script("uninstallcheck_script", script, item) {
                return code == 0;
            }
        }
        if item.on_demand {
            return true;
        }
        if let Some(script) = &item.installcheck_script {
            if let Some(code) = self.run_check_script("installcheck_script", script, item) {
                return code != 0;
            }
        }
        if item.installer_kind() == InstallerType::Profile {
            return self
                .profiles
                .map(|p| p.is_installed(&Self::profile_identifier(item)))
                .unwrap_or(false);
        }
        if !item.installs.is_empty() {
            return item.installs.iter().any(|e| self.probe_exists(e));
        }
        if !item.receipts.is_empty() {
            return item
                .receipts
                .iter()
                .any(|r| self.receipts.contains_key(&r.packageid));
        }
        false
    }
}

fn md5_of_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

/// Scans `<root>/Applications` (one directory level deep) for app bundles
/// and builds the bundle-id inventory the application probes consult.
pub fn scan_applications(fs_root: &Path) -> HashMap<String, InstalledApp> {
    let mut out = HashMap::new();
    let apps_dir = fs_root.join("Applications");
    let entries = match std::fs::read_dir(&apps_dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |e| e != "app") {
            continue;
        }
        let info = path.join("Contents").join("Info.plist");
        let dict: plist::Dictionary = match plist::from_file(&info) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let bundle_id = match dict.get("CFBundleIdentifier").and_then(|v| v.as_string()) {
            Some(id) => id.to_string(),
            None => continue,
        };
        let version = dict
            .get("CFBundleShortVersionString")
            .and_then(|v| v.as_string())
            .unwrap_or("")
            .to_string();
        out.insert(
            bundle_id,
            InstalledApp {
                version,
                path: path.to_string_lossy().into_owned(),
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_types::Receipt;

    fn facts() -> Facts {
        let mut f = Facts::new();
        f.insert("os_vers".into(), FactValue::Str("14.4".into()));
        f
    }

    fn oracle<'a>(
        root: &Path,
        facts: &'a Facts,
        receipts: &'a HashMap<String, String>,
        apps: &'a HashMap<String, InstalledApp>,
    ) -> StatusOracle<'a> {
        StatusOracle {
            fs_root: root.to_path_buf(),
            facts,
            receipts,
            apps,
            scripts: None,
            profiles: None,
        }
    }

    #[test]
    fn test_file_probe() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("usr/local")).unwrap();
        std::fs::write(tmp.path().join("usr/local/tool"), b"bits").unwrap();

        let facts = facts();
        let receipts = HashMap::new();
        let apps = HashMap::new();
        let oracle = oracle(tmp.path(), &facts, &receipts, &apps);

        let mut item = PkgInfo::default();
        item.name = "Tool".into();
        item.version = "1.0".into();
        item.installs = vec![InstallsEntry::File {
            path: "/usr/local/tool".into(),
            md5checksum: None,
        }];
        assert_eq!(oracle.installed_state(&item), InstalledState::SameVersionInstalled);
        assert!(oracle.some_version_installed(&item));
        assert!(oracle.evidence_this_is_installed(&item));

        item.installs = vec![InstallsEntry::File {
            path: "/usr/local/missing".into(),
            md5checksum: None,
        }];
        assert_eq!(oracle.installed_state(&item), InstalledState::NotInstalled);
        assert!(!oracle.evidence_this_is_installed(&item));
    }

    #[test]
    fn test_application_probe_against_inventory() {
        let tmp = tempfile::tempdir().unwrap();
        let facts = facts();
        let receipts = HashMap::new();
        let mut apps = HashMap::new();
        apps.insert(
            "com.x.a".to_string(),
            InstalledApp {
                version: "1.0".into(),
                path: "/Applications/AppA.app".into(),
            },
        );
        let oracle = oracle(tmp.path(), &facts, &receipts, &apps);

        let mut item = PkgInfo::default();
        item.name = "AppA".into();
        item.version = "2.0".into();
        item.installs = vec![InstallsEntry::Application {
            bundle_id: Some("com.x.a".into()),
            version: Some("2.0".into()),
            path: None,
        }];
        // 1.0 installed, 2.0 wanted.
        assert_eq!(oracle.installed_state(&item), InstalledState::NotInstalled);
        assert!(oracle.some_version_installed(&item));

        item.installs = vec![InstallsEntry::Application {
            bundle_id: Some("com.x.a".into()),
            version: Some("0.5".into()),
            path: None,
        }];
        assert_eq!(
            oracle.installed_state(&item),
            InstalledState::NewerVersionInstalled
        );
    }

    #[test]
    fn test_receipt_aggregation() {
        let tmp = tempfile::tempdir().unwrap();
        let facts = facts();
        let mut receipts = HashMap::new();
        receipts.insert("com.x.core".to_string(), "2.0".to_string());
        let apps = HashMap::new();
        let oracle = oracle(tmp.path(), &facts, &receipts, &apps);

        let mut item = PkgInfo::default();
        item.name = "Suite".into();
        item.version = "2.0".into();
        item.receipts = vec![
            Receipt {
                packageid: "com.x.core".into(),
                version: "2.0".into(),
                ..Default::default()
            },
            Receipt {
                packageid: "com.x.extras".into(),
                version: "2.0".into(),
                optional: true,
                ..Default::default()
            },
        ];
        // Optional receipt missing does not block.
        assert_eq!(
            oracle.installed_state(&item),
            InstalledState::SameVersionInstalled
        );

        item.receipts[1].optional = false;
        assert_eq!(oracle.installed_state(&item), InstalledState::NotInstalled);
    }

    #[test]
    fn test_on_demand_always_not_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let facts = facts();
        let receipts = HashMap::new();
        let apps = HashMap::new();
        let oracle = oracle(tmp.path(), &facts, &receipts, &apps);

        let mut item = PkgInfo::default();
        item.name = "RunAlways".into();
        item.version = "1.0".into();
        item.on_demand = true;
        assert_eq!(oracle.installed_state(&item), InstalledState::NotInstalled);
        assert!(!oracle.some_version_installed(&item));
        assert!(oracle.evidence_this_is_installed(&item));
    }

    #[test]
    fn test_os_installer_compares_os_version() {
        let tmp = tempfile::tempdir().unwrap();
        let facts = facts();
        let receipts = HashMap::new();
        let apps = HashMap::new();
        let oracle = oracle(tmp.path(), &facts, &receipts, &apps);

        let mut item = PkgInfo::default();
        item.name = "OSUpgrade".into();
        item.version = "15.0".into();
        item.installer_type = Some(InstallerType::StartOsInstall);
        assert_eq!(oracle.installed_state(&item), InstalledState::NotInstalled);

        item.version = "14.4".into();
        assert_eq!(
            oracle.installed_state(&item),
            InstalledState::SameVersionInstalled
        );
        item.version = "13.0".into();
        assert_eq!(
            oracle.installed_state(&item),
            InstalledState::NewerVersionInstalled
        );
    }
}
