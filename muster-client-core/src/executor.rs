use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use thiserror::Error;

use muster_types::{
    split_name_and_version, InstallInfo, InstallItem, InstallResult, InstallerType, PostAction,
    RemovalItem, UninstallMethod,
};

use crate::cache::ManagedDirs;
use crate::fetch::sha256_of_file;
use crate::platform::{
    AdobeInstaller, DmgMounter, EmbeddedScriptRunner, EmptyReceiptOracle, InstallerRunner,
    LogNotifier, OsUpgradeRunner, ProcessOracle, ProfileStore, ReceiptOracle,
    SystemProcessOracle, UiNotifier,
};
use crate::prefs::Preferences;
use crate::report::Report;
use crate::scripts::sanitized_env;
use crate::selfservice;
use crate::stop;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("No install plan is present")]
    NoPlan,

    #[error("The install plan could not be read")]
    PlanUnreadable(#[source] plist::Error),
}

static LOG_NOTIFIER: LogNotifier = LogNotifier;
static EMPTY_RECEIPTS: EmptyReceiptOracle = EmptyReceiptOracle;
static SYSTEM_PROCESSES: SystemProcessOracle = SystemProcessOracle;

/// Consumes the persisted plan: removals first, then installs, with
/// skip-propagation, per-subtype dispatch, and restart aggregation.
pub struct Executor<'a> {
    pub prefs: &'a Preferences,
    pub dirs: &'a ManagedDirs,
    pub scripts: &'a dyn EmbeddedScriptRunner,
    pub ui: &'a dyn UiNotifier,
    pub processes: &'a dyn ProcessOracle,
    pub receipts: &'a dyn ReceiptOracle,
    pub installer: Option<&'a dyn InstallerRunner>,
    pub mounter: Option<&'a dyn DmgMounter>,
    pub profiles: Option<&'a dyn ProfileStore>,
    pub os_upgrade: Option<&'a dyn OsUpgradeRunner>,
    pub adobe: Option<&'a dyn AdobeInstaller>,
    pub console_user: Option<String>,
    /// Root that copy/remove file operations resolve against; `/` in
    /// production.
    pub fs_root: PathBuf,
}

struct RunState {
    results: Vec<InstallResult>,
    removal_results: Vec<InstallResult>,
    /// (name, version) of install items that failed or were skipped.
    skipped_installs: Vec<(String, String)>,
    /// Removal items that failed or were skipped, kept whole so dependents
    /// can be recognized.
    skipped_removals: Vec<RemovalItem>,
    residual_installs: Vec<InstallItem>,
    residual_removals: Vec<RemovalItem>,
    post_action: PostAction,
    applied_any: bool,
}

impl RunState {
    fn new() -> RunState {
        RunState {
            results: Vec::new(),
            removal_results: Vec::new(),
            skipped_installs: Vec::new(),
            skipped_removals: Vec::new(),
            residual_installs: Vec::new(),
            residual_removals: Vec::new(),
            post_action: PostAction::None,
            applied_any: false,
        }
    }
}

impl<'a> Executor<'a> {
    pub fn new(
        prefs: &'a Preferences,
        dirs: &'a ManagedDirs,
        scripts: &'a dyn EmbeddedScriptRunner,
    ) -> Executor<'a> {
        Executor {
            prefs,
            dirs,
            scripts,
            ui: &LOG_NOTIFIER,
            processes: &SYSTEM_PROCESSES,
            receipts: &EMPTY_RECEIPTS,
            installer: None,
            mounter: None,
            profiles: None,
            os_upgrade: None,
            adobe: None,
            console_user: None,
            fs_root: PathBuf::from("/"),
        }
    }

    /// Applies the plan from disk. Returns the aggregated post-action.
    pub fn run(&self, report: &mut Report, only_unattended: bool) -> Result<PostAction, ExecError> {
        let path = self.dirs.installinfo_path();
        if !path.exists() {
            return Err(ExecError::NoPlan);
        }
        let plan: InstallInfo = plist::from_file(&path).map_err(ExecError::PlanUnreadable)?;

        // Keep the machine awake for the duration; releasing is implicit at
        // process exit.
        log::debug!("Holding idle-sleep assertion for the install session");
        if self.prefs.boolean("SuppressStopButtonOnInstall") {
            self.ui.hide_stop_button();
        }

        let mut st = RunState::new();
        self.process_removals(report, &plan, only_unattended, &mut st);
        self.process_installs(report, &plan, only_unattended, &mut st);

        if self.prefs.boolean("InstallRequiresLogout") && st.applied_any {
            st.post_action = st.post_action.max(PostAction::Logout);
        }

        report.install_results.extend(st.results.iter().cloned());
        report.removal_results.extend(st.removal_results.iter().cloned());

        self.rewrite_installinfo(report, plan, &st);
        Ok(st.post_action)
    }

    // -- removals ----------------------------------------------------------

    fn process_removals(
        &self,
        report: &mut Report,
        plan: &InstallInfo,
        only_unattended: bool,
        st: &mut RunState,
    ) {
        let mut succeeded: Vec<String> = Vec::new();
        for item in &plan.removals {
            if stop::stop_requested() {
                log::info!("Stopping at removal item boundary");
                st.residual_removals.push(item.clone());
                continue;
            }

            if only_unattended && !self.removal_is_unattended(item) {
                log::debug!("Skipping {}: not an unattended removal", item.info.name);
                st.residual_removals.push(item.clone());
                continue;
            }
            if only_unattended && self.blocked(&item.info.blocking_application_names()) {
                log::info!("Skipping removal of {}: blocking applications are running", item.info.name);
                st.residual_removals.push(item.clone());
                continue;
            }

            // A removal is held back while a skipped removal still depends
            // on this item.
            let held_by: Vec<String> = st
                .skipped_removals
                .iter()
                .filter(|skipped| {
                    skipped
                        .info
                        .requires
                        .iter()
                        .chain(skipped.info.update_for.iter())
                        .any(|r| {
                            let (name, _) = split_name_and_version(r);
                            name == item.info.name
                        })
                })
                .map(|s| s.info.name.clone())
                .collect();
            if !held_by.is_empty() {
                let mut residual = item.clone();
                residual.note = Some(format!(
                    "Skipped because dependent items were not removed: {}",
                    held_by.join(", ")
                ));
                report.warn(format!(
                    "Skipping removal of {}: dependent items were not removed",
                    item.info.name
                ));
                st.skipped_removals.push(residual.clone());
                st.residual_removals.push(residual);
                continue;
            }

            self.ui
                .message(&format!("Removing {}...", item.info.display_name()));
            let started = Instant::now();
            let status = self.remove_one(report, item);
            let result = InstallResult {
                name: item.info.name.clone(),
                display_name: Some(item.info.display_name().to_string()),
                version: item.info.version.clone(),
                status,
                time: plist::Date::from(SystemTime::now()),
                duration_seconds: started.elapsed().as_secs() as u32,
                download_kbytes_per_sec: None,
                unattended: only_unattended,
            };
            st.removal_results.push(result);

            if status == 0 {
                st.applied_any = true;
                st.post_action = st.post_action.max(item.info.restart_action.post_action());
                succeeded.push(item.info.name.clone());
            } else {
                report.error(format!(
                    "Removal of {} failed with status {}",
                    item.info.name, status
                ));
                let mut residual = item.clone();
                residual.note = Some(format!("Removal failed with status {}", status));
                st.skipped_removals.push(residual.clone());
                st.residual_removals.push(residual);
            }
        }

        selfservice::prune_uninstalls(self.dirs, &succeeded);
    }

    fn remove_one(&self, report: &mut Report, item: &RemovalItem) -> i32 {
        if let Some(script) = &item.info.preuninstall_script {
            match self.scripts.run_script("preuninstall_script", script, &item.info) {
                Ok(0) => {}
                Ok(code) => return code,
                Err(e) => {
                    report.error(format!("preuninstall_script for {}: {}", item.info.name, e));
                    return -1;
                }
            }
        }

        let method = item
            .info
            .uninstall_method
            .clone()
            .unwrap_or(UninstallMethod::RemovePackages);
        let status = match method {
            UninstallMethod::RemovePackages => {
                let mut status = 0;
                for pkgid in &item.packages {
                    if let Err(e) = self.receipts.forget_package(pkgid) {
                        report.error(format!("Could not forget receipt {}: {}", pkgid, e));
                        status = -1;
                    }
                }
                status
            }
            UninstallMethod::UninstallScript => match &item.info.uninstall_script {
                Some(script) => self
                    .scripts
                    .run_script("uninstall_script", script, &item.info)
                    .unwrap_or(-1),
                None => {
                    report.error(format!(
                        "Item {} has no uninstall script",
                        item.info.name
                    ));
                    -1
                }
            },
            UninstallMethod::RemoveCopiedItems => self.remove_copied_items(report, item),
            UninstallMethod::RemoveApp => self.remove_app(report, item),
            UninstallMethod::RemoveProfile => match self.profiles {
                Some(profiles) => {
                    let identifier = profile_identifier(&item.info);
                    match profiles.remove(&identifier) {
                        Ok(()) => 0,
                        Err(e) => {
                            report.error(format!("Could not remove profile {}: {}", identifier, e));
                            -1
                        }
                    }
                }
                None => -1,
            },
            UninstallMethod::Other(name) => {
                report.error(format!(
                    "Uninstall method {} for {} is not supported",
                    name, item.info.name
                ));
                -1
            }
        };

        if status == 0 {
            if let Some(script) = &item.info.postuninstall_script {
                match self.scripts.run_script("postuninstall_script", script, &item.info) {
                    Ok(0) => {}
                    Ok(code) => report.warn(format!(
                        "postuninstall_script for {} exited {}",
                        item.info.name, code
                    )),
                    Err(e) => report.warn(format!(
                        "postuninstall_script for {}: {}",
                        item.info.name, e
                    )),
                }
            }
        }
        status
    }

    fn remove_copied_items(&self, report: &mut Report, item: &RemovalItem) -> i32 {
        let mut status = 0;
        for copy in &item.info.items_to_copy {
            let dest_dir = copy
                .destination_path
                .as_deref()
                .unwrap_or("/Applications");
            let name = copy
                .destination_item
                .as_deref()
                .unwrap_or_else(|| basename(&copy.source_item));
            let target = self
                .fs_root
                .join(dest_dir.trim_start_matches('/'))
                .join(name);
            if !target.exists() {
                continue;
            }
            let removed = if target.is_dir() {
                std::fs::remove_dir_all(&target)
            } else {
                std::fs::remove_file(&target)
            };
            if let Err(e) = removed {
                report.error(format!("Could not remove {}: {}", target.display(), e));
                status = -1;
            }
        }
        status
    }

    fn remove_app(&self, report: &mut Report, item: &RemovalItem) -> i32 {
        for entry in &item.info.installs {
            if let muster_types::InstallsEntry::Application { path: Some(p), .. } = entry {
                let target = self.fs_root.join(p.trim_start_matches('/'));
                if !target.exists() {
                    continue;
                }
                return match std::fs::remove_dir_all(&target) {
                    Ok(()) => 0,
                    Err(e) => {
                        report.error(format!("Could not remove {}: {}", target.display(), e));
                        -1
                    }
                };
            }
        }
        report.error(format!(
            "Item {} declares remove_app but no application path",
            item.info.name
        ));
        -1
    }

    // -- installs ----------------------------------------------------------

    fn process_installs(
        &self,
        report: &mut Report,
        plan: &InstallInfo,
        only_unattended: bool,
        st: &mut RunState,
    ) {
        for item in &plan.managed_installs {
            if stop::stop_requested() {
                log::info!("Stopping at install item boundary");
                st.residual_installs.push(item.clone());
                continue;
            }

            if only_unattended && !self.install_is_unattended(item) {
                log::debug!("Skipping {}: not an unattended install", item.info.name);
                st.residual_installs.push(item.clone());
                continue;
            }
            if only_unattended && self.blocked(&item.info.blocking_application_names()) {
                log::info!(
                    "Skipping {}: blocking applications are running",
                    item.info.name
                );
                st.residual_installs.push(item.clone());
                continue;
            }

            // Skip-propagation: a failed prerequisite poisons this item.
            let failed_prereqs = prereqs_in_skipped(item, &st.skipped_installs);
            if !failed_prereqs.is_empty() {
                let note = format!(
                    "Skipped because these prerequisites were not installed: {}",
                    failed_prereqs.join(", ")
                );
                report.warn(format!("Skipping install of {}: {}", item.info.name, note));
                let mut residual = item.clone();
                residual.note = Some(note);
                st.skipped_installs.push((
                    item.info.name.clone(),
                    item.version_to_install
                        .clone()
                        .unwrap_or_else(|| item.info.version.clone()),
                ));
                st.residual_installs.push(residual);
                continue;
            }

            self.ui
                .message(&format!("Installing {}...", item.info.display_name()));
            let started = Instant::now();
            let status = self.install_one(report, item);
            let result = InstallResult {
                name: item.info.name.clone(),
                display_name: Some(item.info.display_name().to_string()),
                version: item
                    .version_to_install
                    .clone()
                    .unwrap_or_else(|| item.info.version.clone()),
                status,
                time: plist::Date::from(SystemTime::now()),
                duration_seconds: started.elapsed().as_secs() as u32,
                download_kbytes_per_sec: None,
                unattended: only_unattended,
            };
            st.results.push(result);

            if status == 0 {
                st.applied_any = true;
                st.post_action = st.post_action.max(item.info.restart_action.post_action());
                if item.info.on_demand {
                    selfservice::remove_from_installs(self.dirs, &item.info.name);
                }
            } else {
                report.error(format!(
                    "Install of {}-{} failed with status {}",
                    item.info.name,
                    item.version_to_install.as_deref().unwrap_or(""),
                    status
                ));
                let mut residual = item.clone();
                residual.note = Some(format!("Install failed with status {}", status));
                st.skipped_installs.push((
                    item.info.name.clone(),
                    item.version_to_install
                        .clone()
                        .unwrap_or_else(|| item.info.version.clone()),
                ));
                st.residual_installs.push(residual);
            }
        }
    }

    fn install_one(&self, report: &mut Report, item: &InstallItem) -> i32 {
        // Items that the planner annotated as undeliverable are refused.
        if let Some(note) = &item.note {
            report.error(format!(
                "Refusing to install {}: {}",
                item.info.name, note
            ));
            return -1;
        }

        let artifact = match self.artifact_for(report, item) {
            Ok(path) => path,
            Err(()) => return -1,
        };

        if let Some(script) = &item.info.preinstall_script {
            match self.scripts.run_script("preinstall_script", script, &item.info) {
                Ok(0) => {}
                Ok(code) => {
                    report.error(format!(
                        "preinstall_script for {} exited {}",
                        item.info.name, code
                    ));
                    return code;
                }
                Err(e) => {
                    report.error(format!("preinstall_script for {}: {}", item.info.name, e));
                    return -1;
                }
            }
        }

        let status = self.dispatch_install(report, item, artifact.as_deref());

        if status == 0 {
            if let Some(script) = &item.info.postinstall_script {
                match self.scripts.run_script("postinstall_script", script, &item.info) {
                    Ok(0) => {}
                    // The payload is already on disk; a post script failure
                    // is only a warning.
                    Ok(code) => report.warn(format!(
                        "postinstall_script for {} exited {}",
                        item.info.name, code
                    )),
                    Err(e) => {
                        report.warn(format!("postinstall_script for {}: {}", item.info.name, e))
                    }
                }
            }
        }
        status
    }

    /// Resolves and verifies the cached installer artifact. `Ok(None)` means
    /// the subtype needs no artifact.
    fn artifact_for(&self, report: &mut Report, item: &InstallItem) -> Result<Option<PathBuf>, ()> {
        let name = match &item.installer_item {
            Some(n) => n,
            None => return Ok(None),
        };
        let path = self.dirs.cache_dir().join(name);
        if !path.exists() {
            report.error(format!(
                "Installer item {} for {} is missing from the cache",
                name, item.info.name
            ));
            return Err(());
        }
        if let Some(expected) = &item.info.installer_item_hash {
            match sha256_of_file(&path) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                Ok(_) => {
                    report.error(format!(
                        "Installer item {} failed its integrity check",
                        name
                    ));
                    return Err(());
                }
                Err(e) => {
                    report.error(format!("Could not hash installer item {}: {}", name, e));
                    return Err(());
                }
            }
        }
        Ok(Some(path))
    }

    fn dispatch_install(
        &self,
        report: &mut Report,
        item: &InstallItem,
        artifact: Option<&Path>,
    ) -> i32 {
        match item.info.installer_kind() {
            InstallerType::NoPkg => 0,
            InstallerType::Profile => match (self.profiles, artifact) {
                (Some(profiles), Some(path)) => {
                    let identifier = profile_identifier(&item.info);
                    match profiles.install(path, &identifier) {
                        Ok(()) => 0,
                        Err(e) => {
                            report.error(format!(
                                "Profile install for {} failed: {}",
                                item.info.name, e
                            ));
                            -1
                        }
                    }
                }
                _ => {
                    report.error(format!(
                        "No profile support available for {}",
                        item.info.name
                    ));
                    -1
                }
            },
            InstallerType::CopyFromDmg => match (self.mounter, artifact) {
                (Some(mounter), Some(path)) => self.copy_from_dmg(report, item, mounter, path),
                _ => {
                    report.error(format!(
                        "No disk image support available for {}",
                        item.info.name
                    ));
                    -1
                }
            },
            InstallerType::StartOsInstall => match (self.os_upgrade, artifact) {
                (Some(os), Some(path)) => match os.start_os_install(path) {
                    Ok(()) => 0,
                    Err(e) => {
                        report.error(format!("OS install handoff failed: {}", e));
                        -1
                    }
                },
                _ => {
                    report.error("No OS upgrade support available".to_string());
                    -1
                }
            },
            InstallerType::StageOsInstaller => match (self.os_upgrade, artifact) {
                (Some(os), Some(path)) => match os.stage_os_installer(path) {
                    Ok(()) => 0,
                    Err(e) => {
                        report.error(format!("OS installer staging failed: {}", e));
                        -1
                    }
                },
                _ => {
                    report.error("No OS upgrade support available".to_string());
                    -1
                }
            },
            InstallerType::Adobe(_) => match self.adobe {
                Some(adobe) => adobe.install(&item.info, artifact).unwrap_or(-1),
                None => {
                    report.error(format!(
                        "No Adobe installer support available for {}",
                        item.info.name
                    ));
                    -1
                }
            },
            InstallerType::Package | InstallerType::Other(_) => match (self.installer, artifact) {
                (Some(installer), Some(path)) => {
                    let env = sanitized_env(
                        self.console_user.as_deref(),
                        &item.info.installer_environment,
                    );
                    let ui = self.ui;
                    let mut on_output = |line: &str| parse_progress_line(line, ui);
                    match installer.run(path, None, &env, &mut on_output) {
                        Ok(code) => code,
                        Err(e) => {
                            report.error(format!(
                                "Installer tool failed for {}: {}",
                                item.info.name, e
                            ));
                            -1
                        }
                    }
                }
                _ => {
                    report.error(format!(
                        "No package installer available for {}",
                        item.info.name
                    ));
                    -1
                }
            },
        }
    }

    fn copy_from_dmg(
        &self,
        report: &mut Report,
        item: &InstallItem,
        mounter: &dyn DmgMounter,
        artifact: &Path,
    ) -> i32 {
        let mountpoints = match mounter.mount(artifact) {
            Ok(m) if !m.is_empty() => m,
            Ok(_) => {
                report.error(format!("Disk image {} has no mountpoints", artifact.display()));
                return -1;
            }
            Err(e) => {
                report.error(format!("Could not mount {}: {}", artifact.display(), e));
                return -1;
            }
        };
        let mountpoint = &mountpoints[0];

        let mut status = 0;
        for copy in &item.info.items_to_copy {
            let source = mountpoint.join(copy.source_item.trim_start_matches('/'));
            let dest_dir = copy.destination_path.as_deref().unwrap_or("/Applications");
            let name = copy
                .destination_item
                .as_deref()
                .unwrap_or_else(|| basename(&copy.source_item));
            let dest = self
                .fs_root
                .join(dest_dir.trim_start_matches('/'))
                .join(name);

            if let Err(e) = copy_recursively(&source, &dest) {
                report.error(format!(
                    "Could not copy {} to {}: {}",
                    source.display(),
                    dest.display(),
                    e
                ));
                status = -1;
                break;
            }
            apply_mode(&dest, copy.mode.as_deref());
        }

        if let Err(e) = mounter.unmount(mountpoint) {
            report.warn(format!("Could not unmount {}: {}", mountpoint.display(), e));
        }
        status
    }

    // -- shared ------------------------------------------------------------

    fn blocked(&self, blocking_apps: &[String]) -> bool {
        blocking_apps.iter().any(|app| self.processes.is_running(app))
    }

    fn install_is_unattended(&self, item: &InstallItem) -> bool {
        item.info.unattended_install || force_install_due(&item.info)
    }

    fn removal_is_unattended(&self, item: &RemovalItem) -> bool {
        item.info.unattended_uninstall || force_install_due(&item.info)
    }

    /// Rewrites the plan to only the residual (skipped or failed) work and
    /// refreshes the optional-install status flags.
    fn rewrite_installinfo(&self, report: &mut Report, plan: InstallInfo, st: &RunState) {
        let mut residual = plan;

        let succeeded_installs: Vec<String> = st
            .results
            .iter()
            .filter(|r| r.status == 0)
            .map(|r| r.name.clone())
            .collect();
        let failed_installs: Vec<String> = st
            .results
            .iter()
            .filter(|r| r.status != 0)
            .map(|r| r.name.clone())
            .collect();
        let succeeded_removals: Vec<String> = st
            .removal_results
            .iter()
            .filter(|r| r.status == 0)
            .map(|r| r.name.clone())
            .collect();
        let failed_removals: Vec<String> = st
            .removal_results
            .iter()
            .filter(|r| r.status != 0)
            .map(|r| r.name.clone())
            .collect();

        residual.managed_installs = st.residual_installs.clone();
        residual.removals = st.residual_removals.clone();

        for optional in &mut residual.optional_installs {
            let name = &optional.info.name;
            if succeeded_installs.contains(name) {
                optional.installed = true;
                optional.needs_update = Some(false);
                optional.will_be_installed = None;
                optional.install_error = None;
            } else if failed_installs.contains(name) {
                optional.install_error = Some(true);
                optional.will_be_installed = None;
            }
            if succeeded_removals.contains(name) {
                optional.installed = false;
                optional.will_be_removed = None;
                optional.removal_error = None;
            } else if failed_removals.contains(name) {
                optional.removal_error = Some(true);
                optional.will_be_removed = None;
            }
        }

        if let Err(e) = plist::to_file_xml(self.dirs.installinfo_path(), &residual) {
            report.error(format!("Could not rewrite InstallInfo: {}", e));
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn profile_identifier(info: &muster_types::PkgInfo) -> String {
    info.extra
        .get("PayloadIdentifier")
        .and_then(|v| v.as_string())
        .map(str::to_string)
        .unwrap_or_else(|| info.name.clone())
}

/// True once an item's force-install deadline has passed; such items are
/// treated as unattended.
fn force_install_due(info: &muster_types::PkgInfo) -> bool {
    match info.force_install_after_date {
        Some(date) => SystemTime::from(date) <= SystemTime::now(),
        None => false,
    }
}

/// Matches an item's prerequisites against already-skipped items, by bare
/// name or name-version.
fn prereqs_in_skipped(item: &InstallItem, skipped: &[(String, String)]) -> Vec<String> {
    if skipped.is_empty() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    for prereq in &item.info.requires {
        let (name, version) = split_name_and_version(prereq);
        let hit = skipped.iter().any(|(s_name, s_version)| {
            *s_name == name
                && version
                    .as_ref()
                    .map_or(true, |v| {
                        muster_types::LooseVersion::new(v)
                            == muster_types::LooseVersion::new(s_version)
                    })
        });
        if hit {
            matches.push(prereq.clone());
        }
    }
    matches
}

/// Parses one line of installer tool output, forwarding `PHASE:`, `STATUS:`
/// and `<percent>%` tokens to the UI.
pub(crate) fn parse_progress_line(line: &str, ui: &dyn UiNotifier) {
    let line = line.trim();
    if let Some(idx) = line.find("PHASE:") {
        let msg = &line[idx + "PHASE:".len()..];
        if !msg.is_empty() {
            ui.message(msg.trim());
        }
    } else if let Some(idx) = line.find("STATUS:") {
        let msg = &line[idx + "STATUS:".len()..];
        if !msg.is_empty() {
            ui.detail(msg.trim());
        }
    } else if let Some(stripped) = line.strip_suffix('%') {
        if let Ok(pct) = stripped
            .rsplit(|c: char| !c.is_ascii_digit() && c != '.')
            .next()
            .unwrap_or("")
            .parse::<f64>()
        {
            ui.percent(pct as i32);
        }
    }
}

fn copy_recursively(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest).map(|_| ())
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<&str>) {
    use std::os::unix::fs::PermissionsExt;
    let Some(mode) = mode else { return };
    if let Ok(bits) = u32::from_str_radix(mode, 8) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(bits));
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<&str>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformError;
    use muster_types::{PkgInfo, RestartAction};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    struct NoScripts;
    impl EmbeddedScriptRunner for NoScripts {
        fn run_script(
            &self,
            _label: &str,
            _content: &str,
            _item: &PkgInfo,
        ) -> Result<i32, PlatformError> {
            Ok(0)
        }
    }

    /// Installer stub that fails for configured item basenames and records
    /// every invocation.
    struct FakeInstaller {
        fail_artifacts: Vec<String>,
        fail_code: i32,
        invoked: RefCell<Vec<String>>,
    }

    impl FakeInstaller {
        fn new() -> FakeInstaller {
            FakeInstaller {
                fail_artifacts: Vec::new(),
                fail_code: 5,
                invoked: RefCell::new(Vec::new()),
            }
        }
    }

    impl InstallerRunner for FakeInstaller {
        fn run(
            &self,
            artifact: &Path,
            _choices_xml: Option<&Path>,
            _env: &BTreeMap<String, String>,
            on_output: &mut dyn FnMut(&str),
        ) -> Result<i32, PlatformError> {
            let name = artifact.file_name().unwrap().to_string_lossy().into_owned();
            self.invoked.borrow_mut().push(name.clone());
            on_output("installer:PHASE:Preparing disk...");
            on_output("installer:%25.0");
            if self.fail_artifacts.contains(&name) {
                Ok(self.fail_code)
            } else {
                Ok(0)
            }
        }
    }

    struct RememberingReceipts {
        forgotten: RefCell<Vec<String>>,
    }

    impl ReceiptOracle for RememberingReceipts {
        fn list_installed_packages(&self) -> hashbrown::HashMap<String, String> {
            hashbrown::HashMap::new()
        }
        fn forget_package(&self, pkgid: &str) -> Result<(), PlatformError> {
            self.forgotten.borrow_mut().push(pkgid.to_string());
            Ok(())
        }
    }

    fn fixture() -> (tempfile::TempDir, ManagedDirs, Preferences) {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path().join("managed"));
        dirs.ensure().unwrap();
        let prefs = Preferences::in_dir(tmp.path());
        (tmp, dirs, prefs)
    }

    fn pkg_install_item(dirs: &ManagedDirs, name: &str, version: &str) -> InstallItem {
        let mut item = InstallItem::default();
        item.info.name = name.to_string();
        item.info.version = version.to_string();
        item.version_to_install = Some(version.to_string());
        let artifact = format!("{}-{}.pkg", name, version);
        std::fs::write(dirs.cache_dir().join(&artifact), b"pkgbits").unwrap();
        item.installer_item = Some(artifact);
        item
    }

    fn write_plan(dirs: &ManagedDirs, plan: &InstallInfo) {
        plist::to_file_xml(dirs.installinfo_path(), plan).unwrap();
    }

    fn read_plan(dirs: &ManagedDirs) -> InstallInfo {
        plist::from_file(dirs.installinfo_path()).unwrap()
    }

    #[test]
    fn test_skip_propagation_on_failed_prerequisite() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let app_b = pkg_install_item(&dirs, "AppB", "2.0");
        let mut app_a = pkg_install_item(&dirs, "AppA", "1.0");
        app_a.info.requires = vec!["AppB".into()];
        plan.managed_installs = vec![app_b, app_a];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let mut installer = FakeInstaller::new();
        installer.fail_artifacts = vec!["AppB-2.0.pkg".into()];
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);

        let mut report = Report::start();
        let post = executor.run(&mut report, false).unwrap();
        assert_eq!(post, PostAction::None);

        // AppB ran and failed; AppA was never attempted.
        assert_eq!(installer.invoked.borrow().as_slice(), ["AppB-2.0.pkg"]);
        assert_eq!(report.install_results.len(), 1);
        assert_eq!(report.install_results[0].status, 5);

        let residual = read_plan(&dirs);
        assert_eq!(residual.managed_installs.len(), 2);
        assert!(residual.managed_installs.iter().all(|i| i.note.is_some()));
        assert!(residual.managed_installs[1]
            .note
            .as_deref()
            .unwrap()
            .contains("prerequisites"));
    }

    #[test]
    fn test_successful_run_leaves_empty_residual_and_aggregates_restart() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let mut item_a = pkg_install_item(&dirs, "AppA", "1.0");
        item_a.info.restart_action = RestartAction::RequireLogout;
        let mut item_b = pkg_install_item(&dirs, "AppB", "2.0");
        item_b.info.restart_action = RestartAction::RequireRestart;
        plan.managed_installs = vec![item_a, item_b];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let installer = FakeInstaller::new();
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);

        let mut report = Report::start();
        let post = executor.run(&mut report, false).unwrap();
        assert_eq!(post, PostAction::Restart);

        let residual = read_plan(&dirs);
        assert!(residual.managed_installs.is_empty());
        assert!(!residual.needs_action());
    }

    #[test]
    fn test_unattended_filter_skips_attended_items() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let mut silent = pkg_install_item(&dirs, "Silent", "1.0");
        silent.info.unattended_install = true;
        let loud = pkg_install_item(&dirs, "Loud", "1.0");
        plan.managed_installs = vec![silent, loud];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let installer = FakeInstaller::new();
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);

        let mut report = Report::start();
        executor.run(&mut report, true).unwrap();

        assert_eq!(installer.invoked.borrow().as_slice(), ["Silent-1.0.pkg"]);
        let residual = read_plan(&dirs);
        assert_eq!(residual.managed_installs.len(), 1);
        assert_eq!(residual.managed_installs[0].info.name, "Loud");
        // Not an error, so no note.
        assert!(residual.managed_installs[0].note.is_none());
    }

    #[test]
    fn test_force_install_date_makes_item_unattended() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let mut overdue = pkg_install_item(&dirs, "Overdue", "1.0");
        overdue.info.force_install_after_date = Some(plist::Date::from(
            SystemTime::now() - std::time::Duration::from_secs(3600),
        ));
        plan.managed_installs = vec![overdue];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let installer = FakeInstaller::new();
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);

        let mut report = Report::start();
        executor.run(&mut report, true).unwrap();
        assert_eq!(installer.invoked.borrow().as_slice(), ["Overdue-1.0.pkg"]);
    }

    #[test]
    fn test_blocking_applications_defer_unattended_install() {
        struct EditorRunning;
        impl ProcessOracle for EditorRunning {
            fn running_process_names(&self) -> Vec<String> {
                vec!["Editor".into()]
            }
        }

        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let mut item = pkg_install_item(&dirs, "EditorUpdate", "2.0");
        item.info.unattended_install = true;
        item.info.blocking_applications = Some(vec!["Editor.app".into()]);
        plan.managed_installs = vec![item];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let installer = FakeInstaller::new();
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);
        executor.processes = &EditorRunning;

        let mut report = Report::start();
        executor.run(&mut report, true).unwrap();
        assert!(installer.invoked.borrow().is_empty());
        let residual = read_plan(&dirs);
        assert_eq!(residual.managed_installs.len(), 1);
    }

    #[test]
    fn test_removals_forget_only_listed_receipts() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let mut removal = RemovalItem::default();
        removal.info.name = "AppC".into();
        removal.info.version = "1.0".into();
        removal.info.uninstall_method = Some(UninstallMethod::RemovePackages);
        removal.packages = vec!["com.x.appc".into()];
        plan.removals = vec![removal];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let receipts = RememberingReceipts {
            forgotten: RefCell::new(Vec::new()),
        };
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.receipts = &receipts;

        let mut report = Report::start();
        executor.run(&mut report, false).unwrap();
        assert_eq!(receipts.forgotten.borrow().as_slice(), ["com.x.appc"]);
        let residual = read_plan(&dirs);
        assert!(residual.removals.is_empty());
    }

    #[test]
    fn test_executor_refuses_items_with_notes() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let mut item = pkg_install_item(&dirs, "Broken", "1.0");
        item.note = Some("installer integrity check failed".into());
        plan.managed_installs = vec![item];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let installer = FakeInstaller::new();
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);

        let mut report = Report::start();
        executor.run(&mut report, false).unwrap();
        assert!(installer.invoked.borrow().is_empty());
        assert_eq!(report.install_results[0].status, -1);
    }

    #[test]
    fn test_progress_token_parsing() {
        struct Captured(RefCell<Vec<String>>);
        impl UiNotifier for Captured {
            fn message(&self, text: &str) {
                self.0.borrow_mut().push(format!("msg:{}", text));
            }
            fn detail(&self, text: &str) {
                self.0.borrow_mut().push(format!("detail:{}", text));
            }
            fn percent(&self, value: i32) {
                self.0.borrow_mut().push(format!("pct:{}", value));
            }
        }

        let ui = Captured(RefCell::new(Vec::new()));
        parse_progress_line("installer:PHASE:Preparing disk...", &ui);
        parse_progress_line("installer:STATUS:Copying files", &ui);
        parse_progress_line("installer:%37.5%", &ui);
        parse_progress_line("noise without tokens", &ui);

        let seen = ui.0.borrow();
        assert_eq!(
            seen.as_slice(),
            [
                "msg:Preparing disk...",
                "detail:Copying files",
                "pct:37"
            ]
        );
    }

    #[test]
    fn test_installinfo_optional_flags_updated() {
        let (_tmp, dirs, prefs) = fixture();
        let mut plan = InstallInfo::default();
        let item = pkg_install_item(&dirs, "EditorX", "2.0");
        let mut optional = muster_types::OptionalItem::default();
        optional.info.name = "EditorX".into();
        optional.info.version = "2.0".into();
        optional.will_be_installed = Some(true);
        plan.optional_installs = vec![optional];
        plan.managed_installs = vec![item];
        write_plan(&dirs, &plan);

        let scripts = NoScripts;
        let installer = FakeInstaller::new();
        let mut executor = Executor::new(&prefs, &dirs, &scripts);
        executor.installer = Some(&installer);

        let mut report = Report::start();
        executor.run(&mut report, false).unwrap();

        let residual = read_plan(&dirs);
        let optional = &residual.optional_installs[0];
        assert!(optional.installed);
        assert_eq!(optional.needs_update, Some(false));
        assert!(optional.will_be_installed.is_none());
    }
}
