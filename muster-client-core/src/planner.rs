use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use thiserror::Error;
use url::Url;

use muster_types::{
    split_name_and_version, InstallInfo, InstallItem, InstallerType, Manifest, OptionalItem,
    PkgInfo, RemovalItem, Section, UninstallMethod,
};

use crate::cache::{self, ManagedDirs};
use crate::catalogs::{CatalogDb, CatalogStore, InstalledPkgAnalysis, ItemDetailError};
use crate::conditions::{predicate_is_true, Facts};
use crate::fetch::{FetchError, FetchOptions, Fetcher};
use crate::icons;
use crate::manifests::{ManifestError, ManifestStore};
use crate::platform::{
    EmbeddedScriptRunner, ProcessOracle, ProfileStore, SystemProcessOracle,
};
use crate::prefs::Preferences;
use crate::report::Report;
use crate::selfservice;
use crate::status::{InstalledApp, InstalledState, StatusOracle};
use crate::stop;
use crate::usage::{self, UsageLedger};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Primary manifest is unreachable and no cached copy exists")]
    PrimaryManifestUnavailable(#[source] ManifestError),

    #[error("Primary manifest is invalid")]
    PrimaryManifestInvalid(#[source] ManifestError),

    #[error("Stop requested")]
    StopRequested,
}

/// Exit disposition of a planning run.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// `1` when installs or removals are pending, `0` otherwise.
    pub exit_code: i32,
    pub installinfo: InstallInfo,
    /// False when the plan on disk already matched.
    pub changed: bool,
}

/// Per-operation disposition inside the planner; failures never abort the
/// whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Ok,
    Conflict,
    Unsatisfiable,
}

/// The resolver: walks manifests and conditional branches, consults the
/// installation-state oracle, enforces dependency order, and produces the
/// install/remove/update/optional lists.
pub struct Planner<'a> {
    pub prefs: &'a Preferences,
    pub dirs: &'a ManagedDirs,
    pub facts: &'a Facts,
    pub fetcher: Option<&'a Fetcher>,
    /// Root the install probes resolve against; `/` in production.
    pub fs_root: PathBuf,
    /// Platform receipt database snapshot: packageid -> version.
    pub installed_pkgs: HashMap<String, String>,
    /// Application inventory keyed by bundle id.
    pub apps: HashMap<String, InstalledApp>,
    pub scripts: Option<&'a dyn EmbeddedScriptRunner>,
    pub profiles: Option<&'a dyn ProfileStore>,
    pub usage: Option<&'a UsageLedger>,
    pub processes: &'a dyn ProcessOracle,
}

struct PlanState<'p> {
    info: InstallInfo,
    db: CatalogDb,
    manifests: ManifestStore<'p>,
    catalog_store: CatalogStore<'p>,
    analysis: InstalledPkgAnalysis,
    /// Installer basenames from the previous plan's precache set; the only
    /// eviction candidates for the disk-space policy.
    prior_precache: Vec<PathBuf>,
    /// Names whose update chains were already expanded, to stop recursion.
    visited_updates: Vec<String>,
}

static DEFAULT_PROCESSES: SystemProcessOracle = SystemProcessOracle;

impl<'a> Planner<'a> {
    pub fn new(prefs: &'a Preferences, dirs: &'a ManagedDirs, facts: &'a Facts) -> Planner<'a> {
        Planner {
            prefs,
            dirs,
            facts,
            fetcher: None,
            fs_root: PathBuf::from("/"),
            installed_pkgs: HashMap::new(),
            apps: HashMap::new(),
            scripts: None,
            profiles: None,
            usage: None,
            processes: &DEFAULT_PROCESSES,
        }
    }

    fn oracle(&self) -> StatusOracle<'_> {
        StatusOracle {
            fs_root: self.fs_root.clone(),
            facts: self.facts,
            receipts: &self.installed_pkgs,
            apps: &self.apps,
            scripts: self.scripts,
            profiles: self.profiles,
        }
    }

    /// Identity candidates for the primary manifest, most specific first.
    fn primary_candidates(&self, client_id: Option<&str>) -> Vec<String> {
        let mut out = Vec::new();
        let id = client_id
            .map(str::to_string)
            .or_else(|| self.prefs.string("ClientIdentifier"));
        if let Some(id) = id {
            if !id.is_empty() {
                out.push(id);
            }
        }
        for key in ["hostname", "short_hostname", "serial_number"] {
            if let Some(crate::conditions::FactValue::Str(s)) = self.facts.get(key) {
                if !s.is_empty() && !out.contains(s) {
                    out.push(s.clone());
                }
            }
        }
        out.push("site_default".to_string());
        out
    }

    /// The planning entry point.
    pub fn plan(
        &mut self,
        report: &mut Report,
        client_id: Option<&str>,
        local_manifest: Option<&Path>,
    ) -> Result<PlanOutcome, PlanError> {
        let manifest_url = self.prefs.repo_url("ManifestURL", "manifests");
        let catalog_url = self.prefs.repo_url("CatalogURL", "catalogs");

        let mut st = PlanState {
            info: InstallInfo::default(),
            db: CatalogDb::new(),
            manifests: ManifestStore::new(self.dirs, self.fetcher, manifest_url),
            catalog_store: CatalogStore::new(self.dirs, self.fetcher, catalog_url),
            analysis: InstalledPkgAnalysis::default(),
            prior_precache: Vec::new(),
            visited_updates: Vec::new(),
        };

        // Remember the previous precache set; those cached installers are
        // the eviction candidates when disk space runs short.
        if let Ok(prior) = plist::from_file::<_, InstallInfo>(self.dirs.installinfo_path()) {
            st.prior_precache = prior
                .optional_installs
                .iter()
                .filter(|o| o.info.precache)
                .filter_map(|o| o.info.installer_item_location.as_deref())
                .map(|loc| self.dirs.installer_path(loc))
                .collect();
        }

        // Merge any user-dropped self-serve manifest before planning.
        selfservice::ingest_origin(self.dirs, &crate::defaults::selfserve_origin_path());

        let (primary_name, primary) = match local_manifest {
            Some(path) => {
                let manifest = st.manifests.local_manifest(path).map_err(|e| match e {
                    ManifestError::Invalid(..) => PlanError::PrimaryManifestInvalid(e),
                    other => PlanError::PrimaryManifestUnavailable(other),
                })?;
                (path.display().to_string(), manifest)
            }
            None => {
                let candidates = self.primary_candidates(client_id);
                st.manifests.primary(&candidates).map_err(|e| match e {
                    ManifestError::Invalid(..) => PlanError::PrimaryManifestInvalid(e),
                    other => PlanError::PrimaryManifestUnavailable(other),
                })?
            }
        };
        report.manifest_name = Some(primary_name.clone());

        let catalogs = primary.catalogs.clone();
        st.db.load(&catalogs, &st.catalog_store);
        st.analysis = st.db.analyze_installed_pkgs(&self.installed_pkgs, &catalogs);

        // Fixed section order over the primary manifest.
        self.walk(&mut st, report, &primary, &primary_name, Section::ManagedInstalls, &catalogs)?;
        self.walk(&mut st, report, &primary, &primary_name, Section::ManagedUninstalls, &catalogs)?;

        // Implicit autoremove: catalog-flagged names not explicitly
        // installed this run.
        for name in st.db.autoremove_names(&catalogs) {
            if !st.info.processed_installs.contains(&name) {
                self.process_removal(&mut st, report, &name, &catalogs);
            }
        }

        self.walk(&mut st, report, &primary, &primary_name, Section::ManagedUpdates, &catalogs)?;

        if let Some(local_only) = self.prefs.string("LocalOnlyManifest") {
            let path = self.dirs.manifests_dir().join(&local_only);
            match st.manifests.local_manifest(&path) {
                Ok(manifest) => {
                    for section in [Section::ManagedInstalls, Section::ManagedUninstalls, Section::ManagedUpdates] {
                        self.walk(&mut st, report, &manifest, &local_only, section, &catalogs)?;
                    }
                }
                Err(ManifestError::NotFound(_)) => {}
                Err(e) => report.warn(format!("Could not read local-only manifest: {}", e)),
            }
        }

        self.walk(&mut st, report, &primary, &primary_name, Section::OptionalInstalls, &catalogs)?;
        self.walk(&mut st, report, &primary, &primary_name, Section::FeaturedItems, &catalogs)?;

        // Default installs seed the self-serve manifest.
        let default_names = self.collect_section(&mut st, &primary, Section::DefaultInstalls);
        selfservice::process_default_installs(self.dirs, &default_names);

        self.merge_selfserve(&mut st, report, &catalogs)?;
        self.post_process(&mut st, report);

        icons::sync_icons(self.dirs, self.fetcher, self.prefs, &st.info);
        icons::fetch_client_resources(self.dirs, self.fetcher, self.prefs);
        st.manifests.clean_up();
        self.clean_cache(&st);
        self.track_pending_updates(&st.info);
        self.write_app_inventory();

        for item in &st.info.managed_installs {
            if let Some(d) = to_dictionary(item) {
                report.items_to_install.push(d);
            }
        }
        for item in &st.info.removals {
            if let Some(d) = to_dictionary(item) {
                report.items_to_remove.push(d);
            }
        }

        let changed = self.write_installinfo(&st.info, report);
        let exit_code = if st.info.needs_action() { 1 } else { 0 };
        Ok(PlanOutcome {
            exit_code,
            installinfo: st.info,
            changed,
        })
    }

    /// Recursively processes one section of a manifest: included manifests
    /// first, then matching conditional branches, then the section items.
    fn walk(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        manifest: &Manifest,
        manifest_name: &str,
        section: Section,
        parent_catalogs: &[String],
    ) -> Result<(), PlanError> {
        let mut visited = vec![manifest_name.to_string()];
        self.walk_inner(st, report, manifest, section, parent_catalogs, &mut visited)
    }

    fn walk_inner(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        manifest: &Manifest,
        section: Section,
        parent_catalogs: &[String],
        visited: &mut Vec<String>,
    ) -> Result<(), PlanError> {
        if stop::stop_requested() {
            return Err(PlanError::StopRequested);
        }

        let own_catalogs;
        let catalogs: &[String] = if manifest.catalogs.is_empty() {
            parent_catalogs
        } else {
            st.db.load(&manifest.catalogs, &st.catalog_store);
            own_catalogs = manifest.catalogs.clone();
            &own_catalogs
        };

        for included in manifest.included_manifests.clone() {
            if visited.contains(&included) {
                report.warn(format!(
                    "Circular manifest inclusion detected at {}; skipping",
                    included
                ));
                continue;
            }
            match st.manifests.manifest(&included) {
                Ok(nested) => {
                    visited.push(included.clone());
                    self.walk_inner(st, report, &nested, section, catalogs, visited)?;
                    visited.pop();
                }
                Err(e @ ManifestError::Invalid(..)) => {
                    report.warn(format!("Skipping included manifest: {}", e));
                }
                Err(e) => report.warn(format!("Could not get included manifest {}: {}", included, e)),
            }
        }

        for conditional in &manifest.conditional_items {
            match predicate_is_true(&conditional.condition, self.facts) {
                Ok(true) => {
                    self.walk_inner(st, report, &conditional.manifest, section, catalogs, visited)?;
                }
                Ok(false) => {}
                Err(e) => report.warn(format!(
                    "Unable to evaluate condition '{}': {}",
                    conditional.condition, e
                )),
            }
        }

        for item_ref in manifest.section(section).to_vec() {
            if stop::stop_requested() {
                return Err(PlanError::StopRequested);
            }
            match section {
                Section::ManagedInstalls => {
                    self.process_install(st, report, &item_ref, catalogs, false);
                }
                Section::ManagedUninstalls => {
                    self.process_removal(st, report, &item_ref, catalogs);
                }
                Section::ManagedUpdates => {
                    self.process_managed_update(st, report, &item_ref, catalogs);
                }
                Section::OptionalInstalls => {
                    self.process_optional_install(st, report, &item_ref, catalogs);
                }
                Section::FeaturedItems => {
                    if !st.info.featured_items.contains(&item_ref) {
                        st.info.featured_items.push(item_ref.clone());
                    }
                }
                Section::DefaultInstalls => {}
            }
        }

        Ok(())
    }

    /// Collects a section's names across the manifest tree without
    /// processing them (used for `default_installs`).
    fn collect_section(
        &self,
        st: &mut PlanState<'a>,
        manifest: &Manifest,
        section: Section,
    ) -> Vec<String> {
        let mut names: Vec<String> = manifest.section(section).to_vec();
        for included in &manifest.included_manifests {
            if let Ok(nested) = st.manifests.manifest(included) {
                for name in self.collect_section(st, &nested, section) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        for conditional in &manifest.conditional_items {
            if let Ok(true) = predicate_is_true(&conditional.condition, self.facts) {
                for name in conditional.manifest.section(section) {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        names
    }

    fn already_processed_install(&self, st: &PlanState<'_>, name: &str, item_ref: &str) -> bool {
        st.info.processed_installs.iter().any(|n| n == name || n == item_ref)
    }

    fn process_install(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        item_ref: &str,
        catalogs: &[String],
        is_managed_update: bool,
    ) -> Processed {
        let (bare_name, _) = split_name_and_version(item_ref);

        if self.already_processed_install(st, &bare_name, item_ref) {
            return Processed::Ok;
        }
        if st.info.processed_uninstalls.contains(&bare_name) {
            report.warn(format!(
                "Will not process {} for install because it has already been processed for removal",
                bare_name
            ));
            return Processed::Conflict;
        }

        let item = match st.db.item_detail(item_ref, catalogs, false, self.facts) {
            Ok(item) => item.clone(),
            Err(ItemDetailError::NotFound) => {
                report.warn(format!(
                    "Could not process item {} for install: not found in catalogs {:?}",
                    item_ref, catalogs
                ));
                return Processed::Unsatisfiable;
            }
            Err(ItemDetailError::Rejected(reasons)) => {
                for reason in &reasons {
                    report.warn(format!("Could not process item {} for install: {}", item_ref, reason));
                }
                return Processed::Unsatisfiable;
            }
        };

        // Dependencies first; an unsatisfiable prerequisite poisons this
        // item.
        let mut deps_ok = true;
        for required in item.requires.clone() {
            log::debug!("{} requires {}", item.name, required);
            if self.process_install(st, report, &required, catalogs, is_managed_update)
                != Processed::Ok
            {
                report.warn(format!(
                    "Didn't attempt to install {} because could not resolve its dependency {}",
                    item.name, required
                ));
                deps_ok = false;
            }
        }
        if !deps_ok {
            return Processed::Unsatisfiable;
        }

        let state = self.oracle().installed_state(&item);
        if state == InstalledState::NotInstalled {
            log::info!("Need to install {}-{}", item.name, item.version);
            let mut record = InstallItem {
                info: item.clone(),
                installer_item: item
                    .installer_item_location
                    .as_deref()
                    .map(|loc| cache::basename(loc).to_string()),
                version_to_install: Some(item.version.clone()),
                installed: Some(false),
                note: None,
            };
            if let Err(note) = self.download_installer(st, &item) {
                report.warn(format!("Download of {} failed: {}", item.name, note));
                record.note = Some(note);
                st.info.managed_installs.push(record);
                return Processed::Unsatisfiable;
            }
            st.info.managed_installs.push(record);
        } else {
            log::debug!("{} version {} (or newer) is already installed", item.name, item.version);
        }

        // Update chains apply whether or not the base item was just added.
        self.expand_updates(st, report, &item, catalogs);

        if is_managed_update {
            if !st.info.managed_updates.contains(&item.name) {
                st.info.managed_updates.push(item.name.clone());
            }
        } else if !st.info.processed_installs.contains(&bare_name) {
            st.info.processed_installs.push(bare_name);
        }
        Processed::Ok
    }

    fn expand_updates(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        item: &PkgInfo,
        catalogs: &[String],
    ) {
        for key in [item.name.clone(), item.name_with_version()] {
            if st.visited_updates.contains(&key) {
                continue;
            }
            st.visited_updates.push(key.clone());
            for update_name in st.db.look_for_updates(&key, catalogs) {
                self.process_install(st, report, &update_name, catalogs, true);
            }
        }
    }

    fn process_managed_update(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        item_ref: &str,
        catalogs: &[String],
    ) {
        let (bare_name, _) = split_name_and_version(item_ref);
        if self.already_processed_install(st, &bare_name, item_ref)
            || st.info.processed_uninstalls.contains(&bare_name)
        {
            return;
        }
        let item = match st.db.item_detail(item_ref, catalogs, false, self.facts) {
            Ok(item) => item.clone(),
            Err(_) => {
                report.warn(format!("Managed update {} not found in catalogs", item_ref));
                return;
            }
        };
        // Managed updates only apply to software that is already present.
        if self.oracle().some_version_installed(&item) {
            self.process_install(st, report, item_ref, catalogs, true);
        }
    }

    fn process_optional_install(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        item_ref: &str,
        catalogs: &[String],
    ) {
        let (bare_name, _) = split_name_and_version(item_ref);
        if st
            .info
            .optional_installs
            .iter()
            .any(|o| o.info.name == bare_name)
        {
            return;
        }

        let item = match st.db.item_detail(item_ref, catalogs, false, self.facts) {
            Ok(item) => Some(item.clone()),
            Err(ItemDetailError::NotFound) => {
                report.warn(format!(
                    "Could not process optional install {}: not found in catalogs",
                    item_ref
                ));
                None
            }
            Err(ItemDetailError::Rejected(_)) => None,
        };

        let item = match item {
            Some(item) => item,
            None => {
                // Perhaps only the OS gate failed; surface a teaser entry
                // when configured to.
                if self.prefs.boolean("ShowOptionalInstallsForHigherOSVersions") {
                    if let Ok(item) = st.db.item_detail(item_ref, catalogs, true, self.facts) {
                        let item = item.clone();
                        let mut entry = OptionalItem::default();
                        entry.version_to_install = Some(item.version.clone());
                        entry.note = Some(format!(
                            "Requires OS version {} or later",
                            item.minimum_os_version.clone().unwrap_or_default()
                        ));
                        entry.info = item;
                        st.info.optional_installs.push(entry);
                    }
                }
                return;
            }
        };

        let oracle = self.oracle();
        let installed = oracle.some_version_installed(&item);
        let needs_update =
            installed && oracle.installed_state(&item) == InstalledState::NotInstalled;

        let mut entry = OptionalItem {
            installed,
            needs_update: Some(needs_update),
            version_to_install: Some(item.version.clone()),
            licensed_seat_info_available: item
                .extra
                .get("licensed_seat_info_available")
                .and_then(|v| v.as_boolean()),
            ..Default::default()
        };
        if !installed && item.installer_item_location.is_none()
            && item.installer_kind() == InstallerType::Package
        {
            entry.note = Some("No installer item is available".to_string());
        }
        entry.info = item.clone();
        st.info.optional_installs.push(entry);

        // Remove-if-unused policy for installed optional items.
        if installed {
            if let Some(ledger) = self.usage {
                if usage::should_be_removed(&item, ledger, self.processes) {
                    self.process_removal(st, report, &item.name, catalogs);
                    selfservice::remove_from_installs(self.dirs, &item.name);
                }
            }
        }
    }

    fn process_removal(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        item_ref: &str,
        catalogs: &[String],
    ) -> Processed {
        let (bare_name, _) = split_name_and_version(item_ref);

        if st.info.processed_uninstalls.contains(&bare_name) {
            return Processed::Ok;
        }
        if self.already_processed_install(st, &bare_name, item_ref) {
            report.warn(format!(
                "Will not attempt to remove {} because it has already been processed for install",
                bare_name
            ));
            return Processed::Conflict;
        }

        // Find a version for which install evidence exists.
        let oracle = self.oracle();
        let candidates = st.db.all_items_with_name(&bare_name, catalogs);
        let found = candidates
            .into_iter()
            .find(|c| oracle.evidence_this_is_installed(c))
            .cloned();
        let item = match found {
            Some(item) => item,
            None => {
                log::debug!("{} appears not to be installed; nothing to remove", bare_name);
                st.info.processed_uninstalls.push(bare_name);
                return Processed::Ok;
            }
        };

        // Dependents are removed first so nothing keeps the item alive.
        let dependents = self.installed_dependents(st, &item, catalogs);
        for dependent in dependents {
            if self.process_removal(st, report, &dependent, catalogs) != Processed::Ok {
                report.warn(format!(
                    "Will not remove {} because could not remove dependent item {}",
                    item.name, dependent
                ));
                return Processed::Unsatisfiable;
            }
        }

        let method = match self.resolve_uninstall_method(&item) {
            Some(m) => m,
            None => {
                report.warn(format!("Item {} is not removable", item.name));
                return Processed::Unsatisfiable;
            }
        };

        let mut record = RemovalItem {
            installed: Some(true),
            ..Default::default()
        };
        let mut info = item.clone();
        info.uninstall_method = Some(method.clone());

        if method == UninstallMethod::RemovePackages {
            record.packages = self.removable_packages(st, &item);
            if record.packages.is_empty() {
                report.warn(format!(
                    "Could not remove {}: all of its receipts are shared with other items",
                    item.name
                ));
                return Processed::Unsatisfiable;
            }
        }

        if let Some(location) = &item.uninstaller_item_location {
            match self.download_artifact(st, &item, location) {
                Ok(()) => {
                    record.uninstaller_item = Some(cache::basename(location).to_string());
                }
                Err(note) => {
                    report.warn(format!(
                        "Failed to download the uninstaller for {}: {}",
                        item.name, note
                    ));
                    return Processed::Unsatisfiable;
                }
            }
        }

        log::info!("Removal of {} requested", item.name);
        record.info = info;
        st.info.removals.push(record);
        st.info.processed_uninstalls.push(bare_name);
        Processed::Ok
    }

    /// Installed catalog items whose `requires` mention this item, by bare
    /// name or name-version.
    fn installed_dependents(
        &self,
        st: &PlanState<'a>,
        item: &PkgInfo,
        catalogs: &[String],
    ) -> Vec<String> {
        let oracle = self.oracle();
        let mut out = Vec::new();
        let targets = [item.name.clone(), item.name_with_version()];
        for name in st.db.item_names(catalogs) {
            for candidate in st.db.all_items_with_name(&name, catalogs) {
                if candidate.name == item.name {
                    continue;
                }
                let requires_this = candidate
                    .requires
                    .iter()
                    .any(|r| targets.iter().any(|t| t == r));
                if requires_this
                    && oracle.evidence_this_is_installed(candidate)
                    && !out.contains(&candidate.name)
                {
                    out.push(candidate.name.clone());
                }
            }
        }
        out
    }

    fn resolve_uninstall_method(&self, item: &PkgInfo) -> Option<UninstallMethod> {
        if let Some(method) = &item.uninstall_method {
            return Some(method.clone());
        }
        if item.uninstall_script.is_some() {
            return Some(UninstallMethod::UninstallScript);
        }
        if !item.uninstallable && item.receipts.is_empty() && item.items_to_copy.is_empty() {
            return None;
        }
        if !item.receipts.is_empty() {
            return Some(UninstallMethod::RemovePackages);
        }
        if !item.items_to_copy.is_empty() {
            return Some(UninstallMethod::RemoveCopiedItems);
        }
        if item.installer_kind() == InstallerType::Profile {
            return Some(UninstallMethod::RemoveProfile);
        }
        None
    }

    /// Receipt ids exclusively owned by this item; shared receipts are
    /// preserved.
    fn removable_packages(&self, st: &PlanState<'a>, item: &PkgInfo) -> Vec<String> {
        item.receipts
            .iter()
            .map(|r| r.packageid.clone())
            .filter(|pkgid| {
                match st.analysis.pkg_references.get(pkgid) {
                    Some(refs) => refs.iter().all(|n| n == &item.name),
                    None => true,
                }
            })
            .collect()
    }

    fn download_installer(&self, st: &mut PlanState<'a>, item: &PkgInfo) -> Result<(), String> {
        match &item.installer_item_location {
            Some(location) => self.download_artifact(st, item, &location.clone()),
            // Script-only installs carry no artifact.
            None => Ok(()),
        }
    }

    fn download_artifact(
        &self,
        st: &mut PlanState<'a>,
        item: &PkgInfo,
        location: &str,
    ) -> Result<(), String> {
        let dest = self.dirs.installer_path(location);
        let expected_hash = item.installer_item_hash.as_deref();

        // A cached copy with the right hash is good enough.
        if dest.exists() {
            if let Some(expected) = expected_hash {
                if let Ok(actual) = crate::fetch::sha256_of_file(&dest) {
                    if actual.eq_ignore_ascii_case(expected) {
                        return Ok(());
                    }
                }
                // Wrong bits on disk are the same as no bits.
                let _ = std::fs::remove_file(&dest);
            } else {
                return Ok(());
            }
        }

        let fetcher = match self.fetcher {
            Some(f) => f,
            None => return Err("installer item is not in the cache".to_string()),
        };

        let evictable: Vec<PathBuf> = st
            .prior_precache
            .iter()
            .filter(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())
                != dest.file_name().map(|n| n.to_string_lossy().into_owned()))
            .cloned()
            .collect();
        cache::ensure_disk_space(self.dirs, item, &evictable)
            .map_err(|e| e.to_string())?;

        let base = self
            .prefs
            .repo_url("PackageURL", "pkgs")
            .ok_or_else(|| "no package URL configured".to_string())?;
        let url = Url::parse(&format!("{}/{}", base.trim_end_matches('/'), location))
            .map_err(|_| format!("invalid installer URL for {}", location))?;

        let opts = FetchOptions {
            resume: true,
            expected_hash: expected_hash.map(str::to_string),
            message: Some(format!("Downloading {}", item.display_name())),
            ..Default::default()
        };
        match fetcher.fetch(&url, &dest, &opts) {
            Ok(_) => Ok(()),
            Err(FetchError::Http { code, .. }) => {
                Err(format!("HTTP error {} retrieving {}", code, location))
            }
            Err(FetchError::Integrity { .. }) => {
                Err("installer integrity check failed".to_string())
            }
            Err(FetchError::MissingHash(_)) => {
                Err("package verification is strict and no hash was supplied".to_string())
            }
            Err(FetchError::Connection(..)) => Err("could not contact the server".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn merge_selfserve(
        &self,
        st: &mut PlanState<'a>,
        report: &mut Report,
        catalogs: &[String],
    ) -> Result<(), PlanError> {
        let selfserve = match selfservice::load(self.dirs) {
            Some(m) => m,
            None => return Ok(()),
        };

        for name in &selfserve.managed_installs {
            if stop::stop_requested() {
                return Err(PlanError::StopRequested);
            }
            // Only items still offered as optional installs are honored.
            let offered = st
                .info
                .optional_installs
                .iter()
                .find(|o| &o.info.name == name)
                .map(|o| (o.note.is_some(), o.licensed_seat_info_available));
            let Some((has_note, seats)) = offered else {
                continue;
            };
            if has_note {
                continue;
            }
            if seats == Some(true) {
                // Licensed seats are authoritative server-side; without a
                // seat confirmation the item stays un-planned.
                log::debug!("Skipping {}: no confirmed license seat", name);
                continue;
            }
            self.process_install(st, report, name, catalogs, false);
        }

        for name in &selfserve.managed_uninstalls {
            self.process_removal(st, report, name, catalogs);
        }
        Ok(())
    }

    fn post_process(&self, st: &mut PlanState<'a>, report: &mut Report) {
        // Entries that could not be satisfied move to problem_items.
        let (problems, installs): (Vec<_>, Vec<_>) = st
            .info
            .managed_installs
            .drain(..)
            .partition(|i| i.note.is_some());
        st.info.managed_installs = installs;
        st.info.problem_items.extend(problems);

        // OS installers run last, and only one is honored.
        let (mut os_installers, rest): (Vec<_>, Vec<_>) = st
            .info
            .managed_installs
            .drain(..)
            .partition(|i| i.info.is_os_installer());
        if os_installers.len() > 1 {
            report.warn(
                "Multiple OS installers are in the plan; only the first will be processed",
            );
            os_installers.truncate(1);
        }
        st.info.managed_installs = rest;
        st.info.managed_installs.extend(os_installers);

        // Annotate the optional-install catalog with plan outcomes.
        for optional in &mut st.info.optional_installs {
            let name = optional.info.name.clone();
            let planned_install = st.info.processed_installs.contains(&name)
                && st
                    .info
                    .managed_installs
                    .iter()
                    .any(|i| i.info.name == name);
            let planned_removal = st.info.processed_uninstalls.contains(&name)
                && st.info.removals.iter().any(|r| r.info.name == name);
            optional.will_be_installed = planned_install.then_some(true);
            optional.will_be_removed = planned_removal.then_some(true);
            let update_available = optional.needs_update == Some(true) && !planned_install;
            optional.update_available = update_available.then_some(true);
        }
    }

    /// Deletes cache entries not referenced by the current plan or by
    /// precache-flagged optional installs.
    fn clean_cache(&self, st: &PlanState<'a>) {
        let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();
        for item in &st.info.managed_installs {
            if let Some(name) = &item.installer_item {
                referenced.insert(name.clone());
            }
        }
        for item in &st.info.removals {
            if let Some(name) = &item.uninstaller_item {
                referenced.insert(name.clone());
            }
        }
        for item in &st.info.problem_items {
            if let Some(name) = &item.installer_item {
                referenced.insert(name.clone());
            }
        }
        for optional in &st.info.optional_installs {
            if optional.info.precache {
                if let Some(loc) = &optional.info.installer_item_location {
                    referenced.insert(cache::basename(loc).to_string());
                }
            }
        }
        cache::clean_cache(self.dirs, &referenced);
    }

    /// Bookkeeping for notification throttling: the first-seen date of each
    /// still-pending install, so the UI can honor
    /// `DaysBetweenNotifications` without re-deriving history.
    fn track_pending_updates(&self, info: &InstallInfo) {
        let path = self.dirs.update_tracking_path();
        let previous: plist::Dictionary = plist::from_file(&path).unwrap_or_default();
        let mut tracking = plist::Dictionary::new();
        let now = plist::Value::Date(plist::Date::from(std::time::SystemTime::now()));
        for item in info.managed_installs.iter().chain(info.problem_items.iter()) {
            let key = item.info.name.clone();
            let first_seen = previous.get(&key).cloned().unwrap_or_else(|| now.clone());
            tracking.insert(key, first_seen);
        }
        if tracking.is_empty() {
            let _ = std::fs::remove_file(&path);
        } else if let Err(e) = plist::to_file_xml(&path, &plist::Value::Dictionary(tracking)) {
            log::warn!("Could not write update tracking data: {}", e);
        }
    }

    /// Snapshot of the application inventory consulted this run.
    fn write_app_inventory(&self) {
        let mut entries: Vec<plist::Dictionary> = Vec::new();
        let mut bundle_ids: Vec<&String> = self.apps.keys().collect();
        bundle_ids.sort();
        for bundle_id in bundle_ids {
            let app = &self.apps[bundle_id];
            let mut dict = plist::Dictionary::new();
            dict.insert("bundleid".into(), plist::Value::String(bundle_id.clone()));
            dict.insert("version".into(), plist::Value::String(app.version.clone()));
            dict.insert("path".into(), plist::Value::String(app.path.clone()));
            entries.push(dict);
        }
        if let Err(e) = plist::to_file_xml(self.dirs.app_inventory_path(), &entries) {
            log::warn!("Could not write application inventory: {}", e);
        }
    }

    /// Persists the plan only when it differs from what is already on disk.
    fn write_installinfo(&self, info: &InstallInfo, report: &mut Report) -> bool {
        let path = self.dirs.installinfo_path();
        if let Ok(existing) = plist::from_file::<_, InstallInfo>(&path) {
            if existing == *info {
                log::info!("No change to managed software plan");
                return false;
            }
        }
        if let Err(e) = plist::to_file_xml(&path, info) {
            report.error(format!("Could not write InstallInfo: {}", e));
            return false;
        }
        true
    }
}

/// Renders a serializable record as a plist dictionary (for the run
/// report).
fn to_dictionary<T: serde::Serialize>(value: &T) -> Option<plist::Dictionary> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, value).ok()?;
    plist::from_bytes(&buf).ok()
}
