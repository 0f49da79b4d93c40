use std::fs;

use hashbrown::HashMap;
use indexmap::IndexMap;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use url::Url;

use muster_types::{split_name_and_version, trim_version, Catalog, LooseVersion, PkgInfo};

use crate::cache::ManagedDirs;
use crate::conditions::{predicate_is_true, FactValue, Facts};
use crate::fetch::{FetchError, FetchOptions, Fetcher};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog not found: {0}")]
    NotFound(String),

    #[error("Catalog {0} is not a valid property list")]
    Invalid(String, #[source] plist::Error),

    #[error("Could not fetch catalog {0}")]
    Fetch(String, #[source] FetchError),

    #[error("No catalog URL is configured")]
    NoBaseUrl,
}

/// Why `item_detail` passed over every candidate.
#[derive(Debug)]
pub enum ItemDetailError {
    /// The name is in none of the consulted catalogs.
    NotFound,
    /// Candidates existed but all were filtered, for the recorded reasons.
    Rejected(Vec<String>),
}

fn nfc(name: &str) -> String {
    name.nfc().collect()
}

/// Fetches catalog documents into `<ManagedInstallDir>/catalogs/` with
/// cached-copy fallback, mirroring the manifest store.
pub struct CatalogStore<'a> {
    dirs: &'a ManagedDirs,
    fetcher: Option<&'a Fetcher>,
    base_url: Option<String>,
}

impl<'a> CatalogStore<'a> {
    pub fn new(
        dirs: &'a ManagedDirs,
        fetcher: Option<&'a Fetcher>,
        base_url: Option<String>,
    ) -> CatalogStore<'a> {
        CatalogStore {
            dirs,
            fetcher,
            base_url,
        }
    }

    pub fn catalog(&self, name: &str) -> Result<Catalog, CatalogError> {
        let dest = self.dirs.catalogs_dir().join(name);
        if let Some(fetcher) = self.fetcher {
            let base = self.base_url.as_deref().ok_or(CatalogError::NoBaseUrl)?;
            let url = Url::parse(&format!("{}/{}", base.trim_end_matches('/'), name))
                .map_err(|_| CatalogError::NotFound(name.to_string()))?;
            let opts = FetchOptions {
                message: Some(format!("Retrieving catalog {}", name)),
                ..Default::default()
            };
            match fetcher.fetch(&url, &dest, &opts) {
                Ok(_) => {}
                Err(FetchError::Http { code: 404, .. }) => {
                    return Err(CatalogError::NotFound(name.to_string()));
                }
                Err(e) => {
                    if dest.exists() {
                        log::warn!("Could not refresh catalog {}; using cached copy: {}", name, e);
                    } else {
                        return Err(CatalogError::Fetch(name.to_string(), e));
                    }
                }
            }
        } else if !dest.exists() {
            return Err(CatalogError::NotFound(name.to_string()));
        }

        match plist::from_file(&dest) {
            Ok(catalog) => Ok(catalog),
            Err(e) => {
                let _ = fs::remove_file(&dest);
                Err(CatalogError::Invalid(name.to_string(), e))
            }
        }
    }
}

#[derive(Default)]
struct CatalogIndex {
    items: Vec<PkgInfo>,
    /// NFC-normalized name -> trimmed version -> item indexes.
    by_name: HashMap<String, HashMap<String, Vec<usize>>>,
    by_pkgid: HashMap<String, HashMap<String, Vec<usize>>>,
    updaters: Vec<usize>,
    autoremove_names: Vec<String>,
}

impl CatalogIndex {
    fn build(items: Vec<PkgInfo>) -> CatalogIndex {
        let mut index = CatalogIndex {
            items,
            ..Default::default()
        };
        let mut autoremove = Vec::new();
        for (i, item) in index.items.iter().enumerate() {
            if item.name.is_empty() || item.version.is_empty() {
                log::warn!("Bad catalog record (missing name or version): {:?}", item.name);
                continue;
            }
            let name = nfc(&item.name);
            let vers = trim_version(&item.version);
            index
                .by_name
                .entry(name.clone())
                .or_default()
                .entry(vers)
                .or_default()
                .push(i);

            for receipt in &item.receipts {
                if receipt.packageid.is_empty() || receipt.version.is_empty() {
                    continue;
                }
                index
                    .by_pkgid
                    .entry(receipt.packageid.clone())
                    .or_default()
                    .entry(receipt.version.clone())
                    .or_default()
                    .push(i);
            }

            if !item.update_for.is_empty() {
                index.updaters.push(i);
            }
            if item.autoremove && !autoremove.contains(&name) {
                autoremove.push(name);
            }
        }
        index.autoremove_names = autoremove;
        index
    }
}

/// Result of joining catalog receipts against the platform's installed
/// package list.
#[derive(Debug, Default)]
pub struct InstalledPkgAnalysis {
    /// Item name -> receipt ids its records declare.
    pub receipts_for_name: HashMap<String, Vec<String>>,
    /// Items whose required receipts are all present.
    pub installed_names: Vec<String>,
    /// Receipt id -> item names referencing it; consulted so shared receipts
    /// are not removed with one of their owners.
    pub pkg_references: HashMap<String, Vec<String>>,
}

/// In-memory indexes over all items in the consulted catalogs.
#[derive(Default)]
pub struct CatalogDb {
    catalogs: IndexMap<String, CatalogIndex>,
}

impl CatalogDb {
    pub fn new() -> CatalogDb {
        CatalogDb::default()
    }

    pub fn has_catalog(&self, name: &str) -> bool {
        self.catalogs.contains_key(name)
    }

    pub fn ingest(&mut self, name: &str, items: Catalog) {
        self.catalogs
            .insert(name.to_string(), CatalogIndex::build(items));
    }

    /// Fetches and ingests every catalog named, warning on the ones that
    /// cannot be loaded.
    pub fn load(&mut self, names: &[String], store: &CatalogStore<'_>) {
        for name in names {
            if self.has_catalog(name) {
                continue;
            }
            match store.catalog(name) {
                Ok(items) => self.ingest(name, items),
                Err(e) => log::warn!("Skipping catalog {}: {}", name, e),
            }
        }
    }

    /// Names flagged for automatic removal across the given catalogs,
    /// deduplicated in catalog order.
    pub fn autoremove_names(&self, cataloglist: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for catalog in cataloglist {
            if let Some(index) = self.catalogs.get(catalog) {
                for name in &index.autoremove_names {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
            }
        }
        out
    }

    /// Names of updater items applicable to `name` (the update-for relation)
    /// across the given catalogs.
    pub fn look_for_updates(&self, name: &str, cataloglist: &[String]) -> Vec<String> {
        let target = nfc(name);
        let mut out: Vec<String> = Vec::new();
        for catalog in cataloglist {
            let index = match self.catalogs.get(catalog) {
                Some(i) => i,
                None => continue,
            };
            for &i in &index.updaters {
                let item = &index.items[i];
                if item.update_for.iter().any(|u| nfc(u) == target)
                    && nfc(&item.name) != target
                    && !out.contains(&item.name)
                {
                    out.push(item.name.clone());
                }
            }
        }
        out
    }

    /// Every distinct item name across the given catalogs, in index order.
    pub fn item_names(&self, cataloglist: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for catalog in cataloglist {
            if let Some(index) = self.catalogs.get(catalog) {
                for name in index.by_name.keys() {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// All distinct items carrying `name`, newest version first, deduplicated
    /// by (name, version).
    pub fn all_items_with_name(&self, name: &str, cataloglist: &[String]) -> Vec<&PkgInfo> {
        let target = nfc(name);
        let mut seen: Vec<String> = Vec::new();
        let mut found: Vec<&PkgInfo> = Vec::new();
        for catalog in cataloglist {
            let index = match self.catalogs.get(catalog) {
                Some(i) => i,
                None => continue,
            };
            if let Some(versions) = index.by_name.get(&target) {
                for (vers, idxs) in versions {
                    if seen.contains(vers) {
                        continue;
                    }
                    seen.push(vers.clone());
                    if let Some(&i) = idxs.first() {
                        found.push(&index.items[i]);
                    }
                }
            }
        }
        found.sort_by(|a, b| {
            LooseVersion::new(&b.version).cmp(&LooseVersion::new(&a.version))
        });
        found
    }

    /// Per-name selection. Parses an optional version suffix from the
    /// reference, walks the catalogs in order, and returns the newest
    /// candidate passing every filter, recording why others were rejected.
    pub fn item_detail(
        &self,
        item_ref: &str,
        cataloglist: &[String],
        skip_min_os_check: bool,
        facts: &Facts,
    ) -> Result<&PkgInfo, ItemDetailError> {
        let (name, version) = split_name_and_version(item_ref);
        let target = nfc(&name);
        let exact = version.as_deref().map(trim_version);

        let mut rejections: Vec<String> = Vec::new();
        let mut found_any = false;

        for catalog in cataloglist {
            let index = match self.catalogs.get(catalog) {
                Some(i) => i,
                None => continue,
            };
            let versions = match index.by_name.get(&target) {
                Some(v) => v,
                None => continue,
            };
            found_any = true;

            let mut ordered: Vec<&String> = match &exact {
                Some(v) => versions.keys().filter(|k| *k == v).collect(),
                None => versions.keys().collect(),
            };
            ordered.sort_by(|a, b| LooseVersion::new(b).cmp(&LooseVersion::new(a)));

            for vers in ordered {
                for &i in &versions[vers] {
                    let item = &index.items[i];
                    match self.acceptable(item, skip_min_os_check, facts) {
                        Ok(()) => return Ok(item),
                        Err(reason) => {
                            log::debug!(
                                "Rejected {}-{} from {}: {}",
                                item.name,
                                item.version,
                                catalog,
                                reason
                            );
                            rejections.push(reason);
                        }
                    }
                }
            }
        }

        if found_any {
            Err(ItemDetailError::Rejected(rejections))
        } else {
            Err(ItemDetailError::NotFound)
        }
    }

    fn acceptable(
        &self,
        item: &PkgInfo,
        skip_min_os_check: bool,
        facts: &Facts,
    ) -> Result<(), String> {
        let fact_str = |key: &str| match facts.get(key) {
            Some(FactValue::Str(s)) => Some(s.clone()),
            _ => None,
        };

        if let Some(min_engine) = &item.minimum_muster_version {
            let current = fact_str("muster_version").unwrap_or_default();
            if LooseVersion::new(&current) < LooseVersion::new(min_engine) {
                return Err(format!(
                    "{}-{} requires client version {} or later",
                    item.name, item.version, min_engine
                ));
            }
        }

        let os_vers = fact_str("os_vers").unwrap_or_default();
        if !skip_min_os_check {
            if let Some(min_os) = &item.minimum_os_version {
                if LooseVersion::new(&os_vers) < LooseVersion::new(min_os) {
                    return Err(format!(
                        "{}-{} requires OS version {} or later",
                        item.name, item.version, min_os
                    ));
                }
            }
        }
        if let Some(max_os) = &item.maximum_os_version {
            if LooseVersion::new(&os_vers) > LooseVersion::new(max_os) {
                return Err(format!(
                    "{}-{} requires OS version {} or earlier",
                    item.name, item.version, max_os
                ));
            }
        }

        if !item.supported_architectures.is_empty() {
            let arch = fact_str("arch").unwrap_or_default();
            let x86_64_capable = matches!(
                facts.get("x86_64_capable"),
                Some(FactValue::Bool(true))
            );
            let arch_ok = item
                .supported_architectures
                .iter()
                .any(|a| *a == arch || (a == "x86_64" && x86_64_capable));
            if !arch_ok {
                return Err(format!(
                    "{}-{} does not support architecture {}",
                    item.name, item.version, arch
                ));
            }
        }

        if let Some(condition) = &item.installable_condition {
            match predicate_is_true(condition, facts) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(format!(
                        "{}-{} installable_condition is false",
                        item.name, item.version
                    ));
                }
                Err(e) => {
                    return Err(format!(
                        "{}-{} installable_condition could not be evaluated: {}",
                        item.name, item.version, e
                    ));
                }
            }
        }

        Ok(())
    }

    /// Joins catalog receipts against the platform's installed-package map.
    pub fn analyze_installed_pkgs(
        &self,
        installed: &HashMap<String, String>,
        cataloglist: &[String],
    ) -> InstalledPkgAnalysis {
        let mut analysis = InstalledPkgAnalysis::default();

        for catalog in cataloglist {
            let index = match self.catalogs.get(catalog) {
                Some(i) => i,
                None => continue,
            };
            for item in &index.items {
                if item.receipts.is_empty() {
                    continue;
                }
                let receipt_ids: Vec<String> = item
                    .receipts
                    .iter()
                    .map(|r| r.packageid.clone())
                    .collect();

                for pkgid in &receipt_ids {
                    let refs = analysis.pkg_references.entry(pkgid.clone()).or_default();
                    if !refs.contains(&item.name) {
                        refs.push(item.name.clone());
                    }
                }

                let entry = analysis
                    .receipts_for_name
                    .entry(item.name.clone())
                    .or_default();
                for pkgid in &receipt_ids {
                    if !entry.contains(pkgid) {
                        entry.push(pkgid.clone());
                    }
                }

                let all_required_present = item
                    .receipts
                    .iter()
                    .filter(|r| !r.optional)
                    .all(|r| installed.contains_key(&r.packageid));
                if all_required_present && !analysis.installed_names.contains(&item.name) {
                    analysis.installed_names.push(item.name.clone());
                }
            }
        }

        analysis
    }
}
