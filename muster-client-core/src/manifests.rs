use std::fs;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;
use url::Url;

use muster_types::Manifest;

use crate::cache::ManagedDirs;
use crate::fetch::{FetchError, FetchOptions, Fetcher};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest not found: {0}")]
    NotFound(String),

    #[error("Manifest name is not acceptable: {0}")]
    BadName(String),

    #[error("Manifest {0} is not a valid property list")]
    Invalid(String, #[source] plist::Error),

    #[error("Could not fetch manifest {0}")]
    Fetch(String, #[source] FetchError),

    #[error("No manifest URL is configured")]
    NoBaseUrl,
}

/// Fetches and caches named manifests under
/// `<ManagedInstallDir>/manifests/`, and tracks the set in use this run so
/// stale cached manifests can be swept afterwards.
pub struct ManifestStore<'a> {
    dirs: &'a ManagedDirs,
    fetcher: Option<&'a Fetcher>,
    base_url: Option<String>,
    loaded: IndexMap<String, Manifest>,
}

impl<'a> ManifestStore<'a> {
    pub fn new(
        dirs: &'a ManagedDirs,
        fetcher: Option<&'a Fetcher>,
        base_url: Option<String>,
    ) -> ManifestStore<'a> {
        ManifestStore {
            dirs,
            fetcher,
            base_url,
            loaded: IndexMap::new(),
        }
    }

    /// Manifests fetched so far this run, in first-use order.
    pub fn in_use(&self) -> impl Iterator<Item = &str> {
        self.loaded.keys().map(String::as_str)
    }

    pub fn get_cached(&self, name: &str) -> Option<&Manifest> {
        self.loaded.get(name)
    }

    fn cache_path(&self, name: &str) -> Result<PathBuf, ManifestError> {
        let rel = Path::new(name);
        let ok = !rel.is_absolute()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !ok {
            return Err(ManifestError::BadName(name.to_string()));
        }
        Ok(self.dirs.manifests_dir().join(rel))
    }

    fn parse(&self, name: &str, path: &Path) -> Result<Manifest, ManifestError> {
        match plist::from_file::<_, Manifest>(path) {
            Ok(m) => Ok(m),
            Err(e) => {
                // A broken cached manifest is useless; drop it so the next
                // run refetches.
                let _ = fs::remove_file(path);
                Err(ManifestError::Invalid(name.to_string(), e))
            }
        }
    }

    /// Fetches a manifest by name, falling back to the last cached copy when
    /// the server cannot be reached.
    pub fn manifest(&mut self, name: &str) -> Result<Manifest, ManifestError> {
        if let Some(m) = self.loaded.get(name) {
            return Ok(m.clone());
        }

        let dest = self.cache_path(name)?;
        if let Some(fetcher) = self.fetcher {
            let base = self.base_url.as_deref().ok_or(ManifestError::NoBaseUrl)?;
            let url = join_url(base, name)
                .ok_or_else(|| ManifestError::BadName(name.to_string()))?;
            let opts = FetchOptions {
                message: Some(format!("Retrieving list of software for this machine ({})", name)),
                ..Default::default()
            };
            match fetcher.fetch(&url, &dest, &opts) {
                Ok(_) => {}
                Err(FetchError::Http { code: 404, .. }) => {
                    return Err(ManifestError::NotFound(name.to_string()));
                }
                Err(e) => {
                    if dest.exists() {
                        log::warn!(
                            "Could not refresh manifest {}; using cached copy: {}",
                            name,
                            e
                        );
                    } else {
                        return Err(ManifestError::Fetch(name.to_string(), e));
                    }
                }
            }
        } else if !dest.exists() {
            return Err(ManifestError::NotFound(name.to_string()));
        }

        let manifest = self.parse(name, &dest)?;
        self.loaded.insert(name.to_string(), manifest.clone());
        Ok(manifest)
    }

    /// Loads a manifest from an arbitrary local path (the `LocalOnlyManifest`
    /// and passed-in primary cases). Not entered into the in-use set.
    pub fn local_manifest(&self, path: &Path) -> Result<Manifest, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.display().to_string()));
        }
        plist::from_file(path)
            .map_err(|e| ManifestError::Invalid(path.display().to_string(), e))
    }

    /// Resolves the primary manifest: the first candidate identity that
    /// exists on the server (or in cache when the server is unreachable).
    pub fn primary(&mut self, candidates: &[String]) -> Result<(String, Manifest), ManifestError> {
        let mut last_err = None;
        for name in candidates {
            if name.is_empty() {
                continue;
            }
            match self.manifest(name) {
                Ok(m) => {
                    log::info!("Using manifest: {}", name);
                    return Ok((name.clone(), m));
                }
                Err(ManifestError::NotFound(_)) => continue,
                Err(e @ ManifestError::Invalid(..)) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ManifestError::NotFound(candidates.join(", "))
        }))
    }

    /// Removes cached manifests that were not used this run. The self-serve
    /// manifest is always preserved.
    pub fn clean_up(&self) {
        let root = self.dirs.manifests_dir();
        let keep: Vec<PathBuf> = self
            .loaded
            .keys()
            .filter_map(|n| self.cache_path(n).ok())
            .chain(std::iter::once(self.dirs.selfserve_manifest_path()))
            .collect();
        sweep(&root, &keep);
    }
}

fn sweep(dir: &Path, keep: &[PathBuf]) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep(&path, keep);
            // Prune directories emptied by the sweep.
            let _ = fs::remove_dir(&path);
        } else if !keep.contains(&path) && !path.extension().map_or(false, |e| e == "json") {
            log::debug!("Removing unused cached manifest {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
}

fn join_url(base: &str, name: &str) -> Option<Url> {
    let mut joined = base.trim_end_matches('/').to_string();
    for segment in name.split('/') {
        joined.push('/');
        joined.push_str(segment);
    }
    Url::parse(&joined).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &ManagedDirs, name: &str, manifest: &Manifest) {
        let path = dir.manifests_dir().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        plist::to_file_xml(&path, manifest).unwrap();
    }

    #[test]
    fn test_offline_manifest_lookup_and_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let mut m = Manifest::default();
        m.catalogs = vec!["production".into()];
        m.managed_installs = vec!["AppA".into()];
        write_manifest(&dirs, "site_default", &m);

        let mut store = ManifestStore::new(&dirs, None, None);
        let got = store.manifest("site_default").unwrap();
        assert_eq!(got.managed_installs, vec!["AppA"]);
        assert_eq!(store.in_use().collect::<Vec<_>>(), vec!["site_default"]);

        assert!(matches!(
            store.manifest("missing"),
            Err(ManifestError::NotFound(_))
        ));
    }

    #[test]
    fn test_bad_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let mut store = ManifestStore::new(&dirs, None, None);
        assert!(matches!(
            store.manifest("../escape"),
            Err(ManifestError::BadName(_))
        ));
        assert!(matches!(
            store.manifest("/abs"),
            Err(ManifestError::BadName(_))
        ));
    }

    #[test]
    fn test_invalid_manifest_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let path = dirs.manifests_dir().join("broken");
        fs::write(&path, b"not a plist").unwrap();

        let mut store = ManifestStore::new(&dirs, None, None);
        assert!(matches!(
            store.manifest("broken"),
            Err(ManifestError::Invalid(..))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_primary_falls_through_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let m = Manifest::default();
        write_manifest(&dirs, "site_default", &m);

        let mut store = ManifestStore::new(&dirs, None, None);
        let candidates = vec![
            "host123".to_string(),
            "".to_string(),
            "site_default".to_string(),
        ];
        let (name, _) = store.primary(&candidates).unwrap();
        assert_eq!(name, "site_default");
    }

    #[test]
    fn test_clean_up_preserves_in_use_and_selfserve() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();

        let m = Manifest::default();
        write_manifest(&dirs, "used", &m);
        write_manifest(&dirs, "stale", &m);
        plist::to_file_xml(dirs.selfserve_manifest_path(), &m).unwrap();

        let mut store = ManifestStore::new(&dirs, None, None);
        store.manifest("used").unwrap();
        store.clean_up();

        assert!(dirs.manifests_dir().join("used").exists());
        assert!(!dirs.manifests_dir().join("stale").exists());
        assert!(dirs.selfserve_manifest_path().exists());
    }
}
