use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use muster_types::PkgInfo;

/// Headroom demanded on top of an item's own footprint before a download is
/// attempted.
const SPACE_HEADROOM: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error at {}", .1.display())]
    Io(#[source] std::io::Error, PathBuf),

    #[error("Insufficient disk space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
}

/// The on-disk layout under `ManagedInstallDir`. Every persisted artifact the
/// engine owns lives below this root.
#[derive(Debug, Clone)]
pub struct ManagedDirs {
    root: PathBuf,
}

impl ManagedDirs {
    pub fn new<P: Into<PathBuf>>(root: P) -> ManagedDirs {
        ManagedDirs { root: root.into() }
    }

    pub fn ensure(&self) -> Result<(), CacheError> {
        for dir in [
            self.root.clone(),
            self.catalogs_dir(),
            self.manifests_dir(),
            self.icons_dir(),
            self.cache_dir(),
            self.client_resources_dir(),
            self.logs_dir(),
            self.archives_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| CacheError::Io(e, dir.clone()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalogs_dir(&self) -> PathBuf {
        self.root.join("catalogs")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.root.join("icons")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("Cache")
    }

    pub fn client_resources_dir(&self) -> PathBuf {
        self.root.join("client_resources")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("Logs")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("Archives")
    }

    pub fn installinfo_path(&self) -> PathBuf {
        self.root.join("InstallInfo.plist")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("ManagedInstallReport.plist")
    }

    pub fn usage_db_path(&self) -> PathBuf {
        self.root.join("application_usage.sqlite")
    }

    pub fn selfserve_manifest_path(&self) -> PathBuf {
        self.manifests_dir().join("SelfServeManifest")
    }

    pub fn update_tracking_path(&self) -> PathBuf {
        self.root.join("UpdateNotificationTracking.plist")
    }

    pub fn app_inventory_path(&self) -> PathBuf {
        self.root.join("ApplicationInventory.plist")
    }

    /// Cache filename for an installer artifact is the URL basename.
    pub fn installer_path(&self, installer_item_location: &str) -> PathBuf {
        self.cache_dir().join(basename(installer_item_location))
    }
}

pub fn basename(location: &str) -> &str {
    location.rsplit('/').next().unwrap_or(location)
}

/// Deletes everything in `Cache/` whose basename is not referenced by the
/// current plan, including orphaned partials and their sidecars.
pub fn clean_cache(dirs: &ManagedDirs, referenced: &HashSet<String>) {
    let cache = dirs.cache_dir();
    let entries = match fs::read_dir(&cache) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let base = name
            .strip_suffix(".download")
            .or_else(|| name.strip_suffix(".info.json"))
            .unwrap_or(&name)
            .to_string();
        if !referenced.contains(&base) {
            log::debug!("Removing unreferenced cache entry {}", name);
            if let Err(e) = fs::remove_file(entry.path()) {
                log::warn!("Could not remove {}: {}", entry.path().display(), e);
            }
        }
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Bytes this item still needs before its download can start, per the
/// download policy: installed footprint plus installer size, minus what is
/// already on disk, plus fixed headroom.
fn required_bytes(dirs: &ManagedDirs, item: &PkgInfo) -> u64 {
    let installer_kb = item.installer_item_size.unwrap_or(0);
    let installed_kb = item.installed_size.unwrap_or(installer_kb);
    let mut required = (installer_kb + installed_kb) * 1024;

    if let Some(location) = &item.installer_item_location {
        let dest = dirs.installer_path(location);
        let mut partial = dest.file_name().unwrap_or_default().to_os_string();
        partial.push(".download");
        let already = file_size(&dest).max(file_size(&dest.with_file_name(partial)));
        required = required.saturating_sub(already);
    }

    required + SPACE_HEADROOM
}

/// Checks free space for a download, evicting precached optional items
/// (smallest first) when that would make the download fit. If evicting the
/// whole candidate set still would not free enough, nothing is evicted.
pub fn ensure_disk_space(
    dirs: &ManagedDirs,
    item: &PkgInfo,
    evictable: &[PathBuf],
) -> Result<(), CacheError> {
    let needed = required_bytes(dirs, item);
    let cache = dirs.cache_dir();
    let available = fs4::available_space(&cache).unwrap_or(u64::MAX);
    if available >= needed {
        return Ok(());
    }

    let mut candidates: Vec<(PathBuf, u64)> = evictable
        .iter()
        .filter(|p| p.exists())
        .map(|p| (p.clone(), file_size(p)))
        .collect();
    candidates.sort_by_key(|(_, size)| *size);
    let reclaimable: u64 = candidates.iter().map(|(_, s)| s).sum();

    if available.saturating_add(reclaimable) < needed {
        return Err(CacheError::InsufficientSpace { needed, available });
    }

    let mut freed = 0u64;
    for (path, size) in candidates {
        if available.saturating_add(freed) >= needed {
            break;
        }
        log::info!("Evicting precached item {} to free space", path.display());
        if fs::remove_file(&path).is_ok() {
            let mut sidecar = path.file_name().unwrap_or_default().to_os_string();
            sidecar.push(".info.json");
            let _ = fs::remove_file(path.with_file_name(sidecar));
            freed += size;
        }
    }

    let available = fs4::available_space(&cache).unwrap_or(u64::MAX);
    if available >= needed {
        Ok(())
    } else {
        Err(CacheError::InsufficientSpace { needed, available })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let dirs = ManagedDirs::new("/var/lib/muster");
        assert_eq!(dirs.cache_dir(), PathBuf::from("/var/lib/muster/Cache"));
        assert_eq!(
            dirs.installer_path("apps/AppA-1.0.pkg"),
            PathBuf::from("/var/lib/muster/Cache/AppA-1.0.pkg")
        );
        assert_eq!(basename("AppB-2.0.pkg"), "AppB-2.0.pkg");
    }

    #[test]
    fn test_clean_cache_keeps_referenced_and_partials() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let cache = dirs.cache_dir();
        fs::write(cache.join("keep.pkg"), b"x").unwrap();
        fs::write(cache.join("keep.pkg.info.json"), b"{}").unwrap();
        fs::write(cache.join("drop.pkg"), b"x").unwrap();
        fs::write(cache.join("orphan.pkg.download"), b"x").unwrap();

        let referenced: HashSet<String> = ["keep.pkg".to_string()].into_iter().collect();
        clean_cache(&dirs, &referenced);

        assert!(cache.join("keep.pkg").exists());
        assert!(cache.join("keep.pkg.info.json").exists());
        assert!(!cache.join("drop.pkg").exists());
        assert!(!cache.join("orphan.pkg.download").exists());
    }

    #[test]
    fn test_ensure_disk_space_trivially_ok_for_small_items() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let mut item = PkgInfo::default();
        item.name = "Small".into();
        item.installer_item_size = Some(1);
        item.installed_size = Some(1);
        assert!(ensure_disk_space(&dirs, &item, &[]).is_ok());
    }
}
