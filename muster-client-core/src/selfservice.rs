use std::fs;
use std::path::Path;

use muster_types::Manifest;

use crate::cache::ManagedDirs;

/// Copies the user-writable self-serve manifest from its shared drop
/// location into the managed manifest directory, then deletes the original.
/// A symlink at the origin is refused and removed without copying; an
/// unparseable file is discarded.
pub fn ingest_origin(dirs: &ManagedDirs, origin: &Path) {
    let meta = match fs::symlink_metadata(origin) {
        Ok(m) => m,
        Err(_) => return,
    };
    if meta.file_type().is_symlink() {
        log::warn!(
            "Refusing symlinked self-serve manifest at {}",
            origin.display()
        );
        let _ = fs::remove_file(origin);
        return;
    }

    // Validate before accepting; the origin is world-writable.
    match plist::from_file::<_, Manifest>(origin) {
        Ok(_) => {
            let dest = dirs.selfserve_manifest_path();
            if let Err(e) = fs::copy(origin, &dest) {
                log::warn!("Could not copy self-serve manifest: {}", e);
                return;
            }
            let _ = fs::remove_file(origin);
        }
        Err(e) => {
            log::warn!(
                "Ignoring malformed self-serve manifest at {}: {}",
                origin.display(),
                e
            );
            let _ = fs::remove_file(origin);
        }
    }
}

pub fn load(dirs: &ManagedDirs) -> Option<Manifest> {
    let path = dirs.selfserve_manifest_path();
    if !path.exists() {
        return None;
    }
    match plist::from_file(&path) {
        Ok(m) => Some(m),
        Err(e) => {
            log::warn!("Could not read self-serve manifest: {}", e);
            None
        }
    }
}

pub fn save(dirs: &ManagedDirs, manifest: &Manifest) {
    if let Err(e) = plist::to_file_xml(dirs.selfserve_manifest_path(), manifest) {
        log::warn!("Could not write self-serve manifest: {}", e);
    }
}

/// Seeds default installs: each name is recorded in the self-serve
/// `default_installs` ledger and, on first sight, added to its
/// `managed_installs`.
pub fn process_default_installs(dirs: &ManagedDirs, names: &[String]) {
    if names.is_empty() {
        return;
    }
    let mut manifest = load(dirs).unwrap_or_default();
    let mut changed = false;
    for name in names {
        if !manifest.default_installs.contains(name) {
            manifest.default_installs.push(name.clone());
            if !manifest.managed_installs.contains(name) {
                manifest.managed_installs.push(name.clone());
            }
            changed = true;
        }
    }
    if changed {
        save(dirs, &manifest);
    }
}

/// Drops a successfully-handled on-demand install from the self-serve
/// choices.
pub fn remove_from_installs(dirs: &ManagedDirs, name: &str) {
    if let Some(mut manifest) = load(dirs) {
        let before = manifest.managed_installs.len();
        manifest.managed_installs.retain(|n| n != name);
        if manifest.managed_installs.len() != before {
            save(dirs, &manifest);
        }
    }
}

/// After removals complete, uninstall requests that have been satisfied are
/// pruned so they do not repeat forever.
pub fn prune_uninstalls(dirs: &ManagedDirs, now_uninstalled: &[String]) {
    if now_uninstalled.is_empty() {
        return;
    }
    if let Some(mut manifest) = load(dirs) {
        let before = manifest.managed_uninstalls.len();
        manifest
            .managed_uninstalls
            .retain(|n| !now_uninstalled.contains(n));
        if manifest.managed_uninstalls.len() != before {
            save(dirs, &manifest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs() -> (tempfile::TempDir, ManagedDirs) {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();
        (tmp, dirs)
    }

    #[test]
    fn test_ingest_copies_and_deletes_origin() {
        let (tmp, dirs) = dirs();
        let origin = tmp.path().join("drop").join("SelfServeManifest");
        fs::create_dir_all(origin.parent().unwrap()).unwrap();
        let mut m = Manifest::default();
        m.managed_installs = vec!["EditorX".into()];
        plist::to_file_xml(&origin, &m).unwrap();

        ingest_origin(&dirs, &origin);
        assert!(!origin.exists());
        let loaded = load(&dirs).unwrap();
        assert_eq!(loaded.managed_installs, vec!["EditorX"]);
    }

    #[test]
    fn test_ingest_refuses_garbage() {
        let (tmp, dirs) = dirs();
        let origin = tmp.path().join("SelfServeManifest");
        fs::write(&origin, b"not a plist at all").unwrap();

        ingest_origin(&dirs, &origin);
        assert!(!origin.exists());
        assert!(load(&dirs).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_ingest_refuses_symlink() {
        let (tmp, dirs) = dirs();
        let target = tmp.path().join("real");
        fs::write(&target, b"x").unwrap();
        let origin = tmp.path().join("SelfServeManifest");
        std::os::unix::fs::symlink(&target, &origin).unwrap();

        ingest_origin(&dirs, &origin);
        assert!(!origin.exists());
        assert!(load(&dirs).is_none());
    }

    #[test]
    fn test_default_installs_seed_once() {
        let (_tmp, dirs) = dirs();
        process_default_installs(&dirs, &["AppA".to_string()]);
        let m = load(&dirs).unwrap();
        assert_eq!(m.default_installs, vec!["AppA"]);
        assert_eq!(m.managed_installs, vec!["AppA"]);

        // User later opts out.
        remove_from_installs(&dirs, "AppA");
        // A second default-install pass does not force it back.
        process_default_installs(&dirs, &["AppA".to_string()]);
        let m = load(&dirs).unwrap();
        assert!(m.managed_installs.is_empty());
    }

    #[test]
    fn test_prune_uninstalls() {
        let (_tmp, dirs) = dirs();
        let mut m = Manifest::default();
        m.managed_uninstalls = vec!["Gone".into(), "Still".into()];
        save(&dirs, &m);

        prune_uninstalls(&dirs, &["Gone".to_string()]);
        let m = load(&dirs).unwrap();
        assert_eq!(m.managed_uninstalls, vec!["Still"]);
    }
}
