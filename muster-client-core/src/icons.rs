use std::collections::HashSet;
use std::fs;

use url::Url;

use muster_types::{InstallInfo, PkgInfo};

use crate::cache::ManagedDirs;
use crate::fetch::{sha256_of_file, FetchError, FetchOptions, Fetcher};
use crate::prefs::Preferences;

const ICON_HASHES_FILE: &str = "_icon_hashes.plist";

fn icon_filename(item: &PkgInfo) -> String {
    match &item.icon_name {
        Some(name) if !name.is_empty() => {
            if name.contains('.') {
                name.clone()
            } else {
                format!("{}.png", name)
            }
        }
        _ => format!("{}.png", item.name),
    }
}

fn ui_items(info: &InstallInfo) -> Vec<&PkgInfo> {
    info.optional_installs
        .iter()
        .map(|o| &o.info)
        .chain(info.managed_installs.iter().map(|i| &i.info))
        .chain(info.problem_items.iter().map(|i| &i.info))
        .chain(info.removals.iter().map(|r| &r.info))
        .collect()
}

/// Downloads up-to-date icons for every item that may appear in the UI and
/// sweeps icons no longer referenced.
pub fn sync_icons(
    dirs: &ManagedDirs,
    fetcher: Option<&Fetcher>,
    prefs: &Preferences,
    info: &InstallInfo,
) {
    let base_url = prefs.repo_url("IconURL", "icons");
    let icons_dir = dirs.icons_dir();

    // The server-side hash index, refreshed once per run.
    let hashes_path = icons_dir.join(ICON_HASHES_FILE);
    if let (Some(fetcher), Some(base)) = (fetcher, base_url.as_deref()) {
        if let Ok(url) = Url::parse(&format!("{}/{}", base.trim_end_matches('/'), ICON_HASHES_FILE))
        {
            if let Err(e) = fetcher.fetch(&url, &hashes_path, &FetchOptions::default()) {
                log::debug!("Could not refresh icon hash index: {}", e);
            }
        }
    }
    let icon_hashes: plist::Dictionary = plist::from_file(&hashes_path).unwrap_or_default();

    let mut referenced: HashSet<String> = HashSet::new();
    referenced.insert(ICON_HASHES_FILE.to_string());

    for item in ui_items(info) {
        let filename = icon_filename(item);
        if referenced.contains(&filename) {
            continue;
        }
        referenced.insert(filename.clone());

        let expected = item
            .icon_hash
            .clone()
            .or_else(|| {
                icon_hashes
                    .get(&filename)
                    .and_then(|v| v.as_string())
                    .map(str::to_string)
            });

        let local = icons_dir.join(&filename);
        if let (true, Some(expected)) = (local.exists(), expected.as_deref()) {
            if sha256_of_file(&local)
                .map(|actual| actual.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
            {
                continue;
            }
        } else if local.exists() && expected.is_none() {
            continue;
        }

        let (Some(fetcher), Some(base)) = (fetcher, base_url.as_deref()) else {
            continue;
        };
        let url = match Url::parse(&format!("{}/{}", base.trim_end_matches('/'), filename)) {
            Ok(u) => u,
            Err(_) => continue,
        };
        let opts = FetchOptions {
            expected_hash: expected,
            ..Default::default()
        };
        match fetcher.fetch(&url, &local, &opts) {
            Ok(_) => {}
            Err(FetchError::Http { code: 404, .. }) => {
                log::debug!("No icon available for {}", item.name);
            }
            Err(e) => log::warn!("Could not fetch icon {}: {}", filename, e),
        }
    }

    sweep_unreferenced(dirs, &referenced);
}

fn sweep_unreferenced(dirs: &ManagedDirs, referenced: &HashSet<String>) {
    let entries = match fs::read_dir(dirs.icons_dir()) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let base = name
            .strip_suffix(".info.json")
            .or_else(|| name.strip_suffix(".download"))
            .unwrap_or(&name)
            .to_string();
        if !referenced.contains(&base) {
            log::debug!("Removing unreferenced icon {}", name);
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// Fetches the optional custom client resource archive.
pub fn fetch_client_resources(dirs: &ManagedDirs, fetcher: Option<&Fetcher>, prefs: &Preferences) {
    let Some(fetcher) = fetcher else { return };
    let Some(base) = prefs.repo_url("ClientResourceURL", "client_resources") else {
        return;
    };
    let filename = prefs
        .string("ClientResourcesFilename")
        .unwrap_or_else(|| "custom.zip".to_string());
    let url = match Url::parse(&format!("{}/{}", base.trim_end_matches('/'), filename)) {
        Ok(u) => u,
        Err(_) => return,
    };
    let dest = dirs.client_resources_dir().join(&filename);
    match fetcher.fetch(&url, &dest, &FetchOptions::default()) {
        Ok(_) => {}
        Err(FetchError::Http { code: 404, .. }) => {}
        Err(e) => log::warn!("Could not fetch client resources: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_types::OptionalItem;

    #[test]
    fn test_icon_filename_rules() {
        let mut item = PkgInfo::default();
        item.name = "AppA".into();
        assert_eq!(icon_filename(&item), "AppA.png");
        item.icon_name = Some("Custom".into());
        assert_eq!(icon_filename(&item), "Custom.png");
        item.icon_name = Some("Custom.icns".into());
        assert_eq!(icon_filename(&item), "Custom.icns");
    }

    #[test]
    fn test_sync_sweeps_unreferenced_icons_offline() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ManagedDirs::new(tmp.path());
        dirs.ensure().unwrap();
        let prefs = Preferences::in_dir(tmp.path());

        fs::write(dirs.icons_dir().join("Wanted.png"), b"icon").unwrap();
        fs::write(dirs.icons_dir().join("Stale.png"), b"icon").unwrap();

        let mut info = InstallInfo::default();
        let mut optional = OptionalItem::default();
        optional.info.name = "Wanted".into();
        info.optional_installs.push(optional);

        sync_icons(&dirs, None, &prefs, &info);
        assert!(dirs.icons_dir().join("Wanted.png").exists());
        assert!(!dirs.icons_dir().join("Stale.png").exists());
    }
}
