use std::path::PathBuf;

use url::Url;

use muster_types::InstallInfo;

use crate::cache::{self, ManagedDirs};
use crate::fetch::{FetchOptions, Fetcher};
use crate::prefs::Preferences;
use crate::stop;

fn agent_pid_path(dirs: &ManagedDirs) -> PathBuf {
    dirs.root().join("precache_agent.pid")
}

/// The background precaching task: downloads `precache`-flagged optional
/// installs from the persisted plan, oldest-first, and exits. Runs in its
/// own process so the main engine can finish independently.
pub fn run_agent(prefs: &Preferences) -> i32 {
    let dirs = ManagedDirs::new(prefs.managed_install_dir());
    if dirs.ensure().is_err() {
        return 1;
    }
    let _ = std::fs::write(agent_pid_path(&dirs), std::process::id().to_string());

    let plan: InstallInfo = match plist::from_file(dirs.installinfo_path()) {
        Ok(p) => p,
        Err(_) => {
            log::debug!("No plan to precache from");
            let _ = std::fs::remove_file(agent_pid_path(&dirs));
            return 0;
        }
    };

    let fetcher = match Fetcher::new(prefs) {
        Ok(f) => f,
        Err(e) => {
            log::warn!("Precache agent could not build a fetcher: {}", e);
            let _ = std::fs::remove_file(agent_pid_path(&dirs));
            return 1;
        }
    };
    let base = match prefs.repo_url("PackageURL", "pkgs") {
        Some(b) => b,
        None => {
            let _ = std::fs::remove_file(agent_pid_path(&dirs));
            return 1;
        }
    };

    let mut status = 0;
    for optional in plan.optional_installs.iter().filter(|o| o.info.precache) {
        if stop::stop_requested() {
            log::info!("Precache agent stopping on request");
            break;
        }
        let Some(location) = optional.info.installer_item_location.as_deref() else {
            continue;
        };
        let dest = dirs.installer_path(location);
        if dest.exists() {
            if let Some(expected) = optional.info.installer_item_hash.as_deref() {
                if crate::fetch::sha256_of_file(&dest)
                    .map(|actual| actual.eq_ignore_ascii_case(expected))
                    .unwrap_or(false)
                {
                    continue;
                }
            } else {
                continue;
            }
        }
        if cache::ensure_disk_space(&dirs, &optional.info, &[]).is_err() {
            log::info!(
                "Not precaching {}: not enough disk space",
                optional.info.name
            );
            continue;
        }
        let url = match Url::parse(&format!("{}/{}", base.trim_end_matches('/'), location)) {
            Ok(u) => u,
            Err(_) => continue,
        };
        let opts = FetchOptions {
            resume: true,
            expected_hash: optional.info.installer_item_hash.clone(),
            message: Some(format!("Precaching {}", optional.info.display_name())),
            ..Default::default()
        };
        if let Err(e) = fetcher.fetch(&url, &dest, &opts) {
            log::warn!("Precache of {} failed: {}", optional.info.name, e);
            status = 1;
        }
    }

    let _ = std::fs::remove_file(agent_pid_path(&dirs));
    status
}

/// True when the current plan carries anything worth precaching.
pub fn has_precachable_items(plan: &InstallInfo) -> bool {
    plan.optional_installs
        .iter()
        .any(|o| o.info.precache && o.info.installer_item_location.is_some())
}

/// Launches the precache agent as a detached re-exec of this binary.
pub fn spawn_agent() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("precache-agent")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    Ok(())
}

/// Stops a running agent, if any. The agent also honors the global stop
/// flag at download boundaries.
pub fn cancel_agent(dirs: &ManagedDirs) {
    let pid_path = agent_pid_path(dirs);
    let Ok(raw) = std::fs::read_to_string(&pid_path) else {
        return;
    };
    let _ = std::fs::remove_file(&pid_path);
    #[cfg(unix)]
    if let Ok(pid) = raw.trim().parse::<i32>() {
        log::info!("Stopping precache agent (pid {})", pid);
        let _ = std::process::Command::new("kill")
            .arg(pid.to_string())
            .status();
    }
    #[cfg(not(unix))]
    let _ = raw;
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_types::OptionalItem;

    #[test]
    fn test_has_precachable_items() {
        let mut plan = InstallInfo::default();
        assert!(!has_precachable_items(&plan));

        let mut optional = OptionalItem::default();
        optional.info.name = "BigSuite".into();
        optional.info.precache = true;
        optional.info.installer_item_location = Some("apps/BigSuite.pkg".into());
        plan.optional_installs.push(optional);
        assert!(has_precachable_items(&plan));

        plan.optional_installs[0].info.installer_item_location = None;
        assert!(!has_precachable_items(&plan));
    }

    #[test]
    fn test_agent_without_plan_exits_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let mut prefs = Preferences::in_dir(tmp.path());
        prefs
            .set(
                "ManagedInstallDir",
                plist::Value::String(tmp.path().join("managed").to_string_lossy().into_owned()),
            )
            .unwrap();
        assert_eq!(run_agent(&prefs), 0);
    }
}
