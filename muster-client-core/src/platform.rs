use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use thiserror::Error;

use muster_types::PkgInfo;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Platform tool failed with exit code {code}: {stderr}")]
    Tool { code: i32, stderr: String },

    #[error("Operation not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// The platform receipt database.
pub trait ReceiptOracle {
    fn list_installed_packages(&self) -> HashMap<String, String>;
    fn forget_package(&self, pkgid: &str) -> Result<(), PlatformError>;
}

/// Runs the native package installer over an artifact, feeding raw output
/// lines back so the caller can parse progress tokens.
pub trait InstallerRunner {
    fn run(
        &self,
        artifact: &Path,
        choices_xml: Option<&Path>,
        env: &BTreeMap<String, String>,
        on_output: &mut dyn FnMut(&str),
    ) -> Result<i32, PlatformError>;
}

pub trait DmgMounter {
    fn mount(&self, path: &Path) -> Result<Vec<PathBuf>, PlatformError>;
    fn unmount(&self, mountpoint: &Path) -> Result<(), PlatformError>;
}

pub trait ProfileStore {
    fn is_installed(&self, identifier: &str) -> bool;
    fn install(&self, path: &Path, identifier: &str) -> Result<(), PlatformError>;
    fn remove(&self, identifier: &str) -> Result<(), PlatformError>;
}

pub trait OsUpgradeRunner {
    /// Hands an OS installer artifact to the upgrade orchestrator.
    fn start_os_install(&self, artifact: &Path) -> Result<(), PlatformError>;
    /// Stages an OS installer for later activation.
    fn stage_os_installer(&self, artifact: &Path) -> Result<(), PlatformError>;
}

pub trait AdobeInstaller {
    fn install(&self, item: &PkgInfo, artifact: Option<&Path>) -> Result<i32, PlatformError>;
    fn uninstall(&self, item: &PkgInfo) -> Result<i32, PlatformError>;
}

/// The status-window collaborator. The engine only pushes strings and
/// percentages; rendering is out of scope.
pub trait UiNotifier {
    fn message(&self, text: &str);
    fn detail(&self, text: &str);
    /// `-1` means indeterminate.
    fn percent(&self, value: i32);
    fn hide_stop_button(&self) {}
    fn show_stop_button(&self) {}
}

pub trait ConsoleUserResolver {
    /// The current graphical-session user, `"loginwindow"` at the login
    /// screen, or `None` when nobody is logged in.
    fn console_user(&self) -> Option<String>;
}

/// Running-process names, for blocking-application checks.
pub trait ProcessOracle {
    fn running_process_names(&self) -> Vec<String>;
    fn is_running(&self, name: &str) -> bool {
        let wanted = name.to_lowercase();
        let wanted_base = basename_lower(&wanted);
        self.running_process_names()
            .iter()
            .any(|p| basename_lower(&p.to_lowercase()) == wanted_base)
    }
}

fn basename_lower(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.trim_end_matches(".app").to_lowercase()
}

/// Runs an item-embedded script (installcheck, preinstall, ...).
pub trait EmbeddedScriptRunner {
    fn run_script(
        &self,
        label: &str,
        content: &str,
        item: &PkgInfo,
    ) -> Result<i32, PlatformError>;
}

// ---------------------------------------------------------------------------
// Default implementations

/// A notifier that forwards UI messages to the log; the stand-in when no
/// status window is attached.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl UiNotifier for LogNotifier {
    fn message(&self, text: &str) {
        log::info!("{}", text);
    }

    fn detail(&self, text: &str) {
        log::debug!("{}", text);
    }

    fn percent(&self, value: i32) {
        log::trace!("progress: {}%", value);
    }
}

/// Receipt oracle for platforms without a package receipt database.
#[derive(Debug, Default)]
pub struct EmptyReceiptOracle;

impl ReceiptOracle for EmptyReceiptOracle {
    fn list_installed_packages(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn forget_package(&self, _pkgid: &str) -> Result<(), PlatformError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SystemProcessOracle;

impl ProcessOracle for SystemProcessOracle {
    #[cfg(target_os = "linux")]
    fn running_process_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir("/proc") {
            Ok(e) => e,
            Err(_) => return names,
        };
        for entry in entries.flatten() {
            let pid = entry.file_name();
            if !pid.to_string_lossy().chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
                let comm = comm.trim();
                if !comm.is_empty() {
                    names.push(comm.to_string());
                }
            }
        }
        names
    }

    #[cfg(not(target_os = "linux"))]
    fn running_process_names(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct SystemConsoleUser;

impl ConsoleUserResolver for SystemConsoleUser {
    fn console_user(&self) -> Option<String> {
        let name = whoami::username();
        (!name.is_empty()).then_some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProcesses(Vec<String>);

    impl ProcessOracle for FixedProcesses {
        fn running_process_names(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    #[test]
    fn test_blocking_app_name_matching() {
        let procs = FixedProcesses(vec!["Safari".into(), "firefox".into()]);
        assert!(procs.is_running("Safari"));
        assert!(procs.is_running("safari"));
        assert!(procs.is_running("Safari.app"));
        assert!(procs.is_running("/Applications/Firefox.app"));
        assert!(!procs.is_running("Chromium"));
    }
}
