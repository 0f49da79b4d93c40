use std::path::PathBuf;

use plist::Value;

/// Engine version reported in facts and compared against
/// `minimum_muster_version`.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Preference domain; layer files are named `<DOMAIN>.plist`.
pub const DOMAIN: &str = "muster";

#[cfg(unix)]
pub fn managed_install_dir() -> PathBuf {
    PathBuf::from("/var/lib/muster")
}

#[cfg(windows)]
pub fn managed_install_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\muster")
}

#[cfg(unix)]
pub fn system_pref_dir() -> PathBuf {
    PathBuf::from("/etc/muster")
}

#[cfg(windows)]
pub fn system_pref_dir() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\muster\prefs")
}

pub fn user_pref_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("muster"))
}

/// Shared, world-writable drop location for the self-serve manifest.
#[cfg(unix)]
pub fn selfserve_origin_path() -> PathBuf {
    PathBuf::from("/var/tmp/muster/SelfServeManifest")
}

#[cfg(windows)]
pub fn selfserve_origin_path() -> PathBuf {
    PathBuf::from(r"C:\ProgramData\muster\user\SelfServeManifest")
}

/// Flag file whose presence requests cancellation at the next item boundary.
pub fn stop_request_path() -> PathBuf {
    std::env::temp_dir().join("muster.stop_requested")
}

#[inline(always)]
pub(crate) const fn arch() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        "x86_64"
    }
    #[cfg(target_arch = "aarch64")]
    {
        "arm64"
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::env::consts::ARCH
    }
}

/// Built-in default for an enumerated preference key. `None` for unknown
/// keys.
pub fn builtin(key: &str) -> Option<Value> {
    let value = match key {
        "ManagedInstallDir" => {
            Value::String(managed_install_dir().to_string_lossy().into_owned())
        }
        "SoftwareRepoURL" => Value::String("http://muster/repo".to_string()),
        "CatalogURL" | "ManifestURL" | "PackageURL" | "IconURL" | "ClientResourceURL" => {
            // Derived from SoftwareRepoURL when unset; no standalone default.
            return None;
        }
        "ClientIdentifier" => Value::String(String::new()),
        "LocalOnlyManifest" => return None,
        "LogFile" => Value::String(
            managed_install_dir()
                .join("Logs")
                .join("ManagedSoftwareUpdate.log")
                .to_string_lossy()
                .into_owned(),
        ),
        "LoggingLevel" => Value::Integer(1.into()),
        "LogToSyslog" => Value::Boolean(false),
        "PackageVerificationMode" => Value::String("hash".to_string()),
        "FollowHTTPRedirects" => Value::String("none".to_string()),
        "UseClientCertificate" => Value::Boolean(false),
        "ClientCertificatePath" | "ClientKeyPath" | "SoftwareRepoCACertificate" => return None,
        "AdditionalHttpHeaders" => Value::Dictionary(plist::Dictionary::new()),
        "SuppressAutoInstall" => Value::Boolean(false),
        "SuppressStopButtonOnInstall" => Value::Boolean(false),
        "InstallRequiresLogout" => Value::Boolean(false),
        "UnattendedAppleUpdates" => Value::Boolean(false),
        "ShowOptionalInstallsForHigherOSVersions" => Value::Boolean(false),
        "DaysBetweenNotifications" => Value::Integer(1.into()),
        _ => return None,
    };
    Some(value)
}

/// All enumerated preference keys, for diagnostics output.
pub const KNOWN_KEYS: &[&str] = &[
    "ManagedInstallDir",
    "SoftwareRepoURL",
    "CatalogURL",
    "ManifestURL",
    "PackageURL",
    "IconURL",
    "ClientResourceURL",
    "ClientIdentifier",
    "LocalOnlyManifest",
    "LogFile",
    "LoggingLevel",
    "LogToSyslog",
    "PackageVerificationMode",
    "FollowHTTPRedirects",
    "UseClientCertificate",
    "ClientCertificatePath",
    "ClientKeyPath",
    "SoftwareRepoCACertificate",
    "AdditionalHttpHeaders",
    "SuppressAutoInstall",
    "SuppressStopButtonOnInstall",
    "InstallRequiresLogout",
    "UnattendedAppleUpdates",
    "ShowOptionalInstallsForHigherOSVersions",
    "DaysBetweenNotifications",
];
