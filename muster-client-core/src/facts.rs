use std::path::Path;

use chrono::{Local, TimeZone, Utc};

use crate::conditions::{FactValue, Facts};
use crate::defaults;
use crate::prefs::Preferences;

/// Builds the machine-fact dictionary consulted by conditional items and
/// `installable_condition` predicates. Gathered once per run and passed
/// explicitly.
pub fn gather(prefs: &Preferences) -> Facts {
    let mut facts = Facts::new();

    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
    facts.insert("hostname".into(), FactValue::Str(hostname.clone()));
    facts.insert(
        "short_hostname".into(),
        FactValue::Str(hostname.split('.').next().unwrap_or(&hostname).to_string()),
    );
    facts.insert("arch".into(), FactValue::Str(defaults::arch().to_string()));

    let os_vers = os_version();
    let mut vers_parts = os_vers.split('.').map(|p| p.parse::<i64>().unwrap_or(0));
    facts.insert(
        "os_vers_major".into(),
        FactValue::Int(vers_parts.next().unwrap_or(0)),
    );
    facts.insert(
        "os_vers_minor".into(),
        FactValue::Int(vers_parts.next().unwrap_or(0)),
    );
    facts.insert(
        "os_vers_patch".into(),
        FactValue::Int(vers_parts.next().unwrap_or(0)),
    );
    facts.insert("os_vers".into(), FactValue::Str(os_vers));
    facts.insert("os_build_number".into(), FactValue::Str(os_build_number()));
    facts.insert("product_name".into(), FactValue::Str(product_name()));
    facts.insert("machine_model".into(), FactValue::Str(machine_model()));
    facts.insert("serial_number".into(), FactValue::Str(serial_number()));
    facts.insert(
        "muster_version".into(),
        FactValue::Str(defaults::ENGINE_VERSION.to_string()),
    );
    facts.insert(
        "x86_64_capable".into(),
        FactValue::Bool(matches!(defaults::arch(), "x86_64" | "arm64")),
    );
    facts.insert(
        "machine_type".into(),
        FactValue::Str(machine_type().to_string()),
    );
    facts.insert("ipv4_address".into(), FactValue::List(Vec::new()));
    facts.insert("ipv6_address".into(), FactValue::List(Vec::new()));

    // The `date` fact is shifted so a predicate written against a
    // `...T00:00:00Z` literal actually compares against local wall-clock
    // time.
    let local_as_utc = Utc
        .from_local_datetime(&Local::now().naive_local())
        .single()
        .unwrap_or_else(Utc::now);
    facts.insert("date".into(), FactValue::Date(local_as_utc));

    merge_admin_conditions(prefs, &mut facts);
    facts
}

/// Merges the output of admin-provided condition scripts, persisted as a
/// dictionary at `<ManagedInstallDir>/ConditionalItems.plist`. Admin keys win
/// over built-in facts.
fn merge_admin_conditions(prefs: &Preferences, facts: &mut Facts) {
    let path = prefs.managed_install_dir().join("ConditionalItems.plist");
    if !path.exists() {
        return;
    }
    let dict: plist::Dictionary = match plist::from_file(&path) {
        Ok(d) => d,
        Err(e) => {
            log::warn!("Could not read ConditionalItems.plist: {}", e);
            return;
        }
    };
    for (key, value) in dict.iter() {
        match FactValue::from_plist(value) {
            Some(v) => {
                facts.insert(key.clone(), v);
            }
            None => log::warn!("Ignoring condition {} with unsupported type", key),
        }
    }
}

/// Facts rendered back to a plist dictionary for the run report.
pub fn to_plist(facts: &Facts) -> plist::Dictionary {
    let mut dict = plist::Dictionary::new();
    for (key, value) in facts {
        dict.insert(key.clone(), value.to_plist());
    }
    dict
}

#[cfg(target_os = "macos")]
fn os_version() -> String {
    command_stdout("/usr/bin/sw_vers", &["-productVersion"]).unwrap_or_else(|| "0.0".into())
}

#[cfg(not(target_os = "macos"))]
fn os_version() -> String {
    // VERSION_ID from os-release, e.g. `VERSION_ID="24.04"`.
    if let Ok(contents) = std::fs::read_to_string("/etc/os-release") {
        for line in contents.lines() {
            if let Some(raw) = line.strip_prefix("VERSION_ID=") {
                return raw.trim_matches('"').to_string();
            }
        }
    }
    "0.0".to_string()
}

#[cfg(target_os = "macos")]
fn os_build_number() -> String {
    command_stdout("/usr/bin/sw_vers", &["-buildVersion"]).unwrap_or_default()
}

#[cfg(not(target_os = "macos"))]
fn os_build_number() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn product_name() -> String {
    whoami::distro()
}

/// The DMI queries are comparatively slow, and the model is consulted more
/// than once per run.
fn machine_model() -> String {
    static MODEL: once_cell::sync::Lazy<String> = once_cell::sync::Lazy::new(|| {
        read_dmi("product_name").unwrap_or_else(|| "unknown".to_string())
    });
    MODEL.clone()
}

fn serial_number() -> String {
    read_dmi("product_serial").unwrap_or_else(|| "UNKNOWN".to_string())
}

fn read_dmi(key: &str) -> Option<String> {
    let path = Path::new("/sys/devices/virtual/dmi/id").join(key);
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn machine_type() -> &'static str {
    if Path::new("/sys/class/power_supply/BAT0").exists()
        || machine_model().to_lowercase().contains("book")
    {
        "laptop"
    } else {
        "desktop"
    }
}

#[cfg(target_os = "macos")]
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::predicate_is_true;

    #[test]
    fn test_gather_supplies_core_facts() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::in_dir(dir.path());
        let facts = gather(&prefs);
        for key in [
            "hostname",
            "arch",
            "os_vers",
            "os_vers_major",
            "machine_type",
            "muster_version",
            "date",
        ] {
            assert!(facts.contains_key(key), "missing fact {}", key);
        }
    }

    #[test]
    fn test_machine_type_predicate_is_decidable() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::in_dir(dir.path());
        let facts = gather(&prefs);
        let laptop = predicate_is_true(r#"machine_type == "laptop""#, &facts).unwrap();
        let desktop = predicate_is_true(r#"machine_type == "desktop""#, &facts).unwrap();
        assert!(laptop != desktop);
    }

    #[test]
    fn test_admin_conditions_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = Preferences::in_dir(dir.path());
        prefs
            .set(
                "ManagedInstallDir",
                plist::Value::String(dir.path().to_string_lossy().into_owned()),
            )
            .unwrap();

        let mut dict = plist::Dictionary::new();
        dict.insert("site".into(), plist::Value::String("hq".into()));
        plist::to_file_xml(dir.path().join("ConditionalItems.plist"), &plist::Value::Dictionary(dict))
            .unwrap();

        let facts = gather(&prefs);
        assert_eq!(facts.get("site"), Some(&FactValue::Str("hq".into())));
    }
}
