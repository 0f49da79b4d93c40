use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use thiserror::Error;

use crate::defaults;

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("Could not read preference layer at {}", .1.display())]
    Read(#[source] std::io::Error, PathBuf),

    #[error("Preference layer at {} is not a valid property list", .1.display())]
    Parse(#[source] plist::Error, PathBuf),

    #[error("Could not write preference layer at {}", .1.display())]
    Write(#[source] std::io::Error, PathBuf),

    #[error("Could not serialize preference layer at {}", .1.display())]
    Serialize(#[source] plist::Error, PathBuf),
}

/// Where an effective preference value came from, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefSource {
    Managed,
    UserHost,
    User,
    SystemWide,
    GlobalDefaults,
    Builtin,
}

impl fmt::Display for PrefSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrefSource::Managed => "managed",
            PrefSource::UserHost => "user-host",
            PrefSource::User => "user",
            PrefSource::SystemWide => "system",
            PrefSource::GlobalDefaults => "global-defaults",
            PrefSource::Builtin => "builtin",
        };
        f.write_str(s)
    }
}

/// Locations of the preference layer files, in precedence order.
#[derive(Debug, Clone)]
pub struct PrefPaths {
    pub managed: PathBuf,
    pub user_host: Option<PathBuf>,
    pub user: Option<PathBuf>,
    pub system: PathBuf,
    pub global_defaults: PathBuf,
}

impl PrefPaths {
    pub fn standard() -> PrefPaths {
        let system_dir = defaults::system_pref_dir();
        let plist_name = format!("{}.plist", defaults::DOMAIN);
        let user_dir = defaults::user_pref_dir();
        let hostname = whoami::fallible::hostname().unwrap_or_default();
        PrefPaths {
            managed: system_dir.join("managed").join(&plist_name),
            user_host: user_dir
                .as_ref()
                .map(|d| d.join(format!("{}.{}.plist", defaults::DOMAIN, hostname))),
            user: user_dir.as_ref().map(|d| d.join(&plist_name)),
            system: system_dir.join(&plist_name),
            global_defaults: system_dir.join("defaults").join(plist_name),
        }
    }
}

fn load_layer(path: &Path) -> Result<Dictionary, PrefsError> {
    if !path.exists() {
        return Ok(Dictionary::new());
    }
    let value: Value = plist::from_file(path)
        .map_err(|e| PrefsError::Parse(e, path.to_path_buf()))?;
    match value {
        Value::Dictionary(d) => Ok(d),
        _ => Ok(Dictionary::new()),
    }
}

/// Process-wide keyed map of typed configuration values with layered
/// precedence. Constructed once at startup and passed explicitly.
#[derive(Debug, Clone)]
pub struct Preferences {
    layers: Vec<(PrefSource, Dictionary)>,
    system_path: PathBuf,
}

impl Preferences {
    pub fn open(paths: &PrefPaths) -> Preferences {
        let mut layers = Vec::new();
        let mut push = |source: PrefSource, path: Option<&PathBuf>| {
            let dict = match path {
                Some(p) => match load_layer(p) {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("Ignoring unreadable preference layer: {}", e);
                        Dictionary::new()
                    }
                },
                None => Dictionary::new(),
            };
            layers.push((source, dict));
        };
        push(PrefSource::Managed, Some(&paths.managed));
        push(PrefSource::UserHost, paths.user_host.as_ref());
        push(PrefSource::User, paths.user.as_ref());
        push(PrefSource::SystemWide, Some(&paths.system));
        push(PrefSource::GlobalDefaults, Some(&paths.global_defaults));

        Preferences {
            layers,
            system_path: paths.system.clone(),
        }
    }

    /// An empty store backed by a single writable layer; used by tests.
    pub fn in_dir(dir: &Path) -> Preferences {
        let system = dir.join(format!("{}.plist", defaults::DOMAIN));
        let mut layers = vec![(PrefSource::SystemWide, Dictionary::new())];
        if let Ok(d) = load_layer(&system) {
            layers[0].1 = d;
        }
        Preferences {
            layers,
            system_path: system,
        }
    }

    /// First defined layer wins; falls back to the enumerated built-in
    /// default.
    pub fn get(&self, key: &str) -> Option<Value> {
        for (_, dict) in &self.layers {
            if let Some(v) = dict.get(key) {
                return Some(v.clone());
            }
        }
        defaults::builtin(key)
    }

    pub fn effective_source(&self, key: &str) -> Option<PrefSource> {
        for (source, dict) in &self.layers {
            if dict.get(key).is_some() {
                return Some(*source);
            }
        }
        defaults::builtin(key).map(|_| PrefSource::Builtin)
    }

    /// Writes into the system-wide override layer and persists it.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), PrefsError> {
        for (source, dict) in &mut self.layers {
            if *source == PrefSource::SystemWide {
                dict.insert(key.to_string(), value);
                break;
            }
        }
        self.save_system_layer()
    }

    fn save_system_layer(&self) -> Result<(), PrefsError> {
        let dict = self
            .layers
            .iter()
            .find(|(s, _)| *s == PrefSource::SystemWide)
            .map(|(_, d)| d.clone())
            .unwrap_or_default();
        if let Some(parent) = self.system_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PrefsError::Write(e, self.system_path.clone()))?;
        }
        plist::to_file_xml(&self.system_path, &Value::Dictionary(dict))
            .map_err(|e| PrefsError::Serialize(e, self.system_path.clone()))
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Integer(i)) => i.as_signed(),
            Some(Value::Real(r)) => Some(r as i64),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn boolean(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Boolean(b)) => b,
            Some(Value::Integer(i)) => i.as_signed() == Some(1),
            Some(Value::String(s)) => s == "true" || s == "1" || s == "YES",
            _ => false,
        }
    }

    pub fn dictionary(&self, key: &str) -> Option<Dictionary> {
        match self.get(key) {
            Some(Value::Dictionary(d)) => Some(d),
            _ => None,
        }
    }

    /// Absolute path of the managed-installs state directory.
    pub fn managed_install_dir(&self) -> PathBuf {
        self.string("ManagedInstallDir")
            .map(PathBuf::from)
            .unwrap_or_else(defaults::managed_install_dir)
    }

    /// Resolves one of the five repo path roots, deriving from
    /// `SoftwareRepoURL` when the specific override is unset.
    pub fn repo_url(&self, specific_key: &str, suffix: &str) -> Option<String> {
        if let Some(v) = self.string(specific_key) {
            return Some(v);
        }
        self.string("SoftwareRepoURL")
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults_apply() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::in_dir(dir.path());
        assert_eq!(prefs.integer("LoggingLevel"), Some(1));
        assert_eq!(prefs.string("PackageVerificationMode").as_deref(), Some("hash"));
        assert!(!prefs.boolean("SuppressAutoInstall"));
        assert_eq!(prefs.effective_source("LoggingLevel"), Some(PrefSource::Builtin));
    }

    #[test]
    fn test_set_persists_and_wins_over_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = Preferences::in_dir(dir.path());
        prefs
            .set("LoggingLevel", Value::Integer(3.into()))
            .unwrap();
        assert_eq!(prefs.integer("LoggingLevel"), Some(3));
        assert_eq!(
            prefs.effective_source("LoggingLevel"),
            Some(PrefSource::SystemWide)
        );

        // Reload from disk.
        let prefs2 = Preferences::in_dir(dir.path());
        assert_eq!(prefs2.integer("LoggingLevel"), Some(3));
    }

    #[test]
    fn test_layer_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let managed = dir.path().join("managed.plist");
        let system = dir.path().join("system.plist");

        let mut m = Dictionary::new();
        m.insert("ClientIdentifier".into(), Value::String("forced".into()));
        plist::to_file_xml(&managed, &Value::Dictionary(m)).unwrap();

        let mut s = Dictionary::new();
        s.insert("ClientIdentifier".into(), Value::String("local".into()));
        plist::to_file_xml(&system, &Value::Dictionary(s)).unwrap();

        let paths = PrefPaths {
            managed,
            user_host: None,
            user: None,
            system,
            global_defaults: dir.path().join("missing.plist"),
        };
        let prefs = Preferences::open(&paths);
        assert_eq!(prefs.string("ClientIdentifier").as_deref(), Some("forced"));
        assert_eq!(prefs.effective_source("ClientIdentifier"), Some(PrefSource::Managed));
    }

    #[test]
    fn test_repo_url_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let mut prefs = Preferences::in_dir(dir.path());
        prefs
            .set("SoftwareRepoURL", Value::String("https://repo.example.org/base/".into()))
            .unwrap();
        assert_eq!(
            prefs.repo_url("CatalogURL", "catalogs").as_deref(),
            Some("https://repo.example.org/base/catalogs")
        );
        prefs
            .set("CatalogURL", Value::String("https://cdn.example.org/catalogs".into()))
            .unwrap();
        assert_eq!(
            prefs.repo_url("CatalogURL", "catalogs").as_deref(),
            Some("https://cdn.example.org/catalogs")
        );
    }
}
