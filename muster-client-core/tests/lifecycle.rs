//! Full-cycle exercises: plan from local repo state, apply the plan, and
//! plan again, checking ordering, skip propagation, and residual rewrites.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use muster_client::cache::ManagedDirs;
use muster_client::conditions::{FactValue, Facts};
use muster_client::platform::{EmbeddedScriptRunner, InstallerRunner, PlatformError};
use muster_client::{Executor, Planner, Preferences, Report};
use muster_types::{InstallInfo, Manifest, PkgInfo, PostAction, RestartAction};

struct NoScripts;

impl EmbeddedScriptRunner for NoScripts {
    fn run_script(
        &self,
        _label: &str,
        _content: &str,
        _item: &PkgInfo,
    ) -> Result<i32, PlatformError> {
        Ok(0)
    }
}

struct FakeInstaller {
    fail_artifacts: Vec<String>,
    invoked: RefCell<Vec<String>>,
}

impl FakeInstaller {
    fn succeeding() -> FakeInstaller {
        FakeInstaller {
            fail_artifacts: Vec::new(),
            invoked: RefCell::new(Vec::new()),
        }
    }

    fn failing(artifact: &str) -> FakeInstaller {
        FakeInstaller {
            fail_artifacts: vec![artifact.to_string()],
            invoked: RefCell::new(Vec::new()),
        }
    }
}

impl InstallerRunner for FakeInstaller {
    fn run(
        &self,
        artifact: &Path,
        _choices_xml: Option<&Path>,
        _env: &BTreeMap<String, String>,
        _on_output: &mut dyn FnMut(&str),
    ) -> Result<i32, PlatformError> {
        let name = artifact.file_name().unwrap().to_string_lossy().into_owned();
        self.invoked.borrow_mut().push(name.clone());
        Ok(if self.fail_artifacts.contains(&name) { 5 } else { 0 })
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    dirs: ManagedDirs,
    prefs: Preferences,
    facts: Facts,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = ManagedDirs::new(tmp.path().join("managed"));
    dirs.ensure().unwrap();
    let prefs = Preferences::in_dir(tmp.path());

    let mut facts = Facts::new();
    facts.insert("os_vers".into(), FactValue::Str("14.4".into()));
    facts.insert("arch".into(), FactValue::Str("arm64".into()));
    facts.insert("x86_64_capable".into(), FactValue::Bool(true));
    facts.insert("muster_version".into(), FactValue::Str("0.9.0".into()));

    Fixture {
        _tmp: tmp,
        dirs,
        prefs,
        facts,
    }
}

fn pkg_item(dirs: &ManagedDirs, name: &str, version: &str) -> PkgInfo {
    let mut item = PkgInfo::default();
    item.name = name.to_string();
    item.version = version.to_string();
    let location = format!("apps/{}-{}.pkg", name, version);
    let dest = dirs.installer_path(&location);
    std::fs::write(&dest, format!("payload for {}", name)).unwrap();
    item.installer_item_hash = Some(muster_client::fetch::sha256_of_file(&dest).unwrap());
    item.installer_item_location = Some(location);
    item.installs = vec![muster_types::InstallsEntry::Application {
        bundle_id: Some(format!("com.example.{}", name.to_lowercase())),
        version: Some(version.to_string()),
        path: None,
    }];
    item
}

fn seed_repo(fx: &Fixture, items: &[PkgInfo], manifest: &Manifest) {
    plist::to_file_xml(fx.dirs.catalogs_dir().join("production"), &items.to_vec()).unwrap();
    plist::to_file_xml(fx.dirs.manifests_dir().join("site_default"), manifest).unwrap();
}

fn plan(fx: &Fixture) -> (i32, InstallInfo) {
    let mut report = Report::start();
    let mut planner = Planner::new(&fx.prefs, &fx.dirs, &fx.facts);
    planner.fs_root = fx.dirs.root().join("fsroot");
    let outcome = planner.plan(&mut report, None, None).unwrap();
    (outcome.exit_code, outcome.installinfo)
}

fn execute(fx: &Fixture, installer: &FakeInstaller) -> PostAction {
    let scripts = NoScripts;
    let mut executor = Executor::new(&fx.prefs, &fx.dirs, &scripts);
    executor.installer = Some(installer);
    let mut report = Report::start();
    executor.run(&mut report, false).unwrap()
}

fn residual(fx: &Fixture) -> InstallInfo {
    plist::from_file(fx.dirs.installinfo_path()).unwrap()
}

#[test]
fn test_dependency_chain_plans_installs_and_settles() {
    let fx = fixture();
    let mut app_a = pkg_item(&fx.dirs, "AppA", "1.0");
    app_a.requires = vec!["AppB".into()];
    app_a.restart_action = RestartAction::RecommendRestart;
    let app_b = pkg_item(&fx.dirs, "AppB", "2.0");

    let mut manifest = Manifest::default();
    manifest.catalogs = vec!["production".into()];
    manifest.managed_installs = vec!["AppA".into()];
    seed_repo(&fx, &[app_a, app_b], &manifest);

    // Planning: dependency order, exit code 1.
    let (code, info) = plan(&fx);
    assert_eq!(code, 1);
    let names: Vec<&str> = info
        .managed_installs
        .iter()
        .map(|i| i.info.name.as_str())
        .collect();
    assert_eq!(names, vec!["AppB", "AppA"]);

    // Execution: both install, restart action aggregates.
    let installer = FakeInstaller::succeeding();
    let post = execute(&fx, &installer);
    assert_eq!(post, PostAction::Restart);
    assert_eq!(
        installer.invoked.borrow().as_slice(),
        ["AppB-2.0.pkg", "AppA-1.0.pkg"]
    );
    assert!(!residual(&fx).needs_action());
}

#[test]
fn test_failed_prerequisite_skips_dependent_until_next_plan() {
    let fx = fixture();
    let mut app_a = pkg_item(&fx.dirs, "AppA", "1.0");
    app_a.requires = vec!["AppB".into()];
    let app_b = pkg_item(&fx.dirs, "AppB", "2.0");

    let mut manifest = Manifest::default();
    manifest.catalogs = vec!["production".into()];
    manifest.managed_installs = vec!["AppA".into()];
    seed_repo(&fx, &[app_a, app_b], &manifest);

    let (_, info) = plan(&fx);
    assert_eq!(info.managed_installs.len(), 2);

    // AppB's installer fails; AppA must be skipped, both stay residual with
    // notes.
    let installer = FakeInstaller::failing("AppB-2.0.pkg");
    let post = execute(&fx, &installer);
    assert_eq!(post, PostAction::None);
    assert_eq!(installer.invoked.borrow().as_slice(), ["AppB-2.0.pkg"]);

    let left = residual(&fx);
    assert_eq!(left.managed_installs.len(), 2);
    assert!(left.managed_installs.iter().all(|i| i.note.is_some()));

    // A fresh plan clears the notes and the retry succeeds end to end.
    let (code, _) = plan(&fx);
    assert_eq!(code, 1);
    let installer = FakeInstaller::succeeding();
    execute(&fx, &installer);
    assert!(!residual(&fx).needs_action());
}

#[test]
fn test_settled_machine_plans_nothing() {
    let fx = fixture();
    // The app probe is satisfied via the fake filesystem root.
    let fs_root = fx.dirs.root().join("fsroot");
    std::fs::create_dir_all(fs_root.join("opt")).unwrap();
    std::fs::write(fs_root.join("opt/appa"), b"installed").unwrap();

    let mut app_a = PkgInfo::default();
    app_a.name = "AppA".into();
    app_a.version = "1.0".into();
    app_a.installs = vec![muster_types::InstallsEntry::File {
        path: "/opt/appa".into(),
        md5checksum: None,
    }];

    let mut manifest = Manifest::default();
    manifest.catalogs = vec!["production".into()];
    manifest.managed_installs = vec!["AppA".into()];
    seed_repo(&fx, &[app_a], &manifest);

    let (code, info) = plan(&fx);
    assert_eq!(code, 0);
    assert!(info.managed_installs.is_empty());
    assert!(info.processed_installs.contains(&"AppA".to_string()));
}
