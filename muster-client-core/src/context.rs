use thiserror::Error;

use crate::cache::{CacheError, ManagedDirs};
use crate::conditions::Facts;
use crate::facts;
use crate::prefs::Preferences;
use crate::report::Report;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Could not create the managed-installs directory")]
    ManagedDir(#[from] CacheError),
}

/// Per-run state bundle threaded through the engine instead of process
/// globals: preferences, directory layout, machine facts, and the
/// accumulating report.
pub struct Context {
    pub prefs: Preferences,
    pub dirs: ManagedDirs,
    pub facts: Facts,
    pub report: Report,
}

impl Context {
    pub fn initialize(prefs: Preferences) -> Result<Context, ContextError> {
        let dirs = ManagedDirs::new(prefs.managed_install_dir());
        dirs.ensure()?;

        let facts = facts::gather(&prefs);
        let mut report = Report::start();
        report.machine_info = facts::to_plist(&facts);
        report.conditions = facts::to_plist(&facts);

        Ok(Context {
            prefs,
            dirs,
            facts,
            report,
        })
    }

    /// Persists the report; the last step of any run.
    pub fn finish(&mut self) {
        let dirs = self.dirs.clone();
        self.report.save(&dirs);
    }
}
