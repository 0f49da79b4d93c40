use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

use muster_types::PkgInfo;

use crate::platform::ProcessOracle;

const APPLICATION_USAGE_TABLE_CREATE: &str = "CREATE TABLE application_usage (
    event TEXT,
    bundle_id TEXT,
    app_version TEXT,
    app_path TEXT,
    last_time INTEGER DEFAULT 0,
    number_times INTEGER DEFAULT 0,
    PRIMARY KEY (event, bundle_id)
)";

const INSTALL_REQUEST_TABLE_CREATE: &str = "CREATE TABLE install_requests (
    event TEXT,
    item_name TEXT,
    item_version TEXT,
    last_time INTEGER DEFAULT 0,
    number_times INTEGER DEFAULT 0,
    PRIMARY KEY (event, item_name)
)";

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Database error")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error at {}", .1.display())]
    Io(#[source] std::io::Error, PathBuf),
}

/// Answer to a "days since" query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageQuery {
    Days(i64),
    NotFound,
    Unavailable,
}

/// Durable single-writer record of application launch/quit/activate events
/// and self-service install requests, kept in a single-file database under
/// the managed-installs directory.
pub struct UsageLedger {
    conn: Connection,
}

impl UsageLedger {
    /// Opens (creating tables as needed) the ledger. A database with a
    /// broken schema is rebuilt, keeping whatever rows are still readable.
    pub fn open(path: &Path) -> Result<UsageLedger, UsageError> {
        if path.exists() && !Self::schema_ok(path) {
            let recovered = Self::rebuild(path)?;
            log::warn!(
                "Usage database was damaged; rebuilt with {} recovered rows",
                recovered
            );
        }
        let conn = Connection::open(path)?;
        Self::ensure_tables(&conn)?;
        Ok(UsageLedger { conn })
    }

    pub fn open_in_memory() -> Result<UsageLedger, UsageError> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_tables(&conn)?;
        Ok(UsageLedger { conn })
    }

    fn schema_ok(path: &Path) -> bool {
        let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let probe = |sql: &str| conn.prepare(sql).and_then(|mut s| s.query([]).map(|_| ()));
        probe("SELECT event, bundle_id, app_version, app_path, last_time, number_times FROM application_usage LIMIT 1")
            .and_then(|_| probe("SELECT event, item_name, item_version, last_time, number_times FROM install_requests LIMIT 1"))
            .is_ok()
    }

    fn ensure_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
        let have_usage: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='application_usage'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;
        if !have_usage {
            conn.execute(APPLICATION_USAGE_TABLE_CREATE, [])?;
        }
        let have_requests: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='install_requests'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;
        if !have_requests {
            conn.execute(INSTALL_REQUEST_TABLE_CREATE, [])?;
        }
        Ok(())
    }

    /// Copies readable rows into a fresh database file and swaps it into
    /// place. Returns the number of recovered rows.
    fn rebuild(path: &Path) -> Result<usize, UsageError> {
        let tmp_path = path.with_extension("rebuild");
        let _ = fs::remove_file(&tmp_path);
        let new_conn = Connection::open(&tmp_path)?;
        Self::ensure_tables(&new_conn)?;

        let mut recovered = 0usize;
        if let Ok(old) = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            recovered += copy_rows(
                &old,
                &new_conn,
                "SELECT event, bundle_id, app_version, app_path, last_time, number_times FROM application_usage",
                "INSERT OR REPLACE INTO application_usage VALUES (?, ?, ?, ?, ?, ?)",
            );
            recovered += copy_rows(
                &old,
                &new_conn,
                "SELECT event, item_name, item_version, last_time, number_times FROM install_requests",
                "INSERT OR REPLACE INTO install_requests VALUES (?, ?, ?, ?, ?)",
            );
        }
        drop(new_conn);
        fs::rename(&tmp_path, path).map_err(|e| UsageError::Io(e, path.to_path_buf()))?;
        Ok(recovered)
    }

    /// Upsert-with-increment for an application event
    /// (`launch`/`activate`/`quit`), keyed by `(event, bundle_id)`.
    pub fn log_application_usage(
        &self,
        event: &str,
        bundle_id: &str,
        app_version: &str,
        app_path: &str,
    ) -> Result<(), UsageError> {
        self.log_application_usage_at(event, bundle_id, app_version, app_path, now())
    }

    pub(crate) fn log_application_usage_at(
        &self,
        event: &str,
        bundle_id: &str,
        app_version: &str,
        app_path: &str,
        at: i64,
    ) -> Result<(), UsageError> {
        let updated = self.conn.execute(
            "UPDATE application_usage SET app_version=?, app_path=?, last_time=?, \
             number_times=number_times+1 WHERE event=? AND bundle_id=?",
            params![app_version, app_path, at, event, bundle_id],
        )?;
        if updated == 0 {
            self.conn.execute(
                "INSERT INTO application_usage VALUES (?, ?, ?, ?, ?, ?)",
                params![event, bundle_id, app_version, app_path, at, 1],
            )?;
        }
        Ok(())
    }

    /// Upsert-with-increment for a self-service request
    /// (`install`/`remove`), keyed by `(event, item_name)`.
    pub fn log_install_request(
        &self,
        event: &str,
        item_name: &str,
        item_version: &str,
    ) -> Result<(), UsageError> {
        self.log_install_request_at(event, item_name, item_version, now())
    }

    pub(crate) fn log_install_request_at(
        &self,
        event: &str,
        item_name: &str,
        item_version: &str,
        at: i64,
    ) -> Result<(), UsageError> {
        let updated = self.conn.execute(
            "UPDATE install_requests SET item_version=?, last_time=?, \
             number_times=number_times+1 WHERE event=? AND item_name=?",
            params![item_version, at, event, item_name],
        )?;
        if updated == 0 {
            self.conn.execute(
                "INSERT INTO install_requests VALUES (?, ?, ?, ?, ?)",
                params![event, item_name, item_version, at, 1],
            )?;
        }
        Ok(())
    }

    fn days_since(&self, sql: &str, a: &str, b: &str) -> UsageQuery {
        let result: Result<Option<i64>, rusqlite::Error> = self
            .conn
            .query_row(sql, params![a, b], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            });
        match result {
            Ok(Some(last_time)) => UsageQuery::Days(days_between(last_time, now())),
            Ok(None) => UsageQuery::NotFound,
            Err(e) => {
                log::warn!("Usage database query failed: {}", e);
                UsageQuery::Unavailable
            }
        }
    }

    pub fn days_since_last_usage_event(&self, event: &str, bundle_id: &str) -> UsageQuery {
        self.days_since(
            "SELECT last_time FROM application_usage WHERE event=? AND bundle_id=?",
            event,
            bundle_id,
        )
    }

    pub fn days_since_last_install_event(&self, event: &str, item_name: &str) -> UsageQuery {
        self.days_since(
            "SELECT last_time FROM install_requests WHERE event=? AND item_name=?",
            event,
            item_name,
        )
    }

    /// Days covered by the usage table: distance from the oldest recorded
    /// `last_time` to now.
    pub fn days_of_data(&self) -> Option<i64> {
        let result: Result<Option<i64>, rusqlite::Error> = self
            .conn
            .query_row(
                "SELECT min(last_time) FROM application_usage",
                [],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            });
        match result {
            Ok(Some(oldest)) if oldest > 0 => Some(days_between(oldest, now())),
            _ => None,
        }
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn days_between(earlier: i64, later: i64) -> i64 {
    (later - earlier) / 86_400
}

fn copy_rows(old: &Connection, new: &Connection, select: &str, insert: &str) -> usize {
    let mut copied = 0usize;
    let mut stmt = match old.prepare(select) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    let column_count = stmt.column_count();
    let mut rows = match stmt.query([]) {
        Ok(r) => r,
        Err(_) => return 0,
    };
    while let Ok(Some(row)) = rows.next() {
        let values: Vec<rusqlite::types::Value> = (0..column_count)
            .map(|i| row.get::<_, rusqlite::types::Value>(i).unwrap_or(rusqlite::types::Value::Null))
            .collect();
        if new
            .execute(insert, rusqlite::params_from_iter(values))
            .is_ok()
        {
            copied += 1;
        }
    }
    copied
}

/// The unused-software policy: true when an optional install has aged out of
/// use and may be removed.
pub fn should_be_removed(
    item: &PkgInfo,
    ledger: &UsageLedger,
    processes: &dyn ProcessOracle,
) -> bool {
    let info = match &item.unused_software_removal_info {
        Some(i) => i,
        None => return false,
    };
    let days = i64::from(info.removal_days);
    if days < 1 {
        return false;
    }

    // Not enough history to make the call.
    match ledger.days_of_data() {
        Some(d) if d >= days => {}
        _ => return false,
    }

    // A recent install request keeps the item.
    match ledger.days_since_last_install_event("install", &item.name) {
        UsageQuery::Days(d) if d <= days => return false,
        UsageQuery::Unavailable => return false,
        _ => {}
    }

    let bundle_ids: Vec<String> = if info.bundle_ids.is_empty() {
        item.bundle_ids_from_installs()
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        info.bundle_ids.clone()
    };
    if bundle_ids.is_empty() {
        return false;
    }

    for bundle_id in &bundle_ids {
        if processes.is_running(bundle_id) {
            return false;
        }
        match ledger.days_since_last_usage_event("activate", bundle_id) {
            UsageQuery::Days(d) if d <= days => return false,
            UsageQuery::Unavailable => return false,
            _ => {}
        }
    }

    log::info!("{} is unused and eligible for removal", item.name);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_types::UnusedSoftwareRemovalInfo;

    struct NoProcesses;

    impl ProcessOracle for NoProcesses {
        fn running_process_names(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn days_ago(n: i64) -> i64 {
        now() - n * 86_400
    }

    #[test]
    fn test_upsert_increments() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger
            .log_application_usage("activate", "com.x.a", "1.0", "/Applications/A.app")
            .unwrap();
        ledger
            .log_application_usage("activate", "com.x.a", "1.1", "/Applications/A.app")
            .unwrap();

        let count: i64 = ledger
            .conn
            .query_row(
                "SELECT number_times FROM application_usage WHERE event='activate' AND bundle_id='com.x.a'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let version: String = ledger
            .conn
            .query_row(
                "SELECT app_version FROM application_usage WHERE event='activate' AND bundle_id='com.x.a'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, "1.1");
    }

    #[test]
    fn test_days_since_queries() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger
            .log_application_usage_at("activate", "com.x.a", "1.0", "/a", days_ago(45))
            .unwrap();
        ledger
            .log_install_request_at("install", "EditorX", "1.0", days_ago(60))
            .unwrap();

        assert_eq!(
            ledger.days_since_last_usage_event("activate", "com.x.a"),
            UsageQuery::Days(45)
        );
        assert_eq!(
            ledger.days_since_last_usage_event("activate", "com.x.missing"),
            UsageQuery::NotFound
        );
        assert_eq!(
            ledger.days_since_last_install_event("install", "EditorX"),
            UsageQuery::Days(60)
        );
        assert_eq!(ledger.days_of_data(), Some(45));
    }

    #[test]
    fn test_rebuild_recovers_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("application_usage.sqlite");

        // A database missing the install_requests table entirely.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(APPLICATION_USAGE_TABLE_CREATE, []).unwrap();
            conn.execute(
                "INSERT INTO application_usage VALUES ('activate', 'com.x.a', '1.0', '/a', 123, 4)",
                [],
            )
            .unwrap();
        }

        let ledger = UsageLedger::open(&path).unwrap();
        let count: i64 = ledger
            .conn
            .query_row("SELECT number_times FROM application_usage WHERE bundle_id='com.x.a'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 4);
        // And the missing table now exists.
        ledger.log_install_request("install", "AppA", "1.0").unwrap();
    }

    fn unused_item(days: u32) -> PkgInfo {
        let mut item = PkgInfo::default();
        item.name = "EditorX".into();
        item.version = "1.0".into();
        item.unused_software_removal_info = Some(UnusedSoftwareRemovalInfo {
            removal_days: days,
            bundle_ids: vec!["com.example.editorx".into()],
        });
        item
    }

    #[test]
    fn test_unused_software_policy_removes_aged_item() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        // 60 days of data, last activated 45 days ago, installed 60 days
        // ago.
        ledger
            .log_application_usage_at("activate", "com.other.app", "1.0", "/o", days_ago(60))
            .unwrap();
        ledger
            .log_application_usage_at("activate", "com.example.editorx", "1.0", "/e", days_ago(45))
            .unwrap();
        ledger
            .log_install_request_at("install", "EditorX", "1.0", days_ago(60))
            .unwrap();

        assert!(should_be_removed(&unused_item(30), &ledger, &NoProcesses));
    }

    #[test]
    fn test_unused_software_policy_keeps_recent_use() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger
            .log_application_usage_at("activate", "com.other.app", "1.0", "/o", days_ago(60))
            .unwrap();
        ledger
            .log_application_usage_at("activate", "com.example.editorx", "1.0", "/e", days_ago(5))
            .unwrap();

        assert!(!should_be_removed(&unused_item(30), &ledger, &NoProcesses));
    }

    #[test]
    fn test_unused_software_policy_needs_enough_data() {
        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger
            .log_application_usage_at("activate", "com.other.app", "1.0", "/o", days_ago(10))
            .unwrap();

        // Only 10 days of history for a 30-day policy.
        assert!(!should_be_removed(&unused_item(30), &ledger, &NoProcesses));
    }

    #[test]
    fn test_unused_software_policy_keeps_running_apps() {
        struct EditorRunning;
        impl ProcessOracle for EditorRunning {
            fn running_process_names(&self) -> Vec<String> {
                vec!["com.example.editorx".into()]
            }
        }

        let ledger = UsageLedger::open_in_memory().unwrap();
        ledger
            .log_application_usage_at("activate", "com.other.app", "1.0", "/o", days_ago(60))
            .unwrap();

        assert!(!should_be_removed(&unused_item(30), &ledger, &EditorRunning));
    }
}
