#![deny(unused_must_use)]
#![deny(rust_2018_idioms)]

pub extern crate muster_types as types;

pub mod cache;
pub mod catalogs;
pub mod conditions;
pub mod context;
pub mod defaults;
pub mod executor;
pub mod facts;
pub mod fetch;
pub mod icons;
pub mod logging;
pub mod manifests;
pub mod planner;
pub mod platform;
pub mod precache;
pub mod prefs;
pub mod report;
pub mod scripts;
pub mod selfservice;
pub mod status;
pub mod stop;
pub mod usage;

pub use self::cache::ManagedDirs;
pub use self::catalogs::{CatalogDb, CatalogStore};
pub use self::conditions::{predicate_is_true, FactValue, Facts};
pub use self::context::Context;
pub use self::executor::Executor;
pub use self::fetch::{Fetched, Fetcher, FetchError, FetchOptions, FetchStatus};
pub use self::manifests::ManifestStore;
pub use self::planner::{PlanError, PlanOutcome, Planner};
pub use self::prefs::{PrefPaths, Preferences};
pub use self::report::Report;
pub use self::status::{InstalledState, StatusOracle};
pub use self::usage::UsageLedger;
