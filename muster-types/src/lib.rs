#![deny(rust_2018_idioms)]

pub mod installinfo;
pub mod manifest;
pub mod package;
pub mod version;

pub use installinfo::{InstallInfo, InstallItem, InstallResult, OptionalItem, RemovalItem};
pub use manifest::{ConditionalItem, Manifest, Section};
pub use package::{
    Catalog, CopyItem, InstallerType, InstallsEntry, PkgInfo, PostAction, Receipt, RestartAction,
    UninstallMethod, UnusedSoftwareRemovalInfo,
};
pub use version::{split_name_and_version, trim_version, LooseVersion};
