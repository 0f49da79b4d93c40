use serde::{Deserialize, Serialize};

/// The item-list sections a manifest (or conditional block) may carry, in the
/// fixed order the planner walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    ManagedInstalls,
    ManagedUninstalls,
    ManagedUpdates,
    OptionalInstalls,
    FeaturedItems,
    DefaultInstalls,
}

impl Section {
    pub fn key(&self) -> &'static str {
        match self {
            Section::ManagedInstalls => "managed_installs",
            Section::ManagedUninstalls => "managed_uninstalls",
            Section::ManagedUpdates => "managed_updates",
            Section::OptionalInstalls => "optional_installs",
            Section::FeaturedItems => "featured_items",
            Section::DefaultInstalls => "default_installs",
        }
    }
}

/// A manifest document: item lists, included manifests, conditional blocks,
/// and the catalog set in effect for this scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catalogs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_manifests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_installs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_uninstalls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_updates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_installs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub featured_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_installs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_items: Vec<ConditionalItem>,

    #[serde(flatten)]
    pub extra: plist::Dictionary,
}

impl Manifest {
    pub fn section(&self, section: Section) -> &[String] {
        match section {
            Section::ManagedInstalls => &self.managed_installs,
            Section::ManagedUninstalls => &self.managed_uninstalls,
            Section::ManagedUpdates => &self.managed_updates,
            Section::OptionalInstalls => &self.optional_installs,
            Section::FeaturedItems => &self.featured_items,
            Section::DefaultInstalls => &self.default_installs,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut Vec<String> {
        match section {
            Section::ManagedInstalls => &mut self.managed_installs,
            Section::ManagedUninstalls => &mut self.managed_uninstalls,
            Section::ManagedUpdates => &mut self.managed_updates,
            Section::OptionalInstalls => &mut self.optional_installs,
            Section::FeaturedItems => &mut self.featured_items,
            Section::DefaultInstalls => &mut self.default_installs,
        }
    }
}

/// A predicate-gated inline manifest. When the condition evaluates true, the
/// nested sections are processed as if they were part of the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalItem {
    pub condition: String,
    #[serde(flatten)]
    pub manifest: Manifest,
}
