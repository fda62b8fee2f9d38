//! A peer's module snapshot plus host metadata.

use std::fmt::Write as _;

use crate::descriptor::{
    EnforcementLevel, ModuleDescriptor, ModuleVersion, VersionStrictness, MAX_SUPPORTED_LAYOUT,
};

/// Host-level metadata sent alongside the module list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub version: ModuleVersion,
    /// 0 means unknown.
    pub network_protocol_version: u32,
    pub freeform_version: String,
}

/// A loaded module as reported by the enumeration layer. Policy fields are optional;
/// modules that declare none are treated as unenforced with no version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub id: String,
    pub name: String,
    pub version: ModuleVersion,
    pub enforcement: Option<EnforcementLevel>,
    pub strictness: Option<VersionStrictness>,
}

/// Enumerates the network-relevant modules loaded locally, in load order.
pub trait ModuleSource {
    fn network_modules(&self) -> Vec<ModuleRecord>;
}

impl ModuleSource for Vec<ModuleRecord> {
    fn network_modules(&self) -> Vec<ModuleRecord> {
        self.clone()
    }
}

impl<T: ModuleSource + ?Sized> ModuleSource for std::sync::Arc<T> {
    fn network_modules(&self) -> Vec<ModuleRecord> {
        (**self).network_modules()
    }
}

/// Immutable snapshot of one peer's modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInventory {
    host: HostInfo,
    modules: Vec<ModuleDescriptor>,
}

impl ModuleInventory {
    pub fn new(host: HostInfo, modules: Vec<ModuleDescriptor>) -> Self {
        Self { host, modules }
    }

    /// Snapshot the live module set.
    pub fn local(host: &HostInfo, source: &dyn ModuleSource) -> Self {
        let modules = source
            .network_modules()
            .into_iter()
            .map(|r| {
                ModuleDescriptor::new(
                    r.id,
                    r.name,
                    r.version,
                    r.enforcement.unwrap_or_default(),
                    r.strictness.unwrap_or_default(),
                )
            })
            .collect();
        Self::new(host.clone(), modules)
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn host_version(&self) -> ModuleVersion {
        self.host.version
    }

    pub fn network_protocol_version(&self) -> u32 {
        self.host.network_protocol_version
    }

    pub fn freeform_version(&self) -> &str {
        &self.host.freeform_version
    }

    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    /// Last descriptor with `id`; later entries shadow earlier ones.
    pub fn find(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().rev().find(|m| m.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Highest layout revision among the modules; `None` without modules.
    pub fn layout_version(&self) -> Option<i32> {
        self.modules.iter().map(|m| m.layout_version()).max()
    }

    pub fn is_supported_layout(&self) -> bool {
        self.modules
            .iter()
            .all(|m| m.layout_version() <= MAX_SUPPORTED_LAYOUT)
    }

    /// One line per module: name and version.
    pub fn format_modules(&self) -> String {
        let mut out = self.format_header();
        for m in &self.modules {
            let _ = writeln!(out, "  {} {}", m.name(), m.version());
        }
        out
    }

    /// Like [`format_modules`](Self::format_modules) with enforcement and strictness.
    pub fn format_modules_with_policy(&self) -> String {
        let mut out = self.format_header();
        for m in &self.modules {
            let _ = writeln!(
                out,
                "  {} {} ({}, strictness {})",
                m.name(),
                m.version(),
                m.enforcement(),
                m.strictness()
            );
        }
        out
    }

    fn format_header(&self) -> String {
        let mut out = format!("Version: {}", self.host.version);
        if !self.host.freeform_version.is_empty() {
            let _ = write!(out, " ({})", self.host.freeform_version);
        }
        if self.host.network_protocol_version != 0 {
            let _ = write!(out, ", protocol {}", self.host.network_protocol_version);
        }
        out.push('\n');
        out
    }
}
