//! Module manifest: the locally loaded modules, read from TOML.
//!
//! ```toml
//! [[module]]
//! id = "com.example.core"
//! name = "Core"
//! version = "1.2.0"
//! enforcement = "server-must-have"
//! strictness = "minor"
//! ```

use std::path::Path;

use anyhow::Context;
use modlink_core::{EnforcementLevel, ModuleRecord, ModuleSource, VersionStrictness};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default, rename = "module")]
    modules: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    id: String,
    /// Defaults to `id`.
    name: Option<String>,
    version: String,
    enforcement: Option<EnforcementLevel>,
    strictness: Option<VersionStrictness>,
}

/// Validated manifest, in file order.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    records: Vec<ModuleRecord>,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("in manifest {}", path.display()))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let file: ManifestFile = toml::from_str(s)?;
        let records = file
            .modules
            .into_iter()
            .map(|e| {
                let version = e
                    .version
                    .parse()
                    .with_context(|| format!("module {}", e.id))?;
                Ok(ModuleRecord {
                    name: e.name.unwrap_or_else(|| e.id.clone()),
                    id: e.id,
                    version,
                    enforcement: e.enforcement,
                    strictness: e.strictness,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl ModuleSource for Manifest {
    fn network_modules(&self) -> Vec<ModuleRecord> {
        self.records.clone()
    }
}
