//! Installed module records

use crate::manifest::{Module, ModuleKind};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Local record of an installed module
///
/// Snapshot of the catalog entry taken at install (or update) time. The
/// version is the one actually on disk and may lag behind the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledModule {
    pub qualified_name: String,

    pub display_name: String,

    #[serde(default)]
    pub kind: ModuleKind,

    pub version: Version,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_repository: Option<String>,

    /// SHA-256 of the stored payload (hex-encoded)
    pub checksum: String,
}

impl InstalledModule {
    /// Snapshot `module` as installed with `payload`
    pub fn from_module(module: &Module, payload: &[u8]) -> Self {
        Self {
            qualified_name: module.qualified_name.clone(),
            display_name: module.display_name.clone(),
            kind: module.kind,
            version: module.version,
            dependencies: module.dependencies.clone(),
            origin_repository: module.origin_repository.clone(),
            checksum: compute_checksum(payload),
        }
    }

    /// Payload file name, e.g. `author.name.lib.cs`
    pub fn file_name(&self) -> String {
        format!("{}{}", self.qualified_name, self.kind.file_suffix())
    }

    /// Stem of every file stored for this module
    pub fn stem(&self) -> String {
        self.kind.file_stem(&self.qualified_name)
    }

    pub fn depends_on(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| d == name)
    }
}

/// Compute SHA-256 checksum of bytes
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Installed modules keyed by qualified name
///
/// At most one record per qualified name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstalledSet {
    modules: BTreeMap<String, InstalledModule>,
}

impl InstalledSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `module.qualified_name`
    pub fn insert(&mut self, module: InstalledModule) -> Option<InstalledModule> {
        self.modules.insert(module.qualified_name.clone(), module)
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledModule> {
        self.modules.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&InstalledModule> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Records sorted by qualified name
    pub fn iter(&self) -> impl Iterator<Item = &InstalledModule> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Installed modules that list `name` as a dependency (excluding itself)
    pub fn dependents_of(&self, name: &str) -> Vec<&InstalledModule> {
        self.modules
            .values()
            .filter(|m| m.qualified_name != name && m.depends_on(name))
            .collect()
    }
}

impl FromIterator<InstalledModule> for InstalledSet {
    fn from_iter<I: IntoIterator<Item = InstalledModule>>(iter: I) -> Self {
        let mut set = InstalledSet::new();
        for module in iter {
            set.insert(module);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: f64, deps: &[&str]) -> InstalledModule {
        InstalledModule {
            qualified_name: name.to_string(),
            display_name: name.to_string(),
            kind: ModuleKind::Script,
            version: Version::new(version).unwrap(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            origin_repository: None,
            checksum: compute_checksum(b""),
        }
    }

    #[test]
    fn test_compute_checksum() {
        let checksum = compute_checksum(b"hello world");
        assert_eq!(checksum.len(), 64);
        assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_one_record_per_name() {
        let mut set = InstalledSet::new();
        assert!(set.insert(record("a.x", 1.0, &[])).is_none());
        let previous = set.insert(record("a.x", 2.0, &[])).unwrap();
        assert_eq!(previous.version, Version::new(1.0).unwrap());
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("a.x").unwrap().version, Version::new(2.0).unwrap());
    }

    #[test]
    fn test_dependents_of() {
        let set: InstalledSet = vec![
            record("a.lib", 1.0, &["a.lib"]),
            record("a.one", 1.0, &["a.lib"]),
            record("a.two", 1.0, &[]),
        ]
        .into_iter()
        .collect();

        let dependents: Vec<_> = set
            .dependents_of("a.lib")
            .into_iter()
            .map(|m| m.qualified_name.as_str())
            .collect();
        assert_eq!(dependents, vec!["a.one"]);
        assert!(set.dependents_of("a.two").is_empty());
    }

    #[test]
    fn test_file_name() {
        let mut lib = record("a.lib", 1.0, &[]);
        lib.kind = ModuleKind::Library;
        assert_eq!(lib.file_name(), "a.lib.lib.cs");
        assert_eq!(record("a.x", 1.0, &[]).file_name(), "a.x.cs");
    }

    #[test]
    fn test_sidecar_roundtrip_shape() {
        let json = serde_json::to_string(&record("a.x", 1.5, &["a.lib"])).unwrap();
        assert!(json.contains("\"qualified_name\":\"a.x\""));
        assert!(!json.contains("origin_repository"));
        let back: InstalledModule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dependencies, vec!["a.lib"]);
    }
}
