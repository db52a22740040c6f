//! Module catalog
//!
//! Flattens every module published across a [`RepositoryIndex`] into one
//! catalog keyed by qualified name, stamped with the URL of the repository
//! that published it.
//!
//! When two repositories publish the same qualified name, the entry seen
//! first in index order is kept and the later one is recorded as a
//! [`CatalogConflict`].

use crate::installed::InstalledSet;
use crate::manifest::Module;
use crate::resolver::RepositoryIndex;
use std::collections::HashMap;
use tracing::{trace, warn};

/// A module entry that lost a qualified-name collision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogConflict {
    pub qualified_name: String,
    /// Repository whose entry was kept
    pub kept_repository: Option<String>,
    /// Repository whose entry was ignored
    pub ignored_repository: Option<String>,
}

/// All discoverable modules, in discovery order
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    modules: Vec<Module>,
    by_name: HashMap<String, usize>,
    conflicts: Vec<CatalogConflict>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the catalog from a resolved index
    pub fn flatten(index: &RepositoryIndex) -> Self {
        let mut catalog = Catalog::new();
        for repo in index.iter() {
            trace!(repository = %repo.name, modules = repo.modules.len(), "Gathering modules");
            for module in &repo.modules {
                let mut module = module.clone();
                module.origin_repository = Some(repo.source_url.clone());
                catalog.insert(module);
            }
        }
        catalog
    }

    /// Insert a module; keeps the existing entry on a name collision
    fn insert(&mut self, module: Module) -> bool {
        if let Some(&idx) = self.by_name.get(&module.qualified_name) {
            let kept = &self.modules[idx];
            warn!(
                module = %module.qualified_name,
                kept = ?kept.origin_repository,
                ignored = ?module.origin_repository,
                "Qualified name published by more than one repository"
            );
            self.conflicts.push(CatalogConflict {
                qualified_name: module.qualified_name,
                kept_repository: kept.origin_repository.clone(),
                ignored_repository: module.origin_repository,
            });
            return false;
        }
        self.by_name
            .insert(module.qualified_name.clone(), self.modules.len());
        self.modules.push(module);
        true
    }

    pub fn get(&self, qualified_name: &str) -> Option<&Module> {
        self.by_name
            .get(qualified_name)
            .map(|&i| &self.modules[i])
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.by_name.contains_key(qualified_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Collisions met while flattening
    pub fn conflicts(&self) -> &[CatalogConflict] {
        &self.conflicts
    }

    /// Catalog entries that are not installed
    pub fn available_to_install<'a>(&'a self, installed: &'a InstalledSet) -> Vec<&'a Module> {
        self.modules
            .iter()
            .filter(|m| !installed.contains(&m.qualified_name))
            .collect()
    }

    /// Case-insensitive search over names, descriptions and tags
    pub fn search(&self, query: &str, include_beta: bool) -> Vec<&Module> {
        let query = query.to_lowercase();
        self.modules
            .iter()
            .filter(|m| include_beta || !m.is_beta_channel)
            .filter(|m| {
                query.is_empty()
                    || m.qualified_name.to_lowercase().contains(&query)
                    || m.display_name.to_lowercase().contains(&query)
                    || m.description.to_lowercase().contains(&query)
                    || m.tags.iter().any(|t| t.to_lowercase() == query)
            })
            .collect()
    }
}
