//! Installation lifecycle
//!
//! [`PackageManager`] owns the repository index, the catalog built from it and
//! the set of installed modules. Every operation reports a discrete
//! [`InstallationResult`]; nothing here returns `Err` to the caller.
//!
//! Mutations (install, uninstall, update, refresh, repository changes) are
//! serialised by an operation lock held for the whole operation, including
//! downloads. The shared state sits behind a read/write lock that is only
//! write-locked for the final swap, so readers always observe either the state
//! before or after a mutation.

use crate::cancel::CancellationToken;
use crate::events::{EventBus, PackageEvent};
use crate::fetch::Fetcher;
use crate::installed::{InstalledModule, InstalledSet};
use crate::manifest::{is_valid_qualified_name, Module, Repository};
use crate::registry::{Catalog, CatalogConflict};
use crate::resolver::{DiagnosticKind, RepositoryIndex, RepositoryResolver, ResolveDiagnostic};
use crate::storage::{ScriptStorage, StorageError};
use crossbeam::channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a single lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallationResult {
    Success,
    AlreadyInstalled,
    NotInstalled,
    NotInCatalog,
    NoUpdateAvailable,
    /// Payload or manifest could not be fetched
    DownloadFailed,
    /// Local write or delete failed; installed state unchanged
    StorageFailed,
    /// Qualified name is not usable, or its files would collide with an installed module
    InvalidName,
    /// A dependency is not in the catalog
    DependencyNotFound,
    /// Another installed module depends on this one
    IsRequiredDependency,
    /// Repository manifest is malformed
    InvalidManifest,
}

impl InstallationResult {
    pub fn is_success(&self) -> bool {
        *self == InstallationResult::Success
    }
}

impl fmt::Display for InstallationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InstallationResult::Success => "success",
            InstallationResult::AlreadyInstalled => "already installed",
            InstallationResult::NotInstalled => "not installed",
            InstallationResult::NotInCatalog => "not found in any repository",
            InstallationResult::NoUpdateAvailable => "no update available",
            InstallationResult::DownloadFailed => "download failed",
            InstallationResult::StorageFailed => "could not write to local storage",
            InstallationResult::InvalidName => "invalid qualified name",
            InstallationResult::DependencyNotFound => "a dependency could not be found",
            InstallationResult::IsRequiredDependency => "required by another installed module",
            InstallationResult::InvalidManifest => "repository manifest is invalid",
        };
        f.write_str(text)
    }
}

/// Result for one module inside a batch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOutcome {
    pub qualified_name: String,
    pub result: InstallationResult,
}

/// Aggregate outcome of [`PackageManager::update_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// One entry per attempted update, in attempt order
    pub results: Vec<ModuleOutcome>,
    /// Number of passes that attempted at least one update
    pub passes: usize,
    /// Stopped early by cancellation
    pub cancelled: bool,
}

impl UpdateReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ModuleOutcome> {
        self.results.iter().filter(|o| o.result.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ModuleOutcome> {
        self.results.iter().filter(|o| !o.result.is_success())
    }

    /// First failure, if any, for hosts that show a single message
    pub fn first_failure(&self) -> Option<InstallationResult> {
        self.failed().next().map(|o| o.result)
    }

    /// Whether the host should reload installed scripts
    pub fn requires_reload(&self) -> bool {
        self.succeeded().next().is_some()
    }
}

/// Summary of a catalog refresh
#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub repositories: usize,
    pub modules: usize,
    pub diagnostics: Vec<ResolveDiagnostic>,
    pub conflicts: Vec<CatalogConflict>,
}

impl RefreshSummary {
    pub fn failures(&self) -> impl Iterator<Item = &ResolveDiagnostic> {
        self.diagnostics.iter().filter(|d| d.is_failure())
    }
}

#[derive(Debug, Default)]
struct State {
    index: RepositoryIndex,
    catalog: Catalog,
    installed: InstalledSet,
}

/// Tracks installed modules and performs lifecycle operations against the catalog
pub struct PackageManager {
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn ScriptStorage>,
    resolver: RepositoryResolver,
    state: RwLock<State>,
    op_lock: Mutex<()>,
    events: EventBus,
}

impl PackageManager {
    /// Create a manager with an empty installed set
    pub fn new(fetcher: Arc<dyn Fetcher>, storage: Arc<dyn ScriptStorage>) -> Self {
        info!("Initialized package manager");
        Self {
            resolver: RepositoryResolver::new(fetcher.clone()),
            fetcher,
            storage,
            state: RwLock::new(State::default()),
            op_lock: Mutex::new(()),
            events: EventBus::new(),
        }
    }

    /// Create a manager and load the installed set from storage
    pub fn open(
        fetcher: Arc<dyn Fetcher>,
        storage: Arc<dyn ScriptStorage>,
    ) -> Result<Self, StorageError> {
        let installed: InstalledSet = storage.load_installed()?.into_iter().collect();
        info!(installed = installed.len(), "Loaded installed modules");
        let manager = Self::new(fetcher, storage);
        manager.state.write().installed = installed;
        Ok(manager)
    }

    /// Set the maximum number of concurrent manifest fetches
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.resolver = RepositoryResolver::new(self.fetcher.clone()).with_workers(workers);
        self
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> Receiver<PackageEvent> {
        self.events.subscribe()
    }

    // Views

    /// Run `f` against one consistent snapshot of the state
    pub fn with_snapshot<R>(
        &self,
        f: impl FnOnce(&RepositoryIndex, &Catalog, &InstalledSet) -> R,
    ) -> R {
        let state = self.state.read();
        f(&state.index, &state.catalog, &state.installed)
    }

    pub fn catalog(&self) -> Catalog {
        self.state.read().catalog.clone()
    }

    pub fn installed(&self) -> InstalledSet {
        self.state.read().installed.clone()
    }

    /// Repositories in discovery order
    pub fn repositories(&self) -> Vec<Repository> {
        self.state.read().index.iter().cloned().collect()
    }

    /// Catalog entry for a qualified name
    pub fn module(&self, qualified_name: &str) -> Option<Module> {
        self.state.read().catalog.get(qualified_name).cloned()
    }

    pub fn installed_module(&self, qualified_name: &str) -> Option<InstalledModule> {
        self.state.read().installed.get(qualified_name).cloned()
    }

    pub fn is_installed(&self, qualified_name: &str) -> bool {
        self.state.read().installed.contains(qualified_name)
    }

    /// Catalog entries that are not installed
    pub fn available_to_install(&self) -> Vec<Module> {
        let state = self.state.read();
        state
            .catalog
            .available_to_install(&state.installed)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Whether an installed module has no newer catalog entry
    ///
    /// Modules missing from the catalog count as up to date.
    pub fn is_up_to_date(&self, qualified_name: &str) -> bool {
        let state = self.state.read();
        match (
            state.installed.get(qualified_name),
            state.catalog.get(qualified_name),
        ) {
            (Some(installed), Some(latest)) => !latest.version.is_newer_than(&installed.version),
            _ => true,
        }
    }

    /// Catalog entries strictly newer than their installed counterpart
    ///
    /// Recomputed on every call.
    pub fn update_candidates(&self) -> Vec<Module> {
        let state = self.state.read();
        state
            .installed
            .iter()
            .filter_map(|installed| {
                state
                    .catalog
                    .get(&installed.qualified_name)
                    .filter(|latest| latest.version.is_newer_than(&installed.version))
                    .cloned()
            })
            .collect()
    }

    // Repositories

    /// Rebuild the repository index and catalog from `roots`
    pub fn refresh(&self, roots: &[String], cancel: &CancellationToken) -> RefreshSummary {
        let _op = self.op_lock.lock();
        info!(roots = roots.len(), "Refreshing repositories");

        let report = self.resolver.resolve(roots, cancel);
        let catalog = Catalog::flatten(&report.index);
        let summary = RefreshSummary {
            repositories: report.index.len(),
            modules: catalog.len(),
            diagnostics: report.diagnostics,
            conflicts: catalog.conflicts().to_vec(),
        };

        {
            let mut state = self.state.write();
            state.index = report.index;
            state.catalog = catalog;
        }

        self.events.publish(PackageEvent::CatalogRefreshed {
            repositories: summary.repositories,
            modules: summary.modules,
        });
        info!(
            repositories = summary.repositories,
            modules = summary.modules,
            "Refresh complete"
        );
        summary
    }

    /// Add the repository at `url` (and anything it references) to the index
    pub fn add_repository(&self, url: &str, cancel: &CancellationToken) -> InstallationResult {
        let _op = self.op_lock.lock();

        let index = {
            let state = self.state.read();
            if state.index.find_by_url(url).is_some() {
                return InstallationResult::AlreadyInstalled;
            }
            state.index.clone()
        };

        info!(url = %url, "Adding repository");
        let report = self.resolver.extend(index, &[url.to_string()], cancel);

        if report.added.is_empty() {
            let root_problem = report.diagnostics.iter().find(|d| d.url == url);
            return match root_problem.map(|d| &d.kind) {
                Some(DiagnosticKind::DuplicateName(name)) => {
                    warn!(url = %url, name = %name, "Repository already present");
                    InstallationResult::AlreadyInstalled
                }
                Some(DiagnosticKind::Format(e)) => {
                    error!(url = %url, error = %e, "Unable to parse repository");
                    InstallationResult::InvalidManifest
                }
                Some(DiagnosticKind::Fetch(e)) => {
                    error!(url = %url, error = %e, "Unable to fetch repository");
                    InstallationResult::DownloadFailed
                }
                None => InstallationResult::AlreadyInstalled,
            };
        }

        let catalog = Catalog::flatten(&report.index);
        {
            let mut state = self.state.write();
            state.index = report.index;
            state.catalog = catalog;
        }

        for name in report.added {
            self.events.publish(PackageEvent::RepositoryAdded { name });
        }
        InstallationResult::Success
    }

    /// Remove a repository by name and rebuild the catalog
    ///
    /// Installed modules are not touched.
    pub fn remove_repository(&self, name: &str) -> InstallationResult {
        let _op = self.op_lock.lock();
        {
            let mut state = self.state.write();
            if state.index.remove(name).is_none() {
                return InstallationResult::NotInstalled;
            }
            state.catalog = Catalog::flatten(&state.index);
        }

        info!(name = %name, "Removed repository");
        self.events.publish(PackageEvent::RepositoryRemoved {
            name: name.to_string(),
        });
        InstallationResult::Success
    }

    // Modules

    /// Install a module and, first, any of its dependencies not yet installed
    pub fn install(&self, module: &Module, cancel: &CancellationToken) -> InstallationResult {
        let _op = self.op_lock.lock();
        let mut visiting = HashSet::new();
        self.install_locked(module, cancel, &mut visiting)
    }

    /// Install the catalog entry named `qualified_name`
    pub fn install_by_name(
        &self,
        qualified_name: &str,
        cancel: &CancellationToken,
    ) -> InstallationResult {
        match self.module(qualified_name) {
            Some(module) => self.install(&module, cancel),
            None => InstallationResult::NotInCatalog,
        }
    }

    /// Remove an installed module
    ///
    /// Dependencies are left installed.
    pub fn uninstall(&self, qualified_name: &str) -> InstallationResult {
        let _op = self.op_lock.lock();

        let record = {
            let state = self.state.read();
            let Some(record) = state.installed.get(qualified_name).cloned() else {
                return InstallationResult::NotInstalled;
            };
            let dependents = state.installed.dependents_of(qualified_name);
            if !dependents.is_empty() {
                warn!(
                    module = %qualified_name,
                    required_by = %dependents[0].qualified_name,
                    "Refusing to uninstall a required dependency"
                );
                return InstallationResult::IsRequiredDependency;
            }
            record
        };
        info!(module = %qualified_name, "Attempting to uninstall module");

        if let Err(e) = self.storage.delete(&record) {
            error!(module = %qualified_name, error = %e, "Failed to uninstall module");
            return InstallationResult::StorageFailed;
        }

        self.state.write().installed.remove(qualified_name);
        info!(module = %qualified_name, "Successfully uninstalled module");
        self.events.publish(PackageEvent::Uninstalled {
            qualified_name: qualified_name.to_string(),
        });
        InstallationResult::Success
    }

    /// Replace an installed module with its newer catalog entry
    pub fn update(&self, qualified_name: &str, cancel: &CancellationToken) -> InstallationResult {
        let _op = self.op_lock.lock();
        info!(module = %qualified_name, "Update requested");

        let (installed, latest) = {
            let state = self.state.read();
            let Some(installed) = state.installed.get(qualified_name).cloned() else {
                return InstallationResult::NotInstalled;
            };
            let Some(latest) = state.catalog.get(qualified_name).cloned() else {
                return InstallationResult::NotInCatalog;
            };
            (installed, latest)
        };

        if !latest.version.is_newer_than(&installed.version) {
            debug!(
                module = %qualified_name,
                installed = %installed.version,
                available = %latest.version,
                "Already up to date"
            );
            return InstallationResult::NoUpdateAvailable;
        }

        if let Some(owner) = self.file_owner(&latest) {
            error!(module = %qualified_name, owner = %owner, "File names collide with an installed module");
            return InstallationResult::InvalidName;
        }

        let mut visiting = HashSet::new();
        let deps = self.install_dependencies(&latest, cancel, &mut visiting);
        if !deps.is_success() {
            return deps;
        }

        let result = self.fetch_and_store(&latest, cancel);
        if result.is_success() {
            info!(
                module = %qualified_name,
                from = %installed.version,
                to = %latest.version,
                "Successfully updated module"
            );
            self.events.publish(PackageEvent::Updated {
                qualified_name: qualified_name.to_string(),
            });
        }
        result
    }

    /// Update every outdated module until nothing more can be updated
    ///
    /// Each pass recomputes the candidates and updates all of them. A module
    /// whose update failed is not retried in later passes, and the loop ends
    /// as soon as a pass makes no progress or the outstanding count stops
    /// shrinking. Cancellation is honoured before each update; completed
    /// updates are kept.
    pub fn update_all(&self, cancel: &CancellationToken) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut failed: HashSet<String> = HashSet::new();
        let mut outstanding: Option<usize> = None;

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let candidates: Vec<Module> = self
                .update_candidates()
                .into_iter()
                .filter(|m| !failed.contains(&m.qualified_name))
                .collect();
            if candidates.is_empty() {
                break;
            }

            if let Some(previous) = outstanding {
                if candidates.len() >= previous {
                    warn!(
                        outstanding = candidates.len(),
                        "Update pass made no progress, stopping"
                    );
                    break;
                }
            }
            outstanding = Some(candidates.len());
            report.passes += 1;
            debug!(pass = report.passes, candidates = candidates.len(), "Update pass");

            let mut progressed = 0;
            for module in candidates {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let result = self.update(&module.qualified_name, cancel);
                if result.is_success() {
                    progressed += 1;
                } else {
                    failed.insert(module.qualified_name.clone());
                }
                report.results.push(ModuleOutcome {
                    qualified_name: module.qualified_name,
                    result,
                });
            }

            if report.cancelled || progressed == 0 {
                break;
            }
        }

        info!(
            passes = report.passes,
            updated = report.succeeded().count(),
            failed = report.failed().count(),
            cancelled = report.cancelled,
            "Update all finished"
        );
        report
    }

    // Internals; callers hold `op_lock`.

    fn install_locked(
        &self,
        module: &Module,
        cancel: &CancellationToken,
        visiting: &mut HashSet<String>,
    ) -> InstallationResult {
        if self.is_installed(&module.qualified_name) {
            return InstallationResult::AlreadyInstalled;
        }
        info!(module = %module.qualified_name, "Attempting to install module");

        if !is_valid_qualified_name(&module.qualified_name) {
            error!(module = %module.qualified_name, "Invalid qualified name");
            return InstallationResult::InvalidName;
        }
        if let Some(owner) = self.file_owner(module) {
            error!(module = %module.qualified_name, owner = %owner, "File names collide with an installed module");
            return InstallationResult::InvalidName;
        }

        let deps = self.install_dependencies(module, cancel, visiting);
        if !deps.is_success() {
            return deps;
        }

        let result = self.fetch_and_store(module, cancel);
        if result.is_success() {
            info!(module = %module.qualified_name, "Successfully installed module");
            self.events.publish(PackageEvent::Installed {
                qualified_name: module.qualified_name.clone(),
            });
        }
        result
    }

    /// Another installed module whose files share a stem with `module`
    ///
    /// A library `x` and a script `x.lib` would overwrite each other.
    fn file_owner(&self, module: &Module) -> Option<String> {
        let stem = module.kind.file_stem(&module.qualified_name);
        self.state
            .read()
            .installed
            .iter()
            .find(|m| m.qualified_name != module.qualified_name && m.stem() == stem)
            .map(|m| m.qualified_name.clone())
    }

    /// Install missing dependencies of `module`, depth first
    fn install_dependencies(
        &self,
        module: &Module,
        cancel: &CancellationToken,
        visiting: &mut HashSet<String>,
    ) -> InstallationResult {
        visiting.insert(module.qualified_name.clone());

        for name in &module.dependencies {
            if visiting.contains(name) || self.is_installed(name) {
                continue;
            }

            let Some(dependency) = self.module(name) else {
                error!(
                    dependency = %name,
                    module = %module.qualified_name,
                    "Failed to find dependency"
                );
                return InstallationResult::DependencyNotFound;
            };

            match self.install_locked(&dependency, cancel, visiting) {
                InstallationResult::Success | InstallationResult::AlreadyInstalled => {}
                failure => return failure,
            }
        }
        InstallationResult::Success
    }

    /// Download the payload, persist it, then record it in the installed set
    fn fetch_and_store(&self, module: &Module, cancel: &CancellationToken) -> InstallationResult {
        let payload = match self.fetcher.download(&module.download_url, cancel) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    module = %module.qualified_name,
                    url = %module.download_url,
                    error = %e,
                    "Failed to download module"
                );
                return InstallationResult::DownloadFailed;
            }
        };

        let record = InstalledModule::from_module(module, &payload);
        if let Err(e) = self.storage.write(&record, &payload) {
            error!(module = %module.qualified_name, error = %e, "Failed to write module to disk");
            return InstallationResult::StorageFailed;
        }

        if let Some(help_url) = &module.help_url {
            match self.fetcher.download(help_url, cancel) {
                Ok(help) => {
                    if let Err(e) = self.storage.write_help(&record, &help) {
                        warn!(module = %module.qualified_name, error = %e, "Failed to store help file");
                    }
                }
                Err(e) => {
                    warn!(module = %module.qualified_name, url = %help_url, error = %e, "Failed to download help file");
                }
            }
        }

        self.state.write().installed.insert(record);
        InstallationResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_display() {
        assert_eq!(InstallationResult::Success.to_string(), "success");
        assert_eq!(
            InstallationResult::DownloadFailed.to_string(),
            "download failed"
        );
    }

    #[test]
    fn test_report_helpers() {
        let report = UpdateReport {
            results: vec![
                ModuleOutcome {
                    qualified_name: "a.x".to_string(),
                    result: InstallationResult::DownloadFailed,
                },
                ModuleOutcome {
                    qualified_name: "a.y".to_string(),
                    result: InstallationResult::Success,
                },
            ],
            passes: 1,
            cancelled: false,
        };
        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(
            report.first_failure(),
            Some(InstallationResult::DownloadFailed)
        );
        assert!(report.requires_reload());
        assert!(!UpdateReport::default().requires_reload());
    }
}
