//! Script Package Manager Library
//!
//! This crate manages optional, user-installable scripts for a host
//! application, including:
//! - Repository manifest parsing
//! - Repository graph discovery (cycles and shared children tolerated)
//! - A flattened module catalog with provenance
//! - Install, uninstall, update and update-all against the catalog
//! - Local script storage and change notification

pub mod cancel;
pub mod config;
pub mod events;
pub mod fetch;
pub mod installed;
pub mod lifecycle;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod version;

pub use cancel::CancellationToken;
pub use config::{Config, ConfigError, DEFAULT_BASE_REPOSITORY};
pub use events::{EventBus, PackageEvent};
pub use fetch::{FetchError, Fetcher, HttpFetcher};
pub use installed::{InstalledModule, InstalledSet};
pub use lifecycle::{
    InstallationResult, ModuleOutcome, PackageManager, RefreshSummary, UpdateReport,
};
pub use manifest::{ChangelogEntry, ManifestError, Module, ModuleKind, Repository};
pub use registry::{Catalog, CatalogConflict};
pub use resolver::{
    DiagnosticKind, RepositoryIndex, RepositoryResolver, ResolveDiagnostic, ResolveReport,
};
pub use storage::{FsStorage, MemoryStorage, ScriptStorage, StorageError};
pub use version::{Version, VersionError};
