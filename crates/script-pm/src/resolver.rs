//! Repository graph resolution
//!
//! Starting from one or more root manifest URLs, discovers every reachable
//! repository. The URL graph may contain cycles and shared children; each URL
//! is fetched at most once and each repository name is accepted at most once
//! per pass.
//!
//! Traversal is breadth-first and level-synchronous: the whole frontier is
//! fetched by a bounded worker pool, then merged in frontier order by a single
//! writer. The resulting index is therefore the same for any worker count.
//!
//! Resolution never fails as a whole. Unreachable or malformed manifests are
//! reported in [`ResolveReport::diagnostics`] and contribute nothing.

use crate::cancel::CancellationToken;
use crate::fetch::{FetchError, Fetcher};
use crate::manifest::{ManifestError, Repository};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, trace, warn};

/// Default number of concurrent manifest fetches
pub const DEFAULT_WORKERS: usize = 4;

/// Repositories keyed by name, in discovery order
#[derive(Debug, Clone, Default)]
pub struct RepositoryIndex {
    repositories: Vec<Repository>,
    by_name: HashMap<String, usize>,
}

impl RepositoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a repository unless its name is already present
    ///
    /// Returns `false` (and drops `repo`) on a duplicate name.
    pub fn insert(&mut self, repo: Repository) -> bool {
        if self.by_name.contains_key(&repo.name) {
            return false;
        }
        self.by_name.insert(repo.name.clone(), self.repositories.len());
        self.repositories.push(repo);
        true
    }

    /// Remove a repository by name
    pub fn remove(&mut self, name: &str) -> Option<Repository> {
        let idx = self.by_name.remove(name)?;
        let repo = self.repositories.remove(idx);
        for slot in self.by_name.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(repo)
    }

    pub fn get(&self, name: &str) -> Option<&Repository> {
        self.by_name.get(name).map(|&i| &self.repositories[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Find a repository by the URL it was fetched from
    pub fn find_by_url(&self, url: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.source_url == url)
    }

    /// Repositories in discovery order
    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repositories.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repositories.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

/// Why a URL contributed nothing to the index
#[derive(Debug)]
pub enum DiagnosticKind {
    /// Transport failure, timeout or cancellation
    Fetch(FetchError),
    /// Malformed manifest
    Format(ManifestError),
    /// A repository with the same name was already accepted
    DuplicateName(String),
}

/// A non-fatal problem met during resolution
#[derive(Debug)]
pub struct ResolveDiagnostic {
    pub url: String,
    pub kind: DiagnosticKind,
}

impl ResolveDiagnostic {
    /// Whether this diagnostic is an actual failure rather than a skipped duplicate
    pub fn is_failure(&self) -> bool {
        !matches!(self.kind, DiagnosticKind::DuplicateName(_))
    }
}

impl fmt::Display for ResolveDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiagnosticKind::Fetch(e) => write!(f, "{}: {}", self.url, e),
            DiagnosticKind::Format(e) => write!(f, "{}: {}", self.url, e),
            DiagnosticKind::DuplicateName(name) => {
                write!(f, "{}: repository '{}' already known, skipped", self.url, name)
            }
        }
    }
}

/// Outcome of a resolution pass
#[derive(Debug, Default)]
pub struct ResolveReport {
    /// Every repository reachable from the roots
    pub index: RepositoryIndex,
    /// Names accepted during this pass, in discovery order
    pub added: Vec<String>,
    pub diagnostics: Vec<ResolveDiagnostic>,
    /// Number of fetch attempts made
    pub fetched: usize,
}

impl ResolveReport {
    /// Diagnostics that represent failures
    pub fn failures(&self) -> impl Iterator<Item = &ResolveDiagnostic> {
        self.diagnostics.iter().filter(|d| d.is_failure())
    }
}

/// Discovers repositories by walking sub-repository URLs
pub struct RepositoryResolver {
    fetcher: Arc<dyn Fetcher>,
    workers: usize,
}

impl RepositoryResolver {
    /// Create a resolver with the default fan-out
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Set the maximum number of concurrent fetches (at least 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Resolve the graph reachable from `roots` into a fresh index
    pub fn resolve(&self, roots: &[String], cancel: &CancellationToken) -> ResolveReport {
        self.extend(RepositoryIndex::new(), roots, cancel)
    }

    /// Resolve the graph reachable from `roots` on top of an existing index
    ///
    /// Repositories already in `index` are neither refetched (by URL) nor
    /// replaced (by name).
    pub fn extend(
        &self,
        mut index: RepositoryIndex,
        roots: &[String],
        cancel: &CancellationToken,
    ) -> ResolveReport {
        info!(roots = roots.len(), workers = self.workers, "Resolving repositories");

        let mut seen_urls: HashSet<String> =
            index.iter().map(|r| r.source_url.clone()).collect();
        let mut frontier: Vec<String> = Vec::new();
        for url in roots {
            if seen_urls.insert(url.clone()) {
                frontier.push(url.clone());
            }
        }

        let mut added = Vec::new();
        let mut diagnostics = Vec::new();
        let mut fetched = 0;

        while !frontier.is_empty() {
            if cancel.is_cancelled() {
                warn!(pending = frontier.len(), "Resolution cancelled");
                for url in frontier {
                    diagnostics.push(ResolveDiagnostic {
                        kind: DiagnosticKind::Fetch(FetchError::Cancelled(url.clone())),
                        url,
                    });
                }
                break;
            }

            trace!(size = frontier.len(), "Fetching frontier");
            let results = self.fetch_frontier(&frontier, cancel);
            fetched += frontier.len();

            // Single writer: merge in frontier order.
            let mut next = Vec::new();
            for (url, result) in frontier.into_iter().zip(results) {
                match result {
                    Err(kind) => {
                        warn!(url = %url, error = ?kind, "Unable to build repository");
                        diagnostics.push(ResolveDiagnostic { url, kind });
                    }
                    Ok(repo) => {
                        if index.contains(&repo.name) {
                            debug!(url = %url, name = %repo.name, "Duplicate repository skipped");
                            diagnostics.push(ResolveDiagnostic {
                                url,
                                kind: DiagnosticKind::DuplicateName(repo.name),
                            });
                            continue;
                        }

                        for sub in &repo.sub_repository_urls {
                            if seen_urls.insert(sub.clone()) {
                                next.push(sub.clone());
                            }
                        }
                        debug!(url = %url, name = %repo.name, modules = repo.modules.len(), "Repository discovered");
                        added.push(repo.name.clone());
                        index.insert(repo);
                    }
                }
            }
            frontier = next;
        }

        info!(
            repositories = index.len(),
            added = added.len(),
            failures = diagnostics.iter().filter(|d| d.is_failure()).count(),
            "Resolution complete"
        );

        ResolveReport {
            index,
            added,
            diagnostics,
            fetched,
        }
    }

    /// Fetch and parse every URL of a frontier, results in frontier order
    fn fetch_frontier(
        &self,
        frontier: &[String],
        cancel: &CancellationToken,
    ) -> Vec<Result<Repository, DiagnosticKind>> {
        let workers = self.workers.min(frontier.len());
        if workers <= 1 {
            return frontier
                .iter()
                .map(|url| self.fetch_one(url, cancel))
                .collect();
        }

        let (job_tx, job_rx) = crossbeam::channel::unbounded::<(usize, &str)>();
        let (result_tx, result_rx) = crossbeam::channel::unbounded();

        for (i, url) in frontier.iter().enumerate() {
            // Receiver is alive, an unbounded send cannot fail here.
            let _ = job_tx.send((i, url.as_str()));
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for (i, url) in job_rx.iter() {
                        let result = self.fetch_one(url, cancel);
                        if result_tx.send((i, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<Result<Repository, DiagnosticKind>>> =
            frontier.iter().map(|_| None).collect();
        for (i, result) in result_rx.iter() {
            slots[i] = Some(result);
        }

        slots
            .into_iter()
            .zip(frontier)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| {
                    Err(DiagnosticKind::Fetch(FetchError::Cancelled(url.clone())))
                })
            })
            .collect()
    }

    fn fetch_one(&self, url: &str, cancel: &CancellationToken) -> Result<Repository, DiagnosticKind> {
        trace!(url = %url, "Fetching manifest");
        let content = self
            .fetcher
            .fetch(url, cancel)
            .map_err(DiagnosticKind::Fetch)?;
        Repository::from_json(url, &content).map_err(DiagnosticKind::Format)
    }
}
