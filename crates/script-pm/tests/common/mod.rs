//! Shared fixtures for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use script_pm::{CancellationToken, FetchError, Fetcher};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

/// In-memory fetcher keyed by URL
#[derive(Default)]
pub struct MockFetcher {
    pages: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` at `url`
    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.pages.lock().insert(url.to_string(), body.into());
    }

    pub fn serve_json(&self, url: &str, value: &Value) {
        self.serve(url, value.to_string());
    }

    /// Make every request to `url` fail
    pub fn fail(&self, url: &str) {
        self.failing.lock().insert(url.to_string());
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().values().sum()
    }
}

impl Fetcher for MockFetcher {
    fn download(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        *self.hits.lock().entry(url.to_string()).or_insert(0) += 1;

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled(url.to_string()));
        }
        if self.failing.lock().contains(url) {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            });
        }
        self.pages
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

/// Repository manifest with the given sub-repositories and modules
pub fn repository(name: &str, subs: &[&str], modules: Vec<Value>) -> Value {
    json!({
        "Name": name,
        "Description": format!("{} repository", name),
        "Maintainer": "tester",
        "IsBetaChannel": false,
        "Repositories": subs,
        "Modules": modules,
    })
}

/// Script module whose payload lives at `payload_url(qname, version)`
pub fn module(qname: &str, version: f64, deps: &[&str]) -> Value {
    json!({
        "DisplayName": qname,
        "QualifiedName": qname,
        "Description": "",
        "Author": "tester",
        "Version": version,
        "IsBetaChannel": false,
        "Dependencies": deps,
        "Tags": [],
        "Url": payload_url(qname, version),
    })
}

pub fn payload_url(qname: &str, version: f64) -> String {
    format!("https://scripts.test/{}/{}.cs", qname, version)
}

/// Serve a payload for every module of a repository manifest
pub fn serve_payloads(fetcher: &MockFetcher, repo: &Value) {
    if let Some(modules) = repo["Modules"].as_array() {
        for m in modules {
            let url = m["Url"].as_str().unwrap_or_default();
            let body = format!("// {} {}", m["QualifiedName"], m["Version"]);
            fetcher.serve(url, body);
        }
    }
}

pub fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
