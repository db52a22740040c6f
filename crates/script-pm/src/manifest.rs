//! Repository manifest model
//!
//! A repository manifest is a JSON document published at some URL. It lists
//! the modules the repository publishes and the URLs of further repositories
//! to discover.

use crate::version::Version;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while reading a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Malformed JSON or a missing/mistyped required field
    #[error("Failed to parse manifest: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Validation error
    #[error("Invalid manifest: {0}")]
    ValidationError(String),
}

static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._]+$").expect("qualified name pattern"));

/// Check a module qualified name (`author.script_name`)
pub fn is_valid_qualified_name(name: &str) -> bool {
    QUALIFIED_NAME.is_match(name)
}

/// Kind of installable module
///
/// Determines where the payload lands on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleKind {
    /// Runnable script
    #[default]
    Script,
    /// Shared code imported by scripts
    Library,
    /// Small JavaScript snippet
    Scriptlet,
}

impl ModuleKind {
    /// File name suffix for the payload
    pub fn file_suffix(&self) -> &'static str {
        match self {
            ModuleKind::Script => ".cs",
            ModuleKind::Library => ".lib.cs",
            ModuleKind::Scriptlet => ".js",
        }
    }

    /// Stem shared by the payload, sidecar and help file names
    pub fn file_stem(&self, qualified_name: &str) -> String {
        match self {
            ModuleKind::Library => format!("{}.lib", qualified_name),
            ModuleKind::Script | ModuleKind::Scriptlet => qualified_name.to_string(),
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Script => write!(f, "script"),
            ModuleKind::Library => write!(f, "library"),
            ModuleKind::Scriptlet => write!(f, "scriptlet"),
        }
    }
}

/// One release in a module changelog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangelogEntry {
    pub version: Version,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixed: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deprecated: Vec<String>,
}

/// An installable module as published by a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Module {
    /// Payload kind (defaults to script)
    #[serde(rename = "Type", default)]
    pub kind: ModuleKind,

    pub display_name: String,

    /// Globally unique identifier
    pub qualified_name: String,

    pub description: String,

    pub author: String,

    pub version: Version,

    pub is_beta_channel: bool,

    /// Qualified names of required modules, in manifest order
    pub dependencies: Vec<String>,

    pub tags: Vec<String>,

    /// Payload location
    #[serde(rename = "Url")]
    pub download_url: String,

    /// Optional help document location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changelog: Vec<ChangelogEntry>,

    /// URL of the repository this entry was taken from, stamped by the registry
    #[serde(skip)]
    pub origin_repository: Option<String>,
}

impl Module {
    /// Whether the module lists `name` as a dependency
    pub fn depends_on(&self, name: &str) -> bool {
        self.dependencies.iter().any(|d| d == name)
    }

    /// Whether the module carries any changelog entries
    pub fn has_changelog(&self) -> bool {
        !self.changelog.is_empty()
    }

    /// Render the changelog as markdown, newest release first
    pub fn changelog_markdown(&self) -> String {
        if self.changelog.is_empty() {
            return String::new();
        }

        let mut entries: Vec<&ChangelogEntry> = self.changelog.iter().collect();
        entries.sort_by(|a, b| b.version.cmp(&a.version));

        let mut out = format!("# {}\n", self.display_name);
        for entry in entries {
            out.push_str(&format!("## {}\n\n", entry.version));
            let sections = [
                ("Additions", &entry.added),
                ("Fixes", &entry.fixed),
                ("Changes", &entry.changed),
                ("Removals", &entry.removed),
                ("Deprecations", &entry.deprecated),
            ];
            for (title, items) in sections {
                if items.is_empty() {
                    continue;
                }
                out.push_str(&format!("### {}\n", title));
                for item in items {
                    out.push_str(&format!("* {}\n", item));
                }
            }
        }
        out
    }
}

/// A repository manifest node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Repository {
    /// De-duplication key during graph traversal
    pub name: String,

    pub description: String,

    pub maintainer: String,

    pub is_beta_channel: bool,

    /// URLs of further repository manifests
    #[serde(rename = "Repositories")]
    pub sub_repository_urls: Vec<String>,

    pub modules: Vec<Module>,

    /// URL this manifest was fetched from
    #[serde(skip)]
    pub source_url: String,
}

impl Repository {
    /// Parse a manifest fetched from `url`
    ///
    /// Every field of the wire format except `Type`, `HelpUrl` and
    /// `Changelog` is required. A missing or mistyped field is an error for
    /// this manifest only.
    pub fn from_json(url: &str, content: &str) -> Result<Self, ManifestError> {
        let mut repo: Repository = serde_json::from_str(content)?;
        repo.validate()?;
        repo.source_url = url.to_string();
        Ok(repo)
    }

    /// Validate the parsed manifest
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::ValidationError(
                "Repository name cannot be empty".to_string(),
            ));
        }

        for module in &self.modules {
            if module.qualified_name.is_empty() {
                return Err(ManifestError::ValidationError(format!(
                    "Repository '{}' publishes a module with an empty qualified name",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a published module by qualified name
    pub fn module(&self, qualified_name: &str) -> Option<&Module> {
        self.modules
            .iter()
            .find(|m| m.qualified_name == qualified_name)
    }
}
