//! Script Package Manager (scriptpm)

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use script_pm::{
    CancellationToken, Config, FsStorage, HttpFetcher, InstallationResult, Module,
    PackageManager, RefreshSummary,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scriptpm")]
#[command(about = "Package manager for host application scripts", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.scriptpm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve all repositories and report what was found
    Refresh,
    /// Search the catalog
    List {
        /// Text to match against names, descriptions and tags
        query: Option<String>,
        /// Include beta-channel modules
        #[arg(long)]
        beta: bool,
    },
    /// List catalog modules that are not installed
    Available,
    /// List installed modules
    Installed,
    /// Install a module and its dependencies
    Install {
        /// Qualified name
        name: String,
    },
    /// Uninstall a module
    Uninstall {
        /// Qualified name
        name: String,
    },
    /// Update one installed module
    Update {
        /// Qualified name
        name: String,
    },
    /// Update every outdated module
    UpdateAll,
    /// List installed modules with a newer version available
    Outdated,
    /// Show a module changelog
    Changelog {
        /// Qualified name
        name: String,
    },
    /// Manage repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Add a repository URL
    Add {
        /// Manifest URL
        url: String,
    },
    /// Remove a repository by name
    Remove {
        /// Repository name
        name: String,
    },
    /// List resolved repositories
    List,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_manager(config: &Config) -> anyhow::Result<PackageManager> {
    let fetcher = HttpFetcher::with_limits(
        config.request_timeout(),
        config.connect_timeout(),
        config.max_content_size,
    )
    .context("Failed to create HTTP client")?;
    let scripts_dir = config.scripts_dir()?;
    let storage = FsStorage::open(&scripts_dir)
        .with_context(|| format!("Failed to open scripts directory {}", scripts_dir.display()))?;

    let manager = PackageManager::open(Arc::new(fetcher), Arc::new(storage))?
        .with_workers(config.workers);
    Ok(manager)
}

/// Warnings worth showing after a refresh
fn refresh_warnings(summary: &RefreshSummary) -> Vec<String> {
    let mut warnings: Vec<String> = summary.failures().map(|f| f.to_string()).collect();
    for conflict in &summary.conflicts {
        warnings.push(format!(
            "{} is published by more than one repository, using {}",
            conflict.qualified_name,
            conflict.kept_repository.as_deref().unwrap_or("?")
        ));
    }
    warnings
}

fn refresh(manager: &PackageManager, config: &Config, cancel: &CancellationToken) -> RefreshSummary {
    let summary = manager.refresh(&config.root_urls(), cancel);
    for warning in refresh_warnings(&summary) {
        eprintln!("warning: {}", warning);
    }
    summary
}

fn print_module(module: &Module) {
    let beta = if module.is_beta_channel { " [beta]" } else { "" };
    println!(
        "{:<40} {:>8}  {}{}",
        module.qualified_name, module.version, module.display_name, beta
    );
}

const RELOAD_HINT: &str = "Scripts changed; reload scripts in the host to apply.";

/// Lines to print for a successful operation
fn success_lines(action: &str, name: &str, scripts_changed: bool) -> Vec<String> {
    let mut lines = vec![format!("{} {}: done", action, name)];
    if scripts_changed {
        lines.push(RELOAD_HINT.to_string());
    }
    lines
}

/// Print a single result; returns an error for failures so the exit code is non-zero
fn report(
    action: &str,
    name: &str,
    result: InstallationResult,
    scripts_changed: bool,
) -> anyhow::Result<()> {
    if !result.is_success() {
        bail!("{} {}: {}", action, name, result)
    }
    for line in success_lines(action, name, scripts_changed) {
        println!("{}", line);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let manager = open_manager(&config)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Refresh => {
            let summary = refresh(&manager, &config, &cancel);
            println!(
                "{} repositories, {} modules",
                summary.repositories, summary.modules
            );
        }
        Commands::List { query, beta } => {
            refresh(&manager, &config, &cancel);
            let catalog = manager.catalog();
            for module in catalog.search(query.as_deref().unwrap_or(""), beta) {
                print_module(module);
            }
        }
        Commands::Available => {
            refresh(&manager, &config, &cancel);
            for module in manager.available_to_install() {
                print_module(&module);
            }
        }
        Commands::Installed => {
            for module in manager.installed().iter() {
                println!(
                    "{:<40} {:>8}  {}",
                    module.qualified_name, module.version, module.display_name
                );
            }
        }
        Commands::Install { name } => {
            refresh(&manager, &config, &cancel);
            report("install", &name, manager.install_by_name(&name, &cancel), true)?;
        }
        Commands::Uninstall { name } => {
            report("uninstall", &name, manager.uninstall(&name), true)?;
        }
        Commands::Update { name } => {
            refresh(&manager, &config, &cancel);
            report("update", &name, manager.update(&name, &cancel), true)?;
        }
        Commands::UpdateAll => {
            refresh(&manager, &config, &cancel);
            let update = manager.update_all(&cancel);
            for outcome in &update.results {
                println!("{:<40} {}", outcome.qualified_name, outcome.result);
            }
            if update.results.is_empty() {
                println!("Everything is up to date.");
            }
            if update.requires_reload() {
                println!("{}", RELOAD_HINT);
            }
            if let Some(failure) = update.first_failure() {
                bail!("{} update(s) failed: {}", update.failed().count(), failure);
            }
        }
        Commands::Outdated => {
            refresh(&manager, &config, &cancel);
            for latest in manager.update_candidates() {
                let installed = manager
                    .installed_module(&latest.qualified_name)
                    .map(|m| m.version.to_string())
                    .unwrap_or_default();
                println!(
                    "{:<40} {:>8} -> {}",
                    latest.qualified_name, installed, latest.version
                );
            }
        }
        Commands::Changelog { name } => {
            refresh(&manager, &config, &cancel);
            let Some(module) = manager.module(&name) else {
                bail!("{} is not in any repository", name);
            };
            if module.has_changelog() {
                print!("{}", module.changelog_markdown());
            } else {
                println!("{} has no changelog", name);
            }
        }
        Commands::Repo { command } => match command {
            RepoCommands::Add { url } => {
                refresh(&manager, &config, &cancel);
                match manager.add_repository(&url, &cancel) {
                    InstallationResult::Success => {
                        config.add_repository_url(&url);
                        config.save(&config_path)?;
                        println!("Added repository {}", url);
                    }
                    InstallationResult::AlreadyInstalled => {
                        bail!("Repository {} is already present", url)
                    }
                    other => bail!("Could not add repository {}: {}", url, other),
                }
            }
            RepoCommands::Remove { name } => {
                refresh(&manager, &config, &cancel);
                let url = manager
                    .repositories()
                    .into_iter()
                    .find(|r| r.name == name)
                    .map(|r| r.source_url);
                let Some(url) = url else {
                    bail!("No repository named '{}'", name);
                };
                if !config.remove_repository_url(&url) {
                    bail!(
                        "Repository '{}' is not a configured root and cannot be removed",
                        name
                    );
                }
                config.save(&config_path)?;
                report(
                    "remove repository",
                    &name,
                    manager.remove_repository(&name),
                    false,
                )?;
            }
            RepoCommands::List => {
                refresh(&manager, &config, &cancel);
                for repo in manager.repositories() {
                    let beta = if repo.is_beta_channel { " [beta]" } else { "" };
                    println!(
                        "{:<30} {:>4} modules  {}{}",
                        repo.name,
                        repo.modules.len(),
                        repo.source_url,
                        beta
                    );
                }
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_pm::CatalogConflict;

    #[test]
    fn test_refresh_warnings_include_conflicts() {
        let summary = RefreshSummary {
            repositories: 2,
            modules: 1,
            diagnostics: vec![],
            conflicts: vec![CatalogConflict {
                qualified_name: "demo.a".to_string(),
                kept_repository: Some("https://repo.test/base.json".to_string()),
                ignored_repository: Some("https://repo.test/fork.json".to_string()),
            }],
        };
        let warnings = refresh_warnings(&summary);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("demo.a is published by more than one repository"));
        assert!(warnings[0].ends_with("https://repo.test/base.json"));
    }

    #[test]
    fn test_reload_hint_only_when_scripts_change() {
        assert_eq!(
            success_lines("install", "demo.a", true),
            vec!["install demo.a: done".to_string(), RELOAD_HINT.to_string()]
        );
        assert_eq!(
            success_lines("remove repository", "Extra", false),
            vec!["remove repository Extra: done".to_string()]
        );
    }

    #[test]
    fn test_report_failure_is_error() {
        assert!(report("install", "demo.a", InstallationResult::DownloadFailed, true).is_err());
        assert!(report("remove repository", "Extra", InstallationResult::Success, false).is_ok());
    }
}
