#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use agent_driver::agent::{
    ActionHistoryRecord, ActionKind, ActionRequest, ActionResult, AgentDriver, CatalogEntry,
    CatalogQuery, CatalogSort, DriverError, HybridInfo, ReqwestTransport, RollbackTarget,
    SearchResult,
};
use agent_driver::config::{resolve_config_dir, Config};
use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const REPORT_SCHEMA_VERSION: u32 = 1;
const CONNECT_REPORT_TYPE: &str = "agent.connect";
const SEARCH_REPORT_TYPE: &str = "agent.search";
const CATALOG_REPORT_TYPE: &str = "agent.catalog";
const HISTORY_REPORT_TYPE: &str = "agent.history";
const ACTIONS_REPORT_TYPE: &str = "agent.actions";
const CONFIG_REPORT_TYPE: &str = "config.show";
const ERROR_REPORT_TYPE: &str = "error";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Drive a local updater agent: find it, take control, search and update products.
#[derive(Parser, Debug)]
#[command(name = "agent-driver")]
#[command(version)]
#[command(about = "Drive a local updater agent.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Emit structured JSON on stdout instead of text (logging is disabled)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover the agent, take control and push the backend configuration
    Connect,

    /// List installed products with their available updates and rollbacks
    Search {
        /// Only show products that have an update available
        #[arg(long)]
        updates_only: bool,
    },

    /// Browse the backend product catalog through the agent
    Catalog {
        /// Zero-based page number
        #[arg(long, default_value_t = 0)]
        page: u32,

        /// Sort key (name, date, version)
        #[arg(long, default_value = "name", value_parser = parse_sort)]
        sort: CatalogSort,

        /// Sort in descending order
        #[arg(long)]
        descending: bool,

        /// Free-text filter
        #[arg(long)]
        search: Option<String>,
    },

    /// Show the agent's action history
    History,

    /// Update products by name (all products with updates when none are given)
    Update { products: Vec<String> },

    /// Roll products back, as `name` or `name=version`
    #[command(long_about = "\
Roll products back to a previously installed version.

Each target is a product name, optionally followed by `=version`. Without a \
version the most recently installed rollback target is used, falling back \
to the first one the agent reports when install dates are missing.

Examples:
  agent-driver rollback editor
  agent-driver rollback editor=1.2.0 viewer")]
    Rollback {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Run an action given by name (update, rollback) on the listed targets
    Perform {
        action: String,
        targets: Vec<String>,
    },

    /// Inspect or edit the configuration file
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `agent-driver`.

Examples:
  source <(agent-driver completions bash)
  agent-driver completions zsh > ~/.zfunc/_agent-driver")]
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Set the update backend URL pushed to the agent
    SetBackend { url: String },
}

fn parse_sort(s: &str) -> std::result::Result<CatalogSort, String> {
    s.parse()
}

// ── Reports ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ConnectReport {
    schema_version: u32,
    report_type: &'static str,
    port: u16,
}

#[derive(Debug, Serialize)]
struct SearchReport {
    schema_version: u32,
    report_type: &'static str,
    products: Vec<SearchResult>,
}

#[derive(Debug, Serialize)]
struct CatalogReport {
    schema_version: u32,
    report_type: &'static str,
    page: u32,
    page_count: Option<i64>,
    entries: Vec<CatalogEntry>,
}

#[derive(Debug, Serialize)]
struct HistoryReport {
    schema_version: u32,
    report_type: &'static str,
    records: Vec<ActionHistoryRecord>,
}

#[derive(Debug, Serialize)]
struct ActionsReport {
    schema_version: u32,
    report_type: &'static str,
    action: ActionKind,
    results: Vec<ActionResult>,
}

#[derive(Debug, Serialize)]
struct ConfigReport<'a> {
    schema_version: u32,
    report_type: &'static str,
    config_path: String,
    config: &'a Config,
}

#[derive(Debug, Serialize)]
struct ErrorReport {
    schema_version: u32,
    report_type: &'static str,
    code: Option<u8>,
    error: String,
    message: String,
}

impl ErrorReport {
    fn from_error(error: &anyhow::Error) -> Self {
        let driver_error = error.downcast_ref::<DriverError>().copied();
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            report_type: ERROR_REPORT_TYPE,
            code: driver_error.map(DriverError::code),
            error: driver_error.map_or_else(|| "internal".to_string(), |e| e.slug().to_string()),
            message: format!("{error:#}"),
        }
    }
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    if !cli.json {
        // Logs stay on stderr to keep stdout payloads clean.
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .context("setting default subscriber failed")?;
    }

    let result = run(&cli).await;
    match result {
        Err(error) if cli.json => {
            print_json(&ErrorReport::from_error(&error))?;
            std::process::exit(1);
        }
        other => other,
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config_dir = resolve_config_dir(cli.config_dir.as_deref())?;
    let mut config = Config::load(&config_dir)?;
    let json = cli.json;

    match &cli.command {
        Commands::Connect => {
            let driver = connect(&config).await?;
            let port = driver.connection().map_or(0, |connection| connection.port());
            if json {
                print_json(&ConnectReport {
                    schema_version: REPORT_SCHEMA_VERSION,
                    report_type: CONNECT_REPORT_TYPE,
                    port,
                })?;
            } else {
                println!("Connected to the agent on port {port}");
            }
        }

        Commands::Search { updates_only } => {
            let driver = connect(&config).await?;
            let mut products = driver.search_products()?.await?;
            if *updates_only {
                products.retain(SearchResult::has_updates);
            }
            if json {
                print_json(&SearchReport {
                    schema_version: REPORT_SCHEMA_VERSION,
                    report_type: SEARCH_REPORT_TYPE,
                    products,
                })?;
            } else {
                print_products(&products);
            }
        }

        Commands::Catalog {
            page,
            sort,
            descending,
            search,
        } => {
            let driver = connect(&config).await?;
            let query = CatalogQuery {
                page: *page,
                sort: *sort,
                descending: *descending,
                search: search.clone(),
            };
            let catalog = driver.fetch_catalog(query)?.await?;
            if json {
                print_json(&CatalogReport {
                    schema_version: REPORT_SCHEMA_VERSION,
                    report_type: CATALOG_REPORT_TYPE,
                    page: *page,
                    page_count: catalog.page_count,
                    entries: catalog.entries,
                })?;
            } else {
                print_catalog(*page, catalog.page_count, &catalog.entries);
            }
        }

        Commands::History => {
            let driver = connect(&config).await?;
            let records = driver.fetch_history()?.await?;
            if json {
                print_json(&HistoryReport {
                    schema_version: REPORT_SCHEMA_VERSION,
                    report_type: HISTORY_REPORT_TYPE,
                    records,
                })?;
            } else if records.is_empty() {
                println!("No actions recorded yet.");
            } else {
                for record in &records {
                    let when = record.performed_at().map_or_else(
                        || "unknown date".to_string(),
                        |at| at.format("%Y-%m-%d %H:%M").to_string(),
                    );
                    let outcome = record
                        .status
                        .map_or_else(|| "unknown".to_string(), |status| status.to_string());
                    println!(
                        "{when}  {}  {} -> {}  [{outcome}]",
                        record.product_name, record.previous_version, record.target_version
                    );
                }
            }
        }

        Commands::Update { products } => {
            run_actions(&config, ActionKind::Update, products, json).await?;
        }

        Commands::Rollback { targets } => {
            run_actions(&config, ActionKind::Rollback, targets, json).await?;
        }

        Commands::Perform { action, targets } => {
            let kind: ActionKind = action.parse()?;
            run_actions(&config, kind, targets, json).await?;
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                if json {
                    print_json(&ConfigReport {
                        schema_version: REPORT_SCHEMA_VERSION,
                        report_type: CONFIG_REPORT_TYPE,
                        config_path: config.config_path().display().to_string(),
                        config: &config,
                    })?;
                } else {
                    println!("# {}", config.config_path().display());
                    print!("{}", toml::to_string_pretty(&config)?);
                }
            }
            ConfigCommands::SetBackend { url } => {
                config.backend.url = Some(url.trim().to_string());
                config.save()?;
                info!(path = %config.config_path().display(), "backend URL saved");
                if !json {
                    println!("Backend set to {}", url.trim());
                }
            }
        },

        Commands::Completions { shell } => {
            write_shell_completion(*shell, &mut std::io::stdout().lock())?;
        }
    }

    Ok(())
}

// ── Helper functions ────────────────────────────────────────────

/// Opens a session with the configured backend. Fails fast without one.
async fn connect(config: &Config) -> Result<AgentDriver> {
    let backend_url = config
        .backend_url()
        .ok_or(DriverError::NotConfigured)?
        .to_string();
    let transport = ReqwestTransport::new(config.agent.host.clone())?;
    let driver = AgentDriver::new(
        config.driver_settings(),
        Arc::new(transport),
        config.key_store(),
    );
    driver.open_connection(Some(backend_url))?.await?;
    Ok(driver)
}

async fn run_actions(
    config: &Config,
    kind: ActionKind,
    targets: &[String],
    json: bool,
) -> Result<()> {
    let driver = connect(config).await?;
    let products = driver.search_products()?.await?;
    let request = match kind {
        ActionKind::Update => ActionRequest::Update(select_updates(&products, targets)?),
        ActionKind::Rollback => ActionRequest::Rollback(select_rollbacks(&products, targets)?),
    };

    let empty = match &request {
        ActionRequest::Update(indices) => indices.is_empty(),
        ActionRequest::Rollback(selected) => selected.is_empty(),
    };
    let results = if empty {
        warn!(action = kind.as_str(), "nothing to do");
        Vec::new()
    } else {
        driver.perform_actions(request)?.await?
    };

    if json {
        print_json(&ActionsReport {
            schema_version: REPORT_SCHEMA_VERSION,
            report_type: ACTIONS_REPORT_TYPE,
            action: kind,
            results,
        })?;
    } else if results.is_empty() {
        println!("Nothing to {}.", kind.as_str());
    } else {
        for result in &results {
            println!("{}: {}", result.product.product_name, result.outcome);
        }
    }
    Ok(())
}

fn find_product(products: &[SearchResult], name: &str) -> Result<usize> {
    products
        .iter()
        .position(|product| product.product_name == name)
        .with_context(|| format!("no installed product named {name:?}"))
}

/// Cache indices to update; every product with an update when `names` is empty.
fn select_updates(products: &[SearchResult], names: &[String]) -> Result<Vec<usize>> {
    if names.is_empty() {
        return Ok(products
            .iter()
            .enumerate()
            .filter(|(_, product)| product.has_updates())
            .map(|(index, _)| index)
            .collect());
    }

    names
        .iter()
        .map(|name| -> Result<usize> {
            let index = find_product(products, name)?;
            if !products[index].has_updates() {
                bail!("{name} has no update available");
            }
            Ok(index)
        })
        .collect()
}

fn select_rollbacks(products: &[SearchResult], targets: &[String]) -> Result<Vec<RollbackTarget>> {
    targets
        .iter()
        .map(|target| -> Result<RollbackTarget> {
            let (name, version) = match target.split_once('=') {
                Some((name, version)) => (name, Some(version)),
                None => (target.as_str(), None),
            };
            let index = find_product(products, name)?;
            let mut candidates = products[index].rollback_targets();
            let chosen = match version {
                Some(version) => candidates.find(|hybrid| hybrid.version_name == version),
                None => candidates.fold(None, |best: Option<&HybridInfo>, hybrid| match best {
                    Some(best) if best.install_date >= hybrid.install_date => Some(best),
                    _ => Some(hybrid),
                }),
            };
            match chosen {
                Some(hybrid) => Ok(RollbackTarget {
                    index,
                    version: hybrid.clone(),
                }),
                None => bail!("{name} has no matching rollback version"),
            }
        })
        .collect()
}

fn print_products(products: &[SearchResult]) {
    if products.is_empty() {
        println!("No products found.");
        return;
    }
    for product in products {
        println!(
            "{} {} ({})",
            product.product_name, product.current_version, product.install_path
        );
        for update in product.updates() {
            println!("  update available: {}", update.version_name);
        }
        for rollback in product.rollback_targets() {
            println!("  rollback to: {}", rollback.version_name);
        }
    }
}

fn print_catalog(page: u32, page_count: Option<i64>, entries: &[CatalogEntry]) {
    match page_count {
        Some(count) => println!("Page {} of {count}", page + 1),
        None => println!("Page {}", page + 1),
    }
    for entry in entries {
        let released = entry.released_at().map_or_else(String::new, |at| {
            format!(" released {}", at.format("%Y-%m-%d"))
        });
        println!("  {} {}{released}", entry.product_name, entry.version);
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
