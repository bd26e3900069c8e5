//! blockfeed CLI — runs and maintains a blockfeed materialized-view server.
//!
//! # Commands
//! ```text
//! blockfeed server                 follow the upstream until Ctrl-C
//! blockfeed rollback <block_index> roll the views back to a processed block
//! blockfeed enmod <name>           enable a module
//! blockfeed dismod <name>          disable a module
//! blockfeed listmod                list modules and their state
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use blockfeed_core::config::Network;
use blockfeed_core::reorg::RollbackTarget;
use blockfeed_core::store::MaterializedStore;
use blockfeed_rpc::HttpClientConfig;
use blockfeed_storage::{InMemoryStore, SqliteStore};
use blockfeed_sync::views::apply_module_settings;
use blockfeed_sync::{default_registry, HttpUpstream, SyncLoop, SyncLoopBuilder};

mod logging;

use logging::{init_tracing, LogConfig};

/// Store location that selects the in-memory backend.
const MEMORY_STORE: &str = ":memory:";

#[derive(Parser)]
#[command(
    name = "blockfeed",
    about = "Materialized views over a protocol message feed",
    long_about = "
blockfeed follows an upstream protocol indexer block by block and folds its
message feed into queryable views (assets, balances, trades, stats), rolling
back on reorgs.
",
    version
)]
struct Cli {
    /// Network the upstream runs on: mainnet | testnet | regtest
    #[arg(long, global = true, default_value = "mainnet")]
    network: Network,

    /// Upstream JSON-RPC endpoint (defaults to the network's local API port)
    #[arg(long, global = true)]
    upstream_url: Option<String>,

    #[arg(long, global = true)]
    upstream_user: Option<String>,

    #[arg(long, global = true)]
    upstream_password: Option<String>,

    /// Timeout for each upstream call, in milliseconds
    #[arg(long, global = true, default_value_t = 30_000)]
    upstream_timeout_ms: u64,

    /// SQLite database path, or ":memory:" for a throwaway store
    #[arg(long, global = true, default_value = "blockfeed.db")]
    store: String,

    /// Wipe every view and reparse from the first block
    #[arg(long, global = true)]
    reparse: bool,

    /// Default log level (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Per-crate level override, e.g. `blockfeed_sync=debug` (repeatable)
    #[arg(long = "log-component", global = true, value_parser = parse_component)]
    log_components: Vec<(String, String)>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the upstream and keep the views current
    Server {
        /// Blocks fetched per round trip
        #[arg(long, default_value_t = 100)]
        prefetch: u64,
        /// Distance to the tip above which autopilot engages
        #[arg(long, default_value_t = 500)]
        autopilot_threshold: u64,
        /// Poll interval at the tip, in milliseconds
        #[arg(long, default_value_t = 5_000)]
        poll_interval_ms: u64,
    },

    /// Roll the views back to a processed block
    Rollback {
        block_index: u64,
    },

    /// Enable a module
    Enmod {
        name: String,
    },

    /// Disable a module
    Dismod {
        name: String,
    },

    /// List modules and whether they are enabled
    Listmod,
}

fn parse_component(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((component, level)) if !component.is_empty() && !level.is_empty() => {
            Ok((component.to_string(), level.to_string()))
        }
        _ => Err(format!("expected <component>=<level>, got '{s}'")),
    }
}

fn default_upstream_url(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "http://127.0.0.1:4000/api/",
        Network::Testnet => "http://127.0.0.1:14000/api/",
        Network::Regtest => "http://127.0.0.1:24000/api/",
    }
}

impl Cli {
    async fn open_store(&self) -> Result<Arc<dyn MaterializedStore>> {
        if self.store == MEMORY_STORE {
            tracing::warn!("using an in-memory store; views are lost on exit");
            return Ok(Arc::new(InMemoryStore::new()));
        }
        let store = SqliteStore::open(&self.store)
            .await
            .with_context(|| format!("failed to open store at {}", self.store))?;
        Ok(Arc::new(store))
    }

    fn upstream(&self) -> Result<HttpUpstream> {
        let url = self
            .upstream_url
            .clone()
            .unwrap_or_else(|| default_upstream_url(self.network).to_string());
        let basic_auth = match (&self.upstream_user, &self.upstream_password) {
            (Some(user), password) => Some((user.clone(), password.clone().unwrap_or_default())),
            (None, Some(_)) => bail!("--upstream-password needs --upstream-user"),
            (None, None) => None,
        };
        let config = HttpClientConfig {
            request_timeout: Duration::from_millis(self.upstream_timeout_ms),
            basic_auth,
        };
        HttpUpstream::connect(&url, config).with_context(|| format!("invalid upstream {url}"))
    }

    async fn sync_loop(&self, configure: impl FnOnce(SyncLoopBuilder) -> SyncLoopBuilder) -> Result<SyncLoop> {
        let store = self.open_store().await?;
        let upstream = self.upstream()?;
        tracing::info!(upstream = upstream.url(), store = %self.store, network = %self.network, "configured");

        let builder = SyncLoopBuilder::new()
            .network(self.network)
            .upstream_timeout_ms(self.upstream_timeout_ms)
            .reparse(self.reparse)
            .store(store)
            .upstream(Arc::new(upstream));
        Ok(configure(builder).build()?)
    }
}

async fn server(cli: &Cli, prefetch: u64, autopilot_threshold: u64, poll_interval_ms: u64) -> Result<()> {
    let mut sync = cli
        .sync_loop(|b| {
            b.prefetch_count(prefetch)
                .autopilot_threshold(autopilot_threshold)
                .poll_interval_ms(poll_interval_ms)
        })
        .await?;

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing the current block");
            let _ = stop.send(true);
        }
    });

    sync.run(shutdown).await.context("sync loop stopped on a fatal error")
}

async fn rollback(cli: &Cli, block_index: u64) -> Result<()> {
    let mut sync = cli.sync_loop(|b| b).await?;
    let report = sync
        .rollback(RollbackTarget::Block(block_index))
        .await
        .with_context(|| format!("rollback to block {block_index} failed"))?;
    println!(
        "rolled back to block {block_index}: {} blocks removed, {} assets restored, {} assets deleted",
        report.blocks_removed, report.assets_restored, report.assets_deleted
    );
    Ok(())
}

async fn set_module(cli: &Cli, name: &str, enabled: bool) -> Result<()> {
    let registry = default_registry(None);
    if !registry.modules().iter().any(|m| m.name == name) {
        let known: Vec<String> = registry.modules().into_iter().map(|m| m.name).collect();
        bail!("unknown module '{name}' (known: {})", dedup(known).join(", "));
    }
    let store = cli.open_store().await?;
    store.set_module_enabled(name, enabled).await?;
    println!("{name} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

async fn list_modules(cli: &Cli) -> Result<()> {
    let store = cli.open_store().await?;
    let mut registry = default_registry(None);
    let settings = store.module_settings().await?;
    for unknown in apply_module_settings(&mut registry, &settings) {
        println!("warning: stored setting for unknown module '{unknown}'");
    }

    println!("{:<20} {:<10} {:>8}  {}", "MODULE", "CHANNEL", "PRIORITY", "STATE");
    for module in registry.modules() {
        println!(
            "{:<20} {:<10} {:>8}  {}",
            module.name,
            module.channel,
            module.priority,
            if module.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}

fn dedup(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        components: LogConfig::default()
            .components
            .into_iter()
            .chain(cli.log_components.iter().cloned())
            .collect(),
        json: cli.log_json,
    });

    match &cli.command {
        Commands::Server {
            prefetch,
            autopilot_threshold,
            poll_interval_ms,
        } => server(&cli, *prefetch, *autopilot_threshold, *poll_interval_ms).await,
        Commands::Rollback { block_index } => rollback(&cli, *block_index).await,
        Commands::Enmod { name } => set_module(&cli, name, true).await,
        Commands::Dismod { name } => set_module(&cli, name, false).await,
        Commands::Listmod => list_modules(&cli).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "blockfeed",
            "rollback",
            "120",
            "--network",
            "testnet",
            "--store",
            ":memory:",
            "--log-component",
            "blockfeed_sync=debug",
        ])
        .unwrap();
        assert_eq!(cli.network, Network::Testnet);
        assert_eq!(cli.store, MEMORY_STORE);
        assert_eq!(cli.log_components, vec![("blockfeed_sync".into(), "debug".into())]);
        assert!(matches!(cli.command, Commands::Rollback { block_index: 120 }));
    }

    #[test]
    fn bad_component_is_rejected() {
        assert!(parse_component("nolevel").is_err());
        assert!(parse_component("=debug").is_err());
    }

    #[test]
    fn upstream_needs_user_with_password() {
        let cli = Cli::try_parse_from(["blockfeed", "listmod", "--upstream-password", "x"]).unwrap();
        assert!(cli.upstream().is_err());
    }
}
