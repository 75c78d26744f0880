//! sheetsync-cli: inspect and edit a sheetsync row-store from the terminal.
//!
//! Usage:
//!   sheetsync-cli workspaces
//!   sheetsync-cli rows <sheet-id>
//!   sheetsync-cli set <sheet-id> <row-id> status=Shortlisted
//!   sheetsync-cli --config sync.ron toggle <sheet-id> <rule-id> --off
//!
//! Every command goes through the same cache and optimistic write path a UI
//! would use, then prints what the cache holds afterwards.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sheetsync_client::types::{EntityId, FieldDelta, QueryKey};
use sheetsync_client::{DisabledTransport, SheetSync, SyncConfig};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "sheetsync-cli")]
#[command(about = "Inspect a sheetsync row-store through the client cache")]
struct Args {
    /// RON config file (defaults apply for anything it leaves out)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the row-store base URL
    #[arg(long)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List workspaces
    Workspaces,
    /// List the sheets of a workspace
    Sheets { workspace: String },
    /// List a sheet's rows
    Rows { sheet: String },
    /// List a sheet's automation rules
    Rules { sheet: String },
    /// Set cells on one row (optimistic)
    Set {
        sheet: String,
        row: String,
        /// Cells as column=value
        #[arg(required = true)]
        cells: Vec<String>,
    },
    /// Enable or disable an automation rule (optimistic)
    Toggle {
        sheet: String,
        rule: String,
        #[arg(long)]
        off: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(url) = args.api_url {
        config.api_url = url;
    }

    // The sync core is !Send; everything runs on one LocalSet.
    let local_set = tokio::task::LocalSet::new();
    local_set.run_until(run(config, args.command)).await
}

async fn run(config: SyncConfig, command: Command) -> Result<()> {
    // One-shot commands never open a push channel.
    let sync = SheetSync::with_http(config, Rc::new(DisabledTransport))?;

    let key = match command {
        Command::Workspaces => {
            sync.workspaces().await?;
            QueryKey::workspaces()
        }
        Command::Sheets { workspace } => {
            let workspace = EntityId::from(workspace);
            sync.sheets(&workspace).await?;
            QueryKey::sheets(workspace)
        }
        Command::Rows { sheet } => {
            let sheet = EntityId::from(sheet);
            for row in sync.rows(&sheet).await? {
                println!("{}\t{}", row.id, serde_json::Value::Object(row.data));
            }
            return Ok(());
        }
        Command::Rules { sheet } => {
            let sheet = EntityId::from(sheet);
            for rule in sync.agent_rules(&sheet).await? {
                let mark = if rule.enabled { "on " } else { "off" };
                println!(
                    "{}\t[{mark}] when {} = {} → {}",
                    rule.id, rule.trigger_column, rule.trigger_value, rule.action_type
                );
            }
            return Ok(());
        }
        Command::Set { sheet, row, cells } => {
            let sheet = EntityId::from(sheet);
            sync.rows(&sheet).await?;
            let delta = parse_cells(&cells)?;
            let outcome = sync.update_row(&sheet, &EntityId::from(row), delta).await?;
            tracing::info!(attempts = outcome.attempts, "row updated");
            QueryKey::rows(sheet)
        }
        Command::Toggle { sheet, rule, off } => {
            let sheet = EntityId::from(sheet);
            sync.agent_rules(&sheet).await?;
            sync.toggle_rule(&sheet, &EntityId::from(rule), !off).await?;
            QueryKey::agent_rules(sheet)
        }
    };

    print_cached(&sync, &key);
    Ok(())
}

fn parse_cells(cells: &[String]) -> Result<FieldDelta> {
    let mut pairs = Vec::with_capacity(cells.len());
    for cell in cells {
        let Some((column, value)) = cell.split_once('=') else {
            bail!("expected column=value, got {cell:?}");
        };
        pairs.push((column.to_string(), value.to_string()));
    }
    Ok(FieldDelta::row_data(pairs))
}

fn print_cached(sync: &SheetSync, key: &QueryKey) {
    let stale = sync.cache().borrow().is_stale(key);
    println!("# {key} ({})", if stale { "stale" } else { "fresh" });
    for record in sync.read(key).unwrap_or_default() {
        let fields = serde_json::Value::Object(record.fields);
        println!("{}\t{fields}", record.id);
    }
}
