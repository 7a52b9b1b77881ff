//! MyDB journal tool
//!
//! Operator entry point for creating, updating and inspecting transaction journals.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use mydb_core::{Config, DbError, TransactionLog, TransactionStatus, Xid};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{filter::EnvFilter, fmt};

/// mydb - manage MyDB transaction journals
#[derive(Debug, Parser)]
#[command(name = "mydb", version)]
struct Cli {
    /// Configuration file (JSON); MYDB_CONFIG overrides it
    #[arg(long, default_value = "mydb.json")]
    config: PathBuf,

    /// Journal base path; the file on disk is <JOURNAL>.xid
    #[arg(long, global = true)]
    journal: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new, empty journal
    Create,
    /// Start a transaction and print its xid
    Begin,
    /// Mark a transaction as committed
    Commit { xid: u64 },
    /// Mark a transaction as aborted
    Abort { xid: u64 },
    /// Print the status of a transaction
    Status { xid: u64 },
    /// Run the integrity check
    Check,
    /// List the most recent transactions
    Inspect {
        /// Number of rows to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if is_fatal(&e) {
                eprintln!("{} {:#}", "Fatal:".bright_red().bold(), e);
            } else {
                eprintln!("{} {:#}", "Error:".bright_red(), e);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load_from_path(&cli.config).context("Failed to load configuration")?;
    let base = cli.journal.unwrap_or_else(|| config.journal_base());

    match cli.command {
        Command::Create => {
            if let Some(parent) = base.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let log = TransactionLog::create(&base)
                .with_context(|| format!("Failed to create journal {}", base.display()))?;
            println!(
                "{} {}",
                "Created".bright_green(),
                log.path().display().to_string().bright_cyan()
            );
            log.close()?;
        }
        Command::Begin => {
            let log = open_journal(&base)?;
            let xid = log.begin()?;
            println!("{xid}");
            log.close()?;
        }
        Command::Commit { xid } => {
            let log = open_journal(&base)?;
            log.commit(Xid::from(xid))?;
            println!("{} {}", "Committed".bright_green(), xid);
            log.close()?;
        }
        Command::Abort { xid } => {
            let log = open_journal(&base)?;
            log.abort(Xid::from(xid))?;
            println!("{} {}", "Aborted".bright_yellow(), xid);
            log.close()?;
        }
        Command::Status { xid } => {
            let log = open_journal(&base)?;
            let xid = Xid::from(xid);
            if xid.is_super() {
                println!("{} {}", xid, "super (no transaction)".bright_blue());
            } else {
                println!("{} {}", xid, paint(log.status(xid)?));
            }
            log.close()?;
        }
        Command::Check => {
            let log = open_journal(&base)?;
            println!(
                "{} {} (last xid {})",
                "OK".bright_green(),
                log.path().display().to_string().bright_cyan(),
                log.last_xid()
            );
            log.close()?;
        }
        Command::Inspect { limit } => {
            let log = open_journal(&base)?;
            let rows = log.scan()?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL).set_header(vec!["xid", "status"]);
            for (xid, status) in rows.iter().skip(rows.len().saturating_sub(limit)) {
                table.add_row(vec![xid.to_string(), status.to_string()]);
            }
            println!("{table}");

            let count = |wanted: TransactionStatus| rows.iter().filter(|(_, s)| *s == wanted).count();
            println!(
                "{} transactions: {} {}, {} {}, {} {}",
                rows.len(),
                count(TransactionStatus::Active),
                paint(TransactionStatus::Active),
                count(TransactionStatus::Committed),
                paint(TransactionStatus::Committed),
                count(TransactionStatus::Aborted),
                paint(TransactionStatus::Aborted),
            );
            log.close()?;
        }
    }

    Ok(())
}

/// Whether the error chain carries a storage error the journal cannot recover from
fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DbError>().is_some_and(DbError::is_fatal)
}

fn open_journal(base: &Path) -> Result<TransactionLog> {
    TransactionLog::open(base).with_context(|| format!("Failed to open journal {}", base.display()))
}

fn paint(status: TransactionStatus) -> ColoredString {
    let name = status.to_string();
    match status {
        TransactionStatus::Active => name.bright_yellow(),
        TransactionStatus::Committed => name.bright_green(),
        TransactionStatus::Aborted => name.bright_red(),
    }
}
