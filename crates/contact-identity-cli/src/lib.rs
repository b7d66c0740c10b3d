//! Command-line front end for the contact identity store.
//!
//! [`run_cli`] executes a parsed [`Cli`] against the database named by
//! `--db` (or `DATABASE_URL`). Resolution output uses the same JSON shape as
//! `POST /api/identify`.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use contact_identity_core::{
    ContactId, IdentityView, IntegrityPolicy, NovelPairPolicy, ResolutionReport, ResolveOptions,
};
use contact_identity_store_sqlite::{
    database_path_from_url, IntegrityIssueSeverity, IntegrityReport, SqliteContactStore,
    StoreConfig,
};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "contacts")]
#[command(about = "Contact identity resolution CLI")]
pub struct Cli {
    /// `SQLite` path or `sqlite://` URL.
    #[arg(long, env = "DATABASE_URL", default_value = "./contacts.sqlite3")]
    db: String,

    #[arg(long, env = "INTEGRITY_POLICY", value_enum, default_value_t = IntegrityPolicyArg::Reject)]
    integrity_policy: IntegrityPolicyArg,

    #[arg(long, env = "NOVEL_PAIR_POLICY", value_enum, default_value_t = NovelPairsArg::Always)]
    novel_pairs: NovelPairsArg,

    #[arg(long, env = "IDENTIFY_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve an email and/or phone number into its contact cluster.
    Identify(IdentifyArgs),
    /// Print the cluster that contains a contact id.
    Show(ShowArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
pub struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone_number: Option<String>,
    /// Include what the call wrote.
    #[arg(long)]
    report: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    contact_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    SchemaVersion,
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum IntegrityPolicyArg {
    Reject,
    Repair,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum NovelPairsArg {
    Always,
    SkipOnMerge,
    Never,
}

#[derive(Debug, Serialize)]
struct IdentifyOutput<'a> {
    contact: &'a IdentityView,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a ResolutionReport>,
}

#[derive(Debug, Serialize)]
struct SchemaVersionOutput {
    schema_version: Option<i64>,
}

/// Installs the stderr log subscriber. `RUST_LOG` overrides the `warn` default.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

impl Cli {
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_attempts: self.max_attempts,
            resolve: ResolveOptions {
                integrity_policy: map_integrity_policy(self.integrity_policy),
                novel_pairs: map_novel_pairs(self.novel_pairs),
            },
            ..StoreConfig::default()
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when opening or migrating the database fails, when input
/// is invalid, or when the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let path = database_path_from_url(&cli.db);
    let store = SqliteContactStore::open(&path, cli.store_config())?;
    store.migrate()?;
    let outcome = run_command(cli.command, &store);
    store.close();
    outcome
}

/// Executes one command against an open, migrated store.
///
/// # Errors
/// Returns an error when the command fails or its output cannot be encoded.
pub fn run_command(command: Command, store: &SqliteContactStore) -> Result<()> {
    match command {
        Command::Identify(args) => {
            let resolution = store.identify(args.email.as_deref(), args.phone_number.as_deref())?;
            let output = IdentifyOutput {
                contact: &resolution.view,
                report: args.report.then_some(&resolution.report),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Show(args) => {
            let view = store
                .cluster(ContactId(args.contact_id))?
                .ok_or_else(|| anyhow!("contact {} not found", args.contact_id))?;
            let output = IdentifyOutput {
                contact: &view,
                report: None,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Db { command } => run_db(command, store),
    }
}

fn run_db(command: DbCommand, store: &SqliteContactStore) -> Result<()> {
    match command {
        DbCommand::Migrate => {
            // run_cli already migrated; report the resulting version.
            let schema_version = store.schema_version()?;
            println!("migrated schema_version={}", schema_version.unwrap_or_default());
            Ok(())
        }
        DbCommand::SchemaVersion => {
            let schema_version = store.schema_version()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&SchemaVersionOutput { schema_version })?
            );
            Ok(())
        }
        DbCommand::Check(args) => {
            let report = store.integrity_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_integrity_report(&report);
            }

            if !report.healthy {
                return Err(anyhow!(
                    "contact integrity check failed: {}",
                    report
                        .issues
                        .iter()
                        .filter(|issue| issue.severity == IntegrityIssueSeverity::Error)
                        .map(|issue| format!("{}:{}", issue.code, issue.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
    }
}

fn map_integrity_policy(value: IntegrityPolicyArg) -> IntegrityPolicy {
    match value {
        IntegrityPolicyArg::Reject => IntegrityPolicy::Reject,
        IntegrityPolicyArg::Repair => IntegrityPolicy::Repair,
    }
}

fn map_novel_pairs(value: NovelPairsArg) -> NovelPairPolicy {
    match value {
        NovelPairsArg::SkipOnMerge => NovelPairPolicy::SkipOnMerge,
        NovelPairsArg::Always => NovelPairPolicy::Always,
        NovelPairsArg::Never => NovelPairPolicy::Never,
    }
}

fn print_integrity_report(report: &IntegrityReport) {
    println!(
        "live_contacts={} primaries={} secondaries={}",
        report.live_contacts, report.primaries, report.secondaries
    );
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    for issue in &report.issues {
        let severity = match issue.severity {
            IntegrityIssueSeverity::Warning => "warning",
            IntegrityIssueSeverity::Error => "error",
        };
        let ids = issue
            .contact_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!("{severity} {}: {} [{ids}]", issue.code, issue.message);
    }
}
