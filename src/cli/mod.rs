use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use crate::application::{Collaborators, CommandContext, TransactionEngine};
use crate::collaborators::{StaticDirectory, TracingNotifier};
use crate::config::Settings;
use crate::domain::{
    Actor, HistoryEntry, RequestId, Resolution, ServiceRequest, UserId, format_credits,
    format_duration, parse_credits,
};

/// Mutua - community time-credit exchange
#[derive(Parser)]
#[command(name = "mutua")]
#[command(about = "Credit ledger and request lifecycle engine for a community service exchange")]
#[command(version)]
pub struct Cli {
    /// Database file path (overrides the configuration)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Configuration file (defaults to ./mutua.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// User directory JSON file (overrides the configuration)
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Mint credits for a member (issued as the system)
    Grant {
        /// Member ID
        user: String,

        /// Amount in credits (e.g., "10" or "2.50")
        amount: String,

        /// Idempotency key (a fresh one is generated when omitted)
        #[arg(long)]
        key: Option<String>,
    },

    /// Service request commands
    #[command(subcommand)]
    Request(RequestCommands),

    /// Show balance for a member or all members
    Balance {
        /// Member ID (omit for all members)
        user: Option<String>,
    },

    /// List transaction records
    Transactions {
        /// Only records involving this member
        #[arg(long)]
        user: Option<String>,

        /// Maximum number of records to show (most recent)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Verify ledger integrity
    Check,

    /// Cancel requests that timed out
    Sweep,

    /// Export data to CSV or JSON
    Export {
        /// What to export: transactions, balances, requests, full
        #[arg(default_value = "transactions")]
        export_type: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Who runs a mutating command and under which key.
#[derive(Args, Clone)]
pub struct CommandArgs {
    /// Acting member ID, or "system"
    #[arg(long = "as", value_name = "USER")]
    pub actor: String,

    /// Idempotency key (a fresh one is generated when omitted)
    #[arg(long)]
    pub key: Option<String>,

    /// Reason recorded in the request history
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Subcommand)]
pub enum RequestCommands {
    /// Create a new request; the acting member is the requester
    Create {
        /// Service type (e.g., "tutoring")
        service_type: String,

        /// Price in credits
        amount: String,

        /// Description of the request
        #[arg(short, long)]
        description: Option<String>,

        #[command(flatten)]
        command: CommandArgs,
    },

    /// Match a request with a provider (best ranked unless --provider is given)
    Match {
        /// Request ID
        id: String,

        /// Provider chosen by the requester
        #[arg(long)]
        provider: Option<String>,

        #[command(flatten)]
        command: CommandArgs,
    },

    /// Accept a matched request (provider)
    Accept {
        id: String,
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Decline a matched request (provider)
    Decline {
        id: String,
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Start work on an accepted request (provider)
    Start {
        id: String,
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Confirm a request was delivered (requester)
    Complete {
        id: String,
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Cancel a request
    Cancel {
        id: String,
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Dispute a request in progress
    Dispute {
        id: String,
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Resolve a disputed request (arbiter)
    Resolve {
        id: String,

        /// Outcome: completed or cancelled
        outcome: String,

        #[command(flatten)]
        command: CommandArgs,
    },

    /// Show a request
    Show { id: String },

    /// Show the state history of a request
    History { id: String },

    /// List requests
    List {
        /// Only requests where this member is a party
        #[arg(long)]
        user: Option<String>,
    },
}

impl Cli {
    /// Load settings for this invocation.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(database) = &self.database {
            settings.database.path = database.clone();
        }
        if let Some(directory) = &self.directory {
            settings.directory.path = directory.display().to_string();
        }
        Ok(settings)
    }

    async fn sweep_before_command(&self, engine: &TransactionEngine) -> Result<()> {
        let report = engine.sweep_expired(Utc::now()).await?;

        if self.verbose && !report.cancelled.is_empty() {
            eprintln!("[Sweep] Cancelled {} timed-out request(s)", report.cancelled.len());
            for id in &report.cancelled {
                eprintln!("  {}", id);
            }
        }
        Ok(())
    }

    pub async fn run(self, settings: Settings) -> Result<()> {
        let database = settings.database.path.clone();

        if matches!(self.command, Commands::Init) {
            let engine = TransactionEngine::init(
                &database,
                collaborators(&settings)?,
                settings.engine_config(),
            )
            .await?;
            engine.close().await;
            println!("Database initialized: {}", database);
            return Ok(());
        }

        let engine =
            TransactionEngine::connect(&database, collaborators(&settings)?, settings.engine_config())
                .await
                .with_context(|| format!("Failed to open {}. Run 'mutua init' first", database))?;

        // Timed-out requests are cancelled before any command sees them
        if !matches!(self.command, Commands::Sweep) {
            let _ = self.sweep_before_command(&engine).await;
        }

        match self.command {
            Commands::Init => {}

            Commands::Grant { user, amount, key } => {
                let user_id = parse_user(&user)?;
                let amount = parse_amount(&amount)?;
                let ctx = context(Actor::System, key, None);

                let record = engine.grant_credits(&ctx, user_id, amount).await?;
                println!(
                    "Granted {} credits to {} (#{})",
                    format_credits(record.amount),
                    user_id,
                    record.sequence
                );
            }

            Commands::Request(cmd) => run_request_command(&engine, cmd).await?,

            Commands::Balance { user } => run_balance_command(&engine, user).await?,

            Commands::Transactions { user, limit } => {
                run_transactions_command(&engine, user, limit).await?
            }

            Commands::Check => run_check_command(&engine).await?,

            Commands::Sweep => {
                let report = engine.sweep_expired(Utc::now()).await?;
                println!(
                    "Cancelled {} request(s), skipped {}, failed {}",
                    report.cancelled.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
                for id in &report.cancelled {
                    println!("  {}", id);
                }
            }

            Commands::Export {
                export_type,
                output,
            } => run_export_command(&engine, &export_type, output.as_deref()).await?,
        }

        engine.close().await;
        Ok(())
    }
}

fn collaborators(settings: &Settings) -> Result<Collaborators> {
    let path = Path::new(&settings.directory.path);
    let directory = if path.exists() {
        StaticDirectory::load(path)?
    } else {
        tracing::warn!(path = %path.display(), "user directory not found, starting empty");
        StaticDirectory::new()
    };

    Ok(Collaborators {
        directory: Arc::new(directory),
        notifier: Arc::new(TracingNotifier),
        arbitration: Arc::new(settings.arbiter_roster()),
    })
}

fn context(actor: Actor, key: Option<String>, reason: Option<String>) -> CommandContext {
    let mut ctx = match key {
        Some(key) => CommandContext::new(key, actor),
        None => CommandContext::fresh(actor),
    };
    ctx.reason = reason;
    ctx
}

fn command_context(args: CommandArgs) -> Result<CommandContext> {
    let actor = Actor::parse(&args.actor)
        .with_context(|| format!("Invalid actor '{}'. Use a member ID or 'system'", args.actor))?;
    Ok(context(actor, args.key, args.reason))
}

fn parse_user(input: &str) -> Result<UserId> {
    Uuid::parse_str(input).with_context(|| format!("Invalid member ID: {}", input))
}

fn parse_request_id(input: &str) -> Result<RequestId> {
    Uuid::parse_str(input).with_context(|| format!("Invalid request ID: {}", input))
}

fn parse_amount(input: &str) -> Result<i64> {
    parse_credits(input).context("Invalid amount format. Use '5.00' or '5'")
}

async fn run_request_command(engine: &TransactionEngine, cmd: RequestCommands) -> Result<()> {
    let request = match cmd {
        RequestCommands::Create {
            service_type,
            amount,
            description,
            command,
        } => {
            let amount = parse_amount(&amount)?;
            let ctx = command_context(command)?;
            engine
                .create_request(&ctx, &service_type, amount, description)
                .await?
        }

        RequestCommands::Match {
            id,
            provider,
            command,
        } => {
            let provider = provider.as_deref().map(parse_user).transpose()?;
            let ctx = command_context(command)?;
            engine
                .match_request(&ctx, parse_request_id(&id)?, provider)
                .await?
        }

        RequestCommands::Accept { id, command } => {
            let ctx = command_context(command)?;
            engine.accept_request(&ctx, parse_request_id(&id)?).await?
        }

        RequestCommands::Decline { id, command } => {
            let ctx = command_context(command)?;
            engine.decline_request(&ctx, parse_request_id(&id)?).await?
        }

        RequestCommands::Start { id, command } => {
            let ctx = command_context(command)?;
            engine.start_request(&ctx, parse_request_id(&id)?).await?
        }

        RequestCommands::Complete { id, command } => {
            let ctx = command_context(command)?;
            engine.complete_request(&ctx, parse_request_id(&id)?).await?
        }

        RequestCommands::Cancel { id, command } => {
            let ctx = command_context(command)?;
            engine.cancel_request(&ctx, parse_request_id(&id)?).await?
        }

        RequestCommands::Dispute { id, command } => {
            let ctx = command_context(command)?;
            engine.dispute_request(&ctx, parse_request_id(&id)?).await?
        }

        RequestCommands::Resolve {
            id,
            outcome,
            command,
        } => {
            let resolution = Resolution::from_str(&outcome).with_context(|| {
                format!("Invalid outcome '{}'. Use completed or cancelled", outcome)
            })?;
            let ctx = command_context(command)?;
            engine
                .resolve_dispute(&ctx, parse_request_id(&id)?, resolution)
                .await?
        }

        RequestCommands::Show { id } => {
            let request_id = parse_request_id(&id)?;
            let request = engine.get_request(request_id).await?;
            print_request(&request);

            let records = engine.request_transactions(request_id).await?;
            if !records.is_empty() {
                println!("\nLedger:");
                for record in &records {
                    println!(
                        "  #{:<5} {:<9} {:>8}  {}",
                        record.sequence,
                        record.kind,
                        format_credits(record.amount),
                        record.recorded_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            return Ok(());
        }

        RequestCommands::History { id } => {
            let history = engine.get_history(parse_request_id(&id)?).await?;
            print_history(&history);
            return Ok(());
        }

        RequestCommands::List { user } => {
            let user = user.as_deref().map(parse_user).transpose()?;
            let requests = engine.list_requests(user).await?;
            print_request_list(&requests);
            return Ok(());
        }
    };

    print_request(&request);
    Ok(())
}

fn print_request(request: &ServiceRequest) {
    println!("Request:      {}", request.id);
    println!("State:        {}", request.state);
    println!("Service:      {}", request.service_type);
    println!(
        "Amount:       {} ({})",
        format_credits(request.amount),
        format_duration(request.amount)
    );
    println!("Requester:    {}", request.requester_id);
    println!(
        "Provider:     {}",
        request
            .provider_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(desc) = &request.description {
        println!("Description:  {}", desc);
    }
    println!(
        "Updated:      {}",
        request.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_request_list(requests: &[ServiceRequest]) {
    if requests.is_empty() {
        println!("No requests found.");
        return;
    }

    println!(
        "{:<36} {:<12} {:>8} {:<16} UPDATED",
        "ID", "STATE", "AMOUNT", "SERVICE"
    );
    println!("{}", "-".repeat(90));
    for request in requests {
        println!(
            "{:<36} {:<12} {:>8} {:<16} {}",
            request.id,
            request.state,
            format_credits(request.amount),
            truncate(&request.service_type, 16),
            request.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn print_history(history: &[HistoryEntry]) {
    println!("{:<4} {:<20} {:<24} {:<44} REASON", "#", "WHEN", "TRANSITION", "ACTOR");
    println!("{}", "-".repeat(100));
    for entry in history {
        let transition = match entry.from_state {
            Some(from) => format!("{} -> {}", from, entry.to_state),
            None => format!("-> {}", entry.to_state),
        };
        println!(
            "{:<4} {:<20} {:<24} {:<44} {}",
            entry.position,
            entry.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            transition,
            entry.actor,
            entry.reason.as_deref().unwrap_or("")
        );
    }
}

async fn run_balance_command(engine: &TransactionEngine, user: Option<String>) -> Result<()> {
    match user {
        Some(user) => {
            let balance = engine.get_balance(parse_user(&user)?).await?;
            println!(
                "{}: {} available, {} reserved",
                balance.user_id,
                format_credits(balance.available),
                format_credits(balance.reserved)
            );
        }
        None => {
            let balances = engine.list_balances().await?;
            if balances.is_empty() {
                println!("No balances found.");
            } else {
                println!("{:<36} {:>12} {:>12}", "MEMBER", "AVAILABLE", "RESERVED");
                println!("{}", "-".repeat(62));
                for balance in balances {
                    println!(
                        "{:<36} {:>12} {:>12}",
                        balance.user_id,
                        format_credits(balance.available),
                        format_credits(balance.reserved)
                    );
                }
            }
        }
    }
    Ok(())
}

async fn run_transactions_command(
    engine: &TransactionEngine,
    user: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let user = user.as_deref().map(parse_user).transpose()?;
    let records = engine.list_transactions(user).await?;

    if records.is_empty() {
        println!("No transactions found.");
        return Ok(());
    }

    let skip = limit.map_or(0, |limit| records.len().saturating_sub(limit));

    println!(
        "{:>5} {:<17} {:<9} {:>8} {:<10} {:<10} REQUEST",
        "SEQ", "DATE", "KIND", "AMOUNT", "FROM", "TO"
    );
    println!("{}", "-".repeat(80));
    for record in records.iter().skip(skip) {
        let from = record
            .from_user
            .map(|id| short_id(&id))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5} {:<17} {:<9} {:>8} {:<10} {:<10} {}",
            record.sequence,
            record.recorded_at.format("%Y-%m-%d %H:%M"),
            record.kind,
            format_credits(record.amount),
            from,
            short_id(&record.to_user),
            record
                .request_id
                .map(|id| id.to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_check_command(engine: &TransactionEngine) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = engine.check_integrity().await?;

    println!("Balances:     {}", report.balance_count);
    println!("Transactions: {}", report.transaction_count);
    println!("Granted:      {}", format_credits(report.total_granted));
    println!("Reserved:     {}", format_credits(report.total_held));
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

async fn run_export_command(
    engine: &TransactionEngine,
    export_type: &str,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{Write, stdout};

    let exporter = Exporter::new(engine);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    let summary = match export_type {
        "transactions" => format!(
            "Exported {} transactions",
            exporter.export_transactions_csv(writer).await?
        ),
        "balances" => format!(
            "Exported {} balances",
            exporter.export_balances_csv(writer).await?
        ),
        "requests" => format!(
            "Exported {} requests",
            exporter.export_requests_csv(writer).await?
        ),
        "full" => {
            let snapshot = exporter.export_full_json(writer).await?;
            format!(
                "Exported full database: {} balances, {} requests, {} transactions",
                snapshot.balances.len(),
                snapshot.requests.len(),
                snapshot.transactions.len()
            )
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: transactions, balances, requests, full",
                export_type
            );
        }
    };

    if output.is_some() {
        eprintln!("{}", summary);
    }
    Ok(())
}

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_commands() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "mutua",
            "request",
            "accept",
            &id.to_string(),
            "--as",
            "system",
            "--key",
            "k1",
        ])
        .unwrap();

        match cli.command {
            Commands::Request(RequestCommands::Accept { id: parsed, command }) => {
                assert_eq!(parsed, id.to_string());
                let ctx = command_context(command).unwrap();
                assert_eq!(ctx.actor, Actor::System);
                assert_eq!(ctx.idempotency_key, "k1");
            }
            _ => panic!("expected request accept"),
        }
    }

    #[test]
    fn test_mutating_commands_require_actor() {
        let id = Uuid::new_v4().to_string();
        assert!(Cli::try_parse_from(["mutua", "request", "start", &id]).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("gardening", 16), "gardening");
        assert_eq!(truncate("long distance babysitting", 10), "long di...");
    }
}
