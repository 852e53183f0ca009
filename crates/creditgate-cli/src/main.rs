// ============================================================================
// creditgate-admin - operator command line for the credit engine
// ============================================================================
// Usage:
//   creditgate-admin stats [--top 10]              Redemption and ledger stats
//   creditgate-admin users [--premium]             List accounts
//   creditgate-admin show USER                     Show one account
//   creditgate-admin grant-credits USER DELTA      Signed credit adjustment
//   creditgate-admin top-up USER AMOUNT            Rate-limited top-up (1-20)
//   creditgate-admin grant-tier USER TIER          Grant a premium tier
//   creditgate-admin grant-days USER TIER DAYS     Grant a tier for N days
//   creditgate-admin revoke-tier USER              Drop a premium tier
//   creditgate-admin rotate-token USER             Invalidate old links
//   creditgate-admin link USER                     Print the verification link
//   creditgate-admin broadcast --text "..."        Message every user
//   creditgate-admin sweep                         Demote lapsed tiers
//   creditgate-admin export --format json          Dump the ledger as JSON
// ============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use creditgate_core::{
    Content, CreditEngine, EngineConfig, LedgerStore, Tier, TopUpOutcome, UserAccount, UserId,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Credit engine operator tool
#[derive(Parser)]
#[command(name = "creditgate-admin", version, about = "Operate the creditgate ledger")]
struct Cli {
    /// Path to the database file (default: ~/.creditgate/ledger.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show redemption counts, ledger totals and leaderboards
    Stats {
        /// Leaderboard length
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// List accounts
    Users {
        /// Only accounts with an active tier
        #[arg(long)]
        premium: bool,
    },

    /// Show one account
    Show { user_id: UserId },

    /// Add (or with a negative value, remove) credits without limits
    GrantCredits {
        user_id: UserId,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },

    /// Assisted top-up, capped by the rolling credit window
    TopUp { user_id: UserId, amount: u64 },

    /// Grant a premium tier: bronze, silver or gold
    GrantTier {
        user_id: UserId,
        tier: Tier,
        /// Must equal the tier's canonical amount (default: that amount)
        #[arg(long)]
        credits: Option<u64>,
    },

    /// Grant a premium tier that expires after DAYS
    GrantDays {
        user_id: UserId,
        tier: Tier,
        days: i64,
    },

    /// Remove any premium tier
    RevokeTier { user_id: UserId },

    /// Issue a new verification token
    RotateToken { user_id: UserId },

    /// Print the (shortened) verification link
    Link { user_id: UserId },

    /// Send a message to every known user
    Broadcast {
        /// Plain text to send
        #[arg(long, conflicts_with = "copy_from")]
        text: Option<String>,

        /// Chat holding the message to copy
        #[arg(long, requires = "message_id")]
        copy_from: Option<i64>,

        /// Message id inside --copy-from
        #[arg(long)]
        message_id: Option<i64>,
    },

    /// Demote every tier whose expiry passed or balance fell under the floor
    Sweep,

    /// Export full ledger contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("creditgate_core=info,creditgate_admin=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = EngineConfig::load().context("Invalid configuration")?;
    if cli.db_path.is_some() {
        config.db_path = cli.db_path;
    }
    let engine = CreditEngine::open(config)?;

    match cli.command {
        Commands::Stats { top } => cmd_stats(&engine, top),
        Commands::Users { premium } => cmd_users(&engine, premium),
        Commands::Show { user_id } => cmd_show(&engine, user_id),
        Commands::GrantCredits { user_id, delta } => {
            let change = engine.grant_credits(user_id, delta)?;
            println!(
                "User {}: applied {:+}, balance now {}",
                user_id, change.applied, change.balance
            );
            Ok(())
        }
        Commands::TopUp { user_id, amount } => match engine.assisted_top_up(user_id, amount)? {
            TopUpOutcome::Credited { balance } => {
                println!("User {}: +{} credits, balance now {}", user_id, amount, balance);
                Ok(())
            }
            TopUpOutcome::RateLimited { remaining, retry_at } => {
                println!(
                    "User {}: top-up limit reached ({} credits left in window{})",
                    user_id,
                    remaining,
                    retry_at
                        .map(|at| format!(", frees up at {}", format_timestamp(at)))
                        .unwrap_or_default()
                );
                Ok(())
            }
        },
        Commands::GrantTier {
            user_id,
            tier,
            credits,
        } => {
            let account =
                engine.grant_tier(user_id, tier, credits.unwrap_or(tier.canonical_credits()))?;
            println!("User {}: {} with {} credits", user_id, account.tier, account.balance);
            Ok(())
        }
        Commands::GrantDays { user_id, tier, days } => {
            let account = engine.grant_days(user_id, tier, days)?;
            println!(
                "User {}: {} until {}",
                user_id,
                account.tier,
                account
                    .tier_expiry
                    .map(format_timestamp)
                    .unwrap_or_else(|| "-".to_string())
            );
            Ok(())
        }
        Commands::RevokeTier { user_id } => {
            if engine.revoke_tier(user_id)? {
                println!("User {}: tier revoked", user_id);
            } else {
                println!("User {} held no tier", user_id);
            }
            Ok(())
        }
        Commands::RotateToken { user_id } => {
            engine.rotate_token(user_id)?;
            println!("{}", engine.verification_link(user_id).await?);
            Ok(())
        }
        Commands::Link { user_id } => {
            println!("{}", engine.verification_link(user_id).await?);
            Ok(())
        }
        Commands::Broadcast {
            text,
            copy_from,
            message_id,
        } => {
            let content = match (text, copy_from, message_id) {
                (Some(text), _, _) => Content::text(text),
                (None, Some(from_chat), Some(message_id)) => Content::Copy {
                    from_chat,
                    message_id,
                },
                _ => anyhow::bail!("Pass --text, or --copy-from with --message-id"),
            };
            if engine.config().bot_token.is_none() {
                anyhow::bail!("TG_BOT_TOKEN must be set to broadcast");
            }
            info!("Operator broadcast started");
            let report = engine.broadcast(&content).await?;
            println!("{}", report);
            Ok(())
        }
        Commands::Sweep => {
            let demoted = engine.sweep_subscriptions()?;
            println!("Demoted {} accounts", demoted);
            Ok(())
        }
        Commands::Export { format } => cmd_export(&engine, &format),
    }
}

fn cmd_stats(engine: &CreditEngine, top: usize) -> Result<()> {
    let stats = engine.stats();
    let verifications = stats.verification_stats()?;
    let totals = engine.store().stats(Utc::now().timestamp())?;

    println!("=== Creditgate Stats ===");
    println!();
    println!("Users:          {}", totals.total_users);
    println!("Premium:        {}", totals.premium_users);
    println!("Credits held:   {}", totals.total_credits);
    println!();
    println!("Verifications:");
    println!("  Today         {}", verifications.today);
    println!("  Last 24h      {}", verifications.last_24h);
    println!("  Total         {}", verifications.total);

    println!();
    println!("Top balances:");
    for (rank, entry) in stats.top_balances(top)?.iter().enumerate() {
        println!("  {:>2}. {:<16} {}", rank + 1, entry.user_id, entry.value);
    }

    println!();
    println!("Top redeemers:");
    for (rank, entry) in stats.top_redeemers(top)?.iter().enumerate() {
        println!("  {:>2}. {:<16} {}", rank + 1, entry.user_id, entry.value);
    }

    Ok(())
}

fn print_account_row(account: &UserAccount, now: i64) {
    let tier = if account.is_premium_active(now) {
        account.tier.display_name()
    } else {
        "-"
    };
    println!(
        "{:<16}  {:>8}  {:<10}  {}",
        account.id,
        account.balance,
        tier,
        format_timestamp(account.registered_at)
    );
}

fn cmd_users(engine: &CreditEngine, premium_only: bool) -> Result<()> {
    let now = Utc::now().timestamp();
    let accounts: Vec<UserAccount> = engine
        .store()
        .list_accounts()?
        .into_iter()
        .filter(|account| !premium_only || account.is_premium_active(now))
        .collect();

    if accounts.is_empty() {
        println!("No users found.");
        return Ok(());
    }

    println!("{:<16}  {:>8}  {:<10}  {}", "USER", "BALANCE", "TIER", "REGISTERED");
    println!("{}", "-".repeat(64));
    for account in &accounts {
        print_account_row(account, now);
    }

    println!("\nTotal: {} users", accounts.len());
    Ok(())
}

fn cmd_show(engine: &CreditEngine, user_id: UserId) -> Result<()> {
    let Some(account) = engine.store().get(user_id)? else {
        println!("User {} not found.", user_id);
        return Ok(());
    };
    let status = engine.subscription_status(user_id)?;
    let redemptions = engine.stats().redemptions_for(user_id)?;
    let remaining = engine.tokens().remaining_redemptions(user_id)?;

    println!("User:           {}", account.id);
    println!("Registered:     {}", format_timestamp(account.registered_at));
    println!("Balance:        {}", account.balance);
    println!(
        "Tier:           {}{}",
        status.tier,
        if status.active { "" } else { " (inactive)" }
    );
    if let Some(expiry) = status.expires_at {
        println!(
            "Expires:        {} ({} days left)",
            format_timestamp(expiry),
            status.days_left.unwrap_or(0)
        );
    }
    println!("Redemptions:    {} total, {} left in window", redemptions, remaining);
    println!(
        "Token issued:   {}",
        if account.verify_token.is_some() { "yes" } else { "no" }
    );
    Ok(())
}

fn cmd_export(engine: &CreditEngine, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let store = engine.store();
    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": store.stats(Utc::now().timestamp())?,
        "verification_stats": engine.stats().verification_stats()?,
        "accounts": store.list_accounts()?,
        "verifications": store.list_verifications()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
