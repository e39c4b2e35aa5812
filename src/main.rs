use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use timewindow::config::Settings;
use timewindow::{BlockController, KeySpace, KeyTtl, RedisStore, WindowLimiter};

/// Inspect and override sliding-window block state in Redis.
#[derive(Debug, Parser)]
#[command(name = "timewindow", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Redis URL, overrides the configuration file
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Key namespace prefix, overrides the configuration file
    #[arg(long)]
    prefix: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record an event for a key and report whether it is blocked
    Check { key: String },
    /// Report whether a key is blocked
    Status { key: String },
    /// Lift a key's block
    Clear { key: String },
    /// Block a key for a number of seconds
    Ban {
        key: String,
        #[arg(long)]
        secs: u64,
    },
    /// Move a key's block expiry by a signed number of seconds
    Extend {
        key: String,
        #[arg(long, allow_negative_numbers = true)]
        secs: i64,
    },
    /// Report a key's remaining block time
    Ttl { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.redis_url {
        settings.redis.url = url;
    }
    if let Some(prefix) = cli.prefix {
        settings.window.prefix = prefix;
    }

    let store = Arc::new(
        RedisStore::connect_with(&settings.redis)
            .await
            .context("connecting to Redis")?,
    );

    let controller = BlockController::new(Arc::clone(&store), KeySpace::from(&settings.window));

    let output = match cli.command {
        Command::Check { key } => {
            let limiter = WindowLimiter::new(store, &settings.window)
                .context("window configuration is required for checks")?;
            let verdict = limiter.admit_or_block(&key).await?;
            json!({ "key": key, "blocked": verdict.is_blocked() })
        }
        Command::Status { key } => {
            let blocked = controller.get_block_status(&key).await?;
            json!({ "key": key, "blocked": blocked })
        }
        Command::Clear { key } => {
            controller.clear_block_status(&key).await?;
            json!({ "key": key, "cleared": true })
        }
        Command::Ban { key, secs } => {
            controller.set_block(&key, Duration::from_secs(secs)).await?;
            json!({ "key": key, "blocked_secs": secs })
        }
        Command::Extend { key, secs } => {
            let adjusted = controller.add_block_time(&key, block_delta(secs)?).await?;
            json!({ "key": key, "adjusted": adjusted })
        }
        Command::Ttl { key } => {
            let ttl = controller.get_block_ttl(&key).await?;
            ttl_json(&key, ttl)
        }
    };

    info!(prefix = %settings.window.prefix, "Command complete");
    println!("{}", output);
    Ok(())
}

/// Signed block adjustment from a seconds count given on the command line.
fn block_delta(secs: i64) -> anyhow::Result<TimeDelta> {
    TimeDelta::try_seconds(secs)
        .with_context(|| format!("block delta of {} seconds is out of range", secs))
}

fn ttl_json(key: &str, ttl: KeyTtl) -> serde_json::Value {
    match ttl {
        KeyTtl::Missing => json!({ "key": key, "blocked": false }),
        KeyTtl::Persistent => json!({ "key": key, "blocked": true, "ttl_ms": null }),
        KeyTtl::Expires(d) => {
            json!({ "key": key, "blocked": true, "ttl_ms": d.as_millis() as u64 })
        }
    }
}
