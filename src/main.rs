//! Mimir - message bundle resolver
//!
//! Resolves message codes against locale-qualified `.properties` / XML
//! bundles through the layered TTL cache:
//! - Locale fallback with optional system locale
//! - Merged per-locale views when caching forever, modification checks otherwise
//! - Prometheus metrics

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mimir::config::Config;
use mimir::messages::{Locale, ReloadableMessageSource};
use mimir::metrics::create_metrics;
use mimir::services::bundles::FsSourceLoader;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Mimir - message bundle resolver
#[derive(Parser, Debug)]
#[command(name = "mimir")]
#[command(author, version, about = "Message bundle resolver with a layered TTL cache", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Bundle basename, highest precedence first (overrides MIMIR_BASENAMES)
    #[arg(long = "basename")]
    basenames: Vec<String>,

    /// Use the basenames of the `.properties` files found in the base dirs
    #[arg(long)]
    discover: bool,

    /// Bundle consulted when no basename defines a code (overrides MIMIR_FALLBACK_BASENAMES)
    #[arg(long = "fallback-basename")]
    fallback_basenames: Vec<String>,

    /// Directory searched for bundles (overrides MIMIR_BASE_DIRS)
    #[arg(long = "base-dir")]
    base_dirs: Vec<PathBuf>,

    /// Cache seconds: negative caches forever, 0 rechecks on every lookup
    #[arg(long, allow_hyphen_values = true)]
    cache_seconds: Option<i64>,

    /// Print Prometheus metrics after the command finishes
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one message code
    Resolve {
        code: String,

        /// Locale such as `de_AT` (empty for the root locale)
        #[arg(long, default_value = "")]
        locale: String,

        /// Message argument, in order
        #[arg(short, long = "arg")]
        args: Vec<String>,
    },
    /// List every code defined for a locale
    Codes {
        #[arg(long, default_value = "")]
        locale: String,
    },
    /// Re-resolve a code periodically, printing whenever it changes
    Watch {
        code: String,

        #[arg(long, default_value = "")]
        locale: String,

        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Stop after this many lookups
        #[arg(long)]
        iterations: Option<u64>,
    },
}

#[derive(Serialize)]
struct Resolution<'a> {
    code: &'a str,
    locale: String,
    message: Option<String>,
}

#[derive(Serialize)]
struct CodeList {
    locale: String,
    basenames: Vec<String>,
    codes: Vec<String>,
}

#[derive(Serialize)]
struct WatchEvent<'a> {
    observed_at: DateTime<Utc>,
    iteration: u64,
    code: &'a str,
    locale: String,
    message: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Mimir v{}", env!("CARGO_PKG_VERSION"));

    // CLI flags override env vars
    let mut config = Config::from_env()?;
    if !args.basenames.is_empty() {
        config.bundles.basenames = args.basenames.clone();
    }
    if args.discover {
        config.bundles.discover_basenames = true;
    }
    if !args.fallback_basenames.is_empty() {
        config.bundles.fallback_basenames = args.fallback_basenames.clone();
    }
    if !args.base_dirs.is_empty() {
        config.bundles.base_dirs = args.base_dirs.clone();
    }
    if let Some(seconds) = args.cache_seconds {
        config.cache.cache_seconds = seconds;
    }

    info!(
        basenames = ?config.bundles.basenames,
        fallback_basenames = ?config.bundles.fallback_basenames,
        base_dirs = ?config.bundles.base_dirs,
        cache_seconds = config.cache.cache_seconds,
        system_locale = ?config.locale.system_locale.as_ref().map(|l| l.to_string()),
        "Configuration loaded"
    );

    let metrics = create_metrics();
    let loader = Arc::new(FsSourceLoader::new(config.bundles.base_dirs.clone()));

    if config.bundles.discover_basenames {
        let discovered = loader
            .discover_basenames()
            .await
            .context("Failed to discover bundle basenames")?;
        if discovered.is_empty() {
            warn!(base_dirs = ?config.bundles.base_dirs, "No bundles discovered, keeping configured basenames");
        } else {
            info!(basenames = ?discovered, "Discovered bundle basenames");
            config.bundles.basenames = discovered;
        }
    }
    let source = ReloadableMessageSource::new(config.to_message_source_config(), loader, metrics.clone())
        .context("Failed to create message source")?;

    match &args.command {
        Command::Resolve { code, locale, args } => {
            let locale = parse_locale(locale)?;
            let message = source.resolve_message(code, args.as_slice(), &locale).await?;
            print_json(&Resolution {
                code,
                locale: locale.to_string(),
                message,
            })?;
        }
        Command::Codes { locale } => {
            let locale = parse_locale(locale)?;
            let configured: Vec<String> = source
                .config()
                .basenames
                .iter()
                .chain(&source.config().fallback_basenames)
                .cloned()
                .collect();
            let basenames: Vec<&str> = configured.iter().map(String::as_str).collect();
            let codes = source.bundle_codes(&locale, &basenames).await?;
            print_json(&CodeList {
                locale: locale.to_string(),
                basenames: configured.clone(),
                codes: codes.into_iter().collect(),
            })?;
        }
        Command::Watch {
            code,
            locale,
            interval_ms,
            iterations,
        } => {
            let locale = parse_locale(locale)?;
            watch(&source, code, &locale, Duration::from_millis(*interval_ms), *iterations).await?;
        }
    }

    if args.print_metrics {
        print!("{}", metrics.render());
    }

    Ok(())
}

fn parse_locale(value: &str) -> anyhow::Result<Locale> {
    value
        .parse::<Locale>()
        .with_context(|| format!("Invalid locale '{}'", value))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn watch(
    source: &ReloadableMessageSource,
    code: &str,
    locale: &Locale,
    interval: Duration,
    iterations: Option<u64>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<Option<String>> = None;
    let mut iteration = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping watch");
                break;
            }
        }

        iteration += 1;
        match source.resolve_text(code, locale).await {
            Ok(message) => {
                if last.as_ref() != Some(&message) {
                    print_json(&WatchEvent {
                        observed_at: Utc::now(),
                        iteration,
                        code,
                        locale: locale.to_string(),
                        message: message.clone(),
                    })?;
                    last = Some(message);
                }
            }
            // A broken file should not end the watch; the next tick retries
            Err(e) => warn!(error = %e, code = %code, "Failed to resolve message"),
        }

        if iterations.is_some_and(|max| iteration >= max) {
            break;
        }
    }

    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::new(format!("mimir={}", level));

    // Logs go to stderr, command output to stdout
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    Ok(())
}
