//! rap CLI
//!
//! `rap serve` runs the local recording proxy in front of a
//! Responses-style API; `rap stats` and `rap diff` run the offline
//! analysis over the capture tree the proxy writes.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rap_core::analyze::{self, WindowStats};
use rap_core::config::ProxyConfig;

mod gateway;
mod relay;

/// rap - record and analyze Responses API traffic
#[derive(Parser, Debug)]
#[command(name = "rap")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the local recording proxy
    Serve(ServeArgs),
    /// Aggregate cache statistics over captures in a time window
    Stats(StatsArgs),
    /// Locate two captures and compare their normalized request bodies
    Diff(DiffArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "RAP_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "RAP_PORT", default_value_t = 8080)]
    port: u16,

    /// Upstream base URL
    #[arg(
        long,
        env = "RAP_UPSTREAM_BASE_URL",
        default_value = rap_core::config::DEFAULT_UPSTREAM_BASE_URL
    )]
    upstream_base_url: String,

    /// Upstream path that Responses calls are rewritten to
    #[arg(
        long,
        env = "RAP_UPSTREAM_RESPONSES_PATH",
        default_value = rap_core::config::DEFAULT_RESPONSES_PATH
    )]
    upstream_responses_path: String,

    /// Upstream API key; when set it replaces any client Authorization
    #[arg(long, env = "RAP_UPSTREAM_API_KEY")]
    upstream_api_key: Option<String>,

    /// Capture directory root
    #[arg(long, env = "RAP_LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,

    /// Store sensitive headers verbatim instead of redacting them
    #[arg(long, env = "RAP_LOG_SENSITIVE_HEADERS", default_value_t = false)]
    log_sensitive_headers: bool,

    /// Cap on captured response bytes per exchange
    #[arg(
        long,
        env = "RAP_MAX_CAPTURE_BYTES",
        default_value_t = rap_core::config::DEFAULT_MAX_CAPTURE_BYTES
    )]
    max_capture_bytes: usize,
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// Capture directory root
    #[arg(long, env = "RAP_LOG_DIR", default_value = "./logs")]
    dir: PathBuf,

    /// Start of the window, inclusive (RFC 3339 or "YYYY-MM-DD HH:MM", UTC)
    #[arg(long)]
    since: Option<String>,

    /// End of the window, exclusive
    #[arg(long)]
    until: Option<String>,
}

#[derive(Args, Debug)]
struct DiffArgs {
    /// Capture directory root
    #[arg(long, env = "RAP_LOG_DIR", default_value = "./logs")]
    dir: PathBuf,

    /// First request id
    id1: String,

    /// Second request id
    id2: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Stats(args) => run_stats(args),
        Command::Diff(args) => run_diff(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), String> {
    let mut config = ProxyConfig::new(args.upstream_base_url, args.log_dir)
        .with_responses_path(args.upstream_responses_path)
        .with_sensitive_headers(args.log_sensitive_headers)
        .with_max_capture_bytes(args.max_capture_bytes);
    if let Some(key) = args.upstream_api_key {
        config = config.with_api_key(key);
    }

    gateway::run_gateway(config, &args.host, args.port).await
}

fn run_stats(args: StatsArgs) -> Result<(), String> {
    let since = args.since.as_deref().map(parse_time).transpose()?;
    let until = args.until.as_deref().map(parse_time).transpose()?;

    let stats = analyze::window_stats(&args.dir, since, until);
    print!("{}", render_stats(&stats));
    Ok(())
}

fn run_diff(args: DiffArgs) -> Result<(), String> {
    let report = analyze::diff_captures(&args.dir, &args.id1, &args.id2).map_err(String::from)?;

    println!("normalized request paths:");
    println!("{}", report.left.display());
    println!("{}", report.right.display());
    println!();
    if report.identical {
        println!("documents are byte-identical; no divergence");
    } else {
        match &report.divergence {
            Some(path) => println!("first divergence: {path}"),
            None => println!("documents differ"),
        }
    }
    println!();
    println!("git diff suggestion:");
    println!(
        "  git diff --no-index -- {} {}",
        report.left.display(),
        report.right.display()
    );
    Ok(())
}

fn render_stats(stats: &WindowStats) -> String {
    let mut lines = Vec::new();
    lines.push(format!("captures: {}", stats.captures));
    lines.push(format!("with_cached_tokens: {}", stats.with_cached_tokens));
    lines.push(format!("missing_usage: {}", stats.missing_usage));
    lines.push(format!("input_tokens: {}", stats.input_tokens));
    lines.push(format!("cached_tokens: {}", stats.cached_tokens));
    lines.push(format!("cache_hit_rate: {:.3}", stats.cache_hit_ratio()));
    if let Some(avg) = stats.avg_elapsed_ms() {
        lines.push(format!("avg_elapsed_ms: {avg}"));
    }

    if !stats.by_cache_ident.is_empty() {
        lines.push(String::new());
        lines.push("cache_ident groups:".to_string());
        let mut groups: Vec<_> = stats.by_cache_ident.iter().collect();
        groups.sort_by_key(|(_, count)| std::cmp::Reverse(**count));
        for (key, count) in groups.into_iter().take(20) {
            lines.push(format!("- {key}: {count} calls"));
        }
    }

    lines.join("\n") + "\n"
}

/// Accept RFC 3339 or a bare `YYYY-MM-DD HH:MM[:SS]` read as UTC
fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!(
        "unrecognized time: {s} (use RFC 3339 or \"YYYY-MM-DD HH:MM\")"
    ))
}
