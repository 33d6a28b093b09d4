use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokenbucket_core::TokenBucket;
use tracing_subscriber::EnvFilter;

mod config;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "tokenbucket", version, about = "Interactive token bucket rate limiter")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./tokenbucket.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Read requests from stdin, one per line, and admit or drop each ("q" quits)
    Run {
        /// Maximum tokens in the bucket. Prompted for if not given here or in the config.
        #[arg(long)]
        capacity: Option<u32>,
        /// Refill period in seconds. Prompted for if not given here or in the config.
        #[arg(long)]
        refill_secs: Option<u64>,
        /// Output format: text or json (one object per request)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Print a prompt and parse the next input line.
fn prompt_value<T, R, W>(input: &mut R, out: &mut W, prompt: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    R: BufRead,
    W: Write,
{
    write!(out, "{}", prompt)?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(anyhow!("unexpected end of input"));
    }
    let trimmed = line.trim();
    trimmed.parse::<T>().with_context(|| format!("invalid number: {:?}", trimmed))
}

/// Answer each request line until "q" or end of input. Returns (accepted, dropped).
fn run_session<R: BufRead, W: Write>(
    bucket: &TokenBucket,
    input: &mut R,
    out: &mut W,
    format: OutputFormat,
) -> Result<(u64, u64)> {
    let (mut accepted, mut dropped) = (0u64, 0u64);
    let mut line = String::new();
    loop {
        if format == OutputFormat::Text {
            writeln!(out, "Please enter request: ")?;
            write!(out, ">")?;
            out.flush()?;
        }
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let request = line.trim_end_matches(['\r', '\n']);
        if request == "q" {
            break;
        }
        let ok = bucket.try_acquire();
        if ok { accepted += 1 } else { dropped += 1 }
        match format {
            OutputFormat::Text => {
                writeln!(out, "Request {} {}", request, if ok { "succeeded" } else { "dropped" })?;
            }
            OutputFormat::Json => {
                let obj = serde_json::json!({
                    "request": request,
                    "accepted": ok,
                    "at": now_rfc3339(),
                });
                writeln!(out, "{}", serde_json::to_string(&obj)?)?;
            }
        }
    }
    Ok((accepted, dropped))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunSettings {
    capacity: u32,
    refill_secs: u64,
    format: OutputFormat,
}

/// Settle run parameters: command-line flag, then config file, then an interactive prompt.
fn resolve_run<R: BufRead, W: Write>(
    capacity: Option<u32>,
    refill_secs: Option<u64>,
    format: Option<OutputFormat>,
    file: &config::BucketConfig,
    input: &mut R,
    out: &mut W,
) -> Result<RunSettings> {
    let format = match (format, file.format.as_deref()) {
        (Some(f), _) => f,
        (None, Some(s)) => <OutputFormat as ValueEnum>::from_str(s, true).map_err(|e| anyhow!("config format: {}", e))?,
        (None, None) => OutputFormat::Text,
    };
    let capacity = match capacity.or(file.capacity) {
        Some(c) => c,
        None => prompt_value(input, out, "Please enter token bucket size: ")?,
    };
    let refill_secs = match refill_secs.or(file.refill_secs) {
        Some(s) => s,
        None => prompt_value(input, out, "Please enter token bucket refill frequency (seconds): ")?,
    };
    Ok(RunSettings { capacity, refill_secs, format })
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            println!("tokenbucket {}", tokenbucket_core::version());
        }
        Commands::Run { capacity, refill_secs, format } => {
            let cfg = config::load_config(cli.config.as_deref())?.unwrap_or_default();
            let file = cfg.bucket.unwrap_or_default();

            let stdin = io::stdin();
            let mut input = stdin.lock();
            let stdout = io::stdout();
            let mut out = stdout.lock();

            let settings = resolve_run(capacity, refill_secs, format, &file, &mut input, &mut out)?;
            let bucket = TokenBucket::with_refill_secs(settings.capacity, settings.refill_secs)
                .with_context(|| format!("capacity={} refill_secs={}", settings.capacity, settings.refill_secs))?;
            let result = run_session(&bucket, &mut input, &mut out, settings.format);
            bucket.shutdown();
            let (accepted, dropped) = result?;
            tracing::debug!(accepted, dropped, "session finished");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    run(Cli::parse())
}
