use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use mnet_ajax::config::DEFAULT_TIMEOUT_MS;
use mnet_ajax::Method;
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;

/// Exit codes: 0 = OK, 2 = input error, 3 = transport error, 4 = timeout, 1 = other.
const EXIT_OTHER: i32 = 1;
const EXIT_INPUT: i32 = 2;
const EXIT_TRANSPORT: i32 = 3;
const EXIT_TIMEOUT: i32 = 4;

#[derive(Parser)]
#[command(name = "mnetx", version, about = "mnet CLI: dispatch a request and print the outcome")]
struct Cli {
    /// Request timeout in milliseconds
    #[arg(long, env = "MNET_AJAX_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Transport support to emulate: auto, no-response-type, legacy
    #[arg(long, env = "MNET_TRANSPORT", default_value = "auto")]
    transport: String,

    /// User agent announced by the host
    #[arg(long, env = "MNET_USER_AGENT")]
    user_agent: Option<String>,

    /// Host-application segment flag
    #[arg(long, env = "MNET_SEGMENT")]
    segment: Option<String>,

    /// Log dispatch internals (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a GET; a JSON object payload is merged into the query
    Get(RequestArgs),
    /// Send a POST with the payload as body
    Post(RequestArgs),
}

#[derive(Args)]
pub struct RequestArgs {
    /// Target address
    pub url: String,
    /// Payload: inline JSON, `@path` to a JSON file, or `-` for stdin.
    /// Text that is not JSON is sent as a string.
    #[arg(long, short)]
    pub data: Option<String>,
    /// Extra request header, `Name: value` or `Name=value` (repeatable)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,
    /// Send credentials (cookies)
    #[arg(long)]
    pub with_credentials: bool,
    /// Force a preflight-triggering header
    #[arg(long)]
    pub preflight: bool,
    /// Content-Type header (default text/plain)
    #[arg(long)]
    pub content_type: Option<String>,
}

/// Map error strings to exit codes.
fn exit_code_for(err: &str) -> i32 {
    if err.starts_with("timeout") {
        EXIT_TIMEOUT
    } else if err.starts_with("transport") {
        EXIT_TRANSPORT
    } else if err.contains("read ") || err.contains("parse ") || err.contains("invalid ") {
        EXIT_INPUT
    } else {
        EXIT_OTHER
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let host = commands::HostArgs {
        transport: cli.transport,
        user_agent: cli.user_agent,
        segment: cli.segment,
        timeout_ms: cli.timeout_ms,
    };
    let result = match cli.command {
        Commands::Get(args) => commands::send(&host, Method::Get, &args).await,
        Commands::Post(args) => commands::send(&host, Method::Post, &args).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(exit_code_for(&e));
    }
    Ok(())
}
