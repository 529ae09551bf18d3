#![allow(clippy::print_stderr)]

use anyhow::Context;
use clap::Parser;
use distlock::config::{
    ClientConfig, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_ENDPOINT, DEFAULT_SESSION_TTL_SECS,
};
use distlock::coord::etcd::EtcdCoordinator;
use distlock::error::{LockError, EXIT_FAILURE};
use distlock::invocation::{Invocation, Options};
use distlock::lock::{LockConfig, LockController};
use distlock::run;
use serde::Serialize;
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "distlock",
    version,
    about = "Run a command while holding a named distributed lock"
)]
struct Cli {
    /// Name of the lock to operate on
    #[arg(long)]
    lock_name: Option<String>,
    /// Acquire lock and exit
    #[arg(long)]
    lock: bool,
    /// Release lock and exit
    #[arg(long)]
    unlock: bool,
    /// Reason why we perform this operation
    #[arg(long)]
    reason: Option<String>,
    /// Fail if the lock is busy
    #[arg(long)]
    nowait: bool,
    /// Max. no. of secs to wait for the lock (<=0 waits forever)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    timeout: i64,

    /// etcd endpoints, comma separated
    #[arg(
        long,
        env = "DISTLOCK_ENDPOINTS",
        value_delimiter = ',',
        default_value = DEFAULT_ENDPOINT
    )]
    endpoints: Vec<String>,
    /// Seconds to wait for the connection and session
    #[arg(long, env = "DISTLOCK_DIAL_TIMEOUT", default_value_t = DEFAULT_DIAL_TIMEOUT_SECS)]
    dial_timeout: u64,
    /// Session lease TTL in seconds
    #[arg(long, env = "DISTLOCK_TTL", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    ttl: u64,

    /// Print a JSON report for --lock/--unlock
    #[arg(long, default_value_t = false)]
    json: bool,
    /// Suppress log output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// Debug log output
    #[arg(short, long)]
    verbose: bool,

    /// Command to run while holding the lock
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn invocation(&self) -> Result<Invocation, LockError> {
        Ok(Options {
            lock_name: self.lock_name.clone(),
            lock: self.lock,
            unlock: self.unlock,
            reason: self.reason.clone(),
            nowait: self.nowait,
            timeout_secs: self.timeout,
            command: self.command.clone(),
        }
        .validate()?)
    }

    fn client_config(&self) -> Result<ClientConfig, LockError> {
        Ok(ClientConfig::new(
            self.endpoints.iter().cloned(),
            self.dial_timeout,
            self.ttl,
        )?)
    }
}

fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("distlock: {err:#}");
            err.downcast_ref::<LockError>()
                .map_or(EXIT_FAILURE, LockError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let invocation = cli.invocation()?;
    let config = cli.client_config()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    let outcome = runtime.block_on(async {
        let client = EtcdCoordinator::connect(&config).await?;
        let controller = LockController::new(
            client,
            LockConfig {
                session_ttl: config.session_ttl,
                ..LockConfig::default()
            },
        );
        run::execute(&controller, &invocation).await
    })?;

    if let Some(report) = outcome.report().filter(|_| cli.json) {
        write_json(report)?;
    }
    Ok(outcome.exit_code())
}

fn write_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    let raw = serde_json::to_string_pretty(value).context("serialize JSON")?;
    stdout.write_all(raw.as_bytes()).context("write stdout")?;
    stdout.write_all(b"\n").context("write stdout newline")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}
