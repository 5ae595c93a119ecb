use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use opensnoop::tracefs::Tracefs;
use opensnoop::{CancelToken, Config, Session, SnoopError};

/// Show which files processes open, as they open them.
#[derive(Debug, Parser)]
struct Command {
    /// More log output, repeat for more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// JSON file overriding the probe and output settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Tracefs mount point, looked up when not given
    #[arg(long)]
    tracefs: Option<PathBuf>,
    /// Start tracing right away instead of waiting for Enter
    #[arg(short, long)]
    yes: bool,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
}

fn report(err: &SnoopError, tracefs: &Tracefs) {
    eprintln!("error: {err}");
    // Most errors already carry the log entry; allocation failures may not.
    if matches!(err, SnoopError::Allocation { .. }) {
        if let Some(log) = tracefs.last_error() {
            eprintln!("tracefs err: {log}");
        }
    }
}

fn wait_for_enter(token: &CancelToken) -> io::Result<()> {
    print!("To stop tracing, press CTRL+C\nHit enter when you're ready to start tracing: ");
    io::stdout().flush()?;
    token.read_line(io::BufReader::new(io::stdin()))?;
    println!();
    Ok(())
}

fn snoop(config: Config) -> Result<bool> {
    let tracefs = match &config.tracefs {
        Some(root) => Tracefs::at(root),
        None => match Tracefs::mount() {
            Ok(tracefs) => tracefs,
            Err(err) => {
                eprintln!("error: {err}");
                return Ok(false);
            }
        },
    };

    let skip_prompt = config.skip_prompt;
    let mut session = match Session::setup(tracefs.clone(), config) {
        Ok(session) => session,
        Err(err) => {
            report(&err, &tracefs);
            return Ok(false);
        }
    };

    let mut ok = true;
    let interrupt = session.interrupt()?;
    interrupt.install()?;

    if !skip_prompt {
        wait_for_enter(session.token())?;
    }

    if !session.token().is_set() {
        if let Err(err) = session.capture(io::stdout().lock(), io::stderr()) {
            report(&err, &tracefs);
            ok = false;
        }
    }

    if session.teardown().is_err() {
        ok = false;
    }
    Ok(ok)
}

fn main() -> Result<ExitCode> {
    let opts = Command::parse();

    let mut config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.verbosity = opts.verbose;
    init_logging(config.verbosity);
    config.skip_prompt = opts.yes;
    if opts.tracefs.is_some() {
        config.tracefs = opts.tracefs;
    }

    if snoop(config)? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
