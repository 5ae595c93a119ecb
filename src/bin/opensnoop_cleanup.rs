//! Removes what a crashed opensnoop left behind: the getname kretprobe and
//! the trace instance.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use opensnoop::tracefs::dynevent::uninstall;
use opensnoop::tracefs::instance::destroy_instance;
use opensnoop::tracefs::{DynEvent, Instance, Tracefs};
use opensnoop::Config;

#[derive(Debug, Parser)]
struct Command {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Same config file the crashed run used
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    tracefs: Option<PathBuf>,
    /// Disable the probe everywhere before removing it
    #[arg(short, long)]
    force: bool,
}

fn main() -> Result<ExitCode> {
    let opts = Command::parse();
    let level = if opts.verbose > 0 { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    let config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let tracefs = match opts.tracefs.as_ref().or(config.tracefs.as_ref()) {
        Some(root) => Tracefs::at(root),
        None => Tracefs::mount()?,
    };

    let mut failed = false;

    if tracefs.path("instances").join(&config.instance).is_dir() {
        let mut instance = Some(Instance::create(&tracefs, &config.instance)?);
        if let Err(err) = destroy_instance(&mut instance) {
            eprintln!("error: {err}");
            failed = true;
        } else {
            println!("removed instance {}", config.instance);
        }
    }

    let probe = DynEvent::kretprobe_alloc(
        config.probe_system.as_deref(),
        &config.probe_event,
        &config.probe_symbol,
        &config.fetch_format,
        config.max_active,
    )?;
    if probe.exists(&tracefs) {
        let name = probe.to_string();
        let mut probe = Some(probe);
        if let Err(err) = uninstall(&tracefs, &mut probe, opts.force || config.force_destroy) {
            eprintln!("error: {err}");
            failed = true;
        } else {
            println!("removed {name}");
        }
    } else {
        println!("no {}/{} probe to remove", probe.system(), probe.event());
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
