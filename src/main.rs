//! loopkit - audio content downloader and deployer

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod cleanup;
mod cli;
mod codec;
mod compare;
mod config;
mod disk;
mod dmg;
mod driver;
mod error;
mod installer;
mod manifest;
mod net;
mod package;
mod patch;
mod pkgutil;
mod reconcile;
mod registry;
mod source;
mod system;
mod updater;
mod version;

use cleanup::Cleanup;
use config::Config;
use error::LoopsError;

/// Download and deploy GarageBand, Logic Pro and MainStage audio content
#[derive(Parser)]
#[command(name = "loopkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    options: cli::Options,

    /// Configuration file
    #[arg(long, value_name = "PATH", env = "LOOPKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = cli.log_level.clone().unwrap_or_else(|| {
        if cli.options.silent {
            "warn".to_string()
        } else {
            "info".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let cleanup = Cleanup::shared();
    if let Err(e) = cleanup::install_handler(cleanup.clone()) {
        tracing::warn!("{:#}", e);
    }

    let result = Config::load(cli.config.as_deref())
        .map_err(|e| anyhow::Error::new(LoopsError::Config(format!("{:#}", e))))
        .and_then(|config| cli::execute(cli.options, &config, &cleanup));

    cleanup::run_shared(&cleanup);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<LoopsError>() {
            Some(err) => {
                eprintln!("{} {}", "error:".red().bold(), err);
                if err.is_usage() {
                    eprintln!("For more information, try '--help'.");
                }
                err.exit_code()
            }
            None => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                ExitCode::FAILURE
            }
        },
    }
}
