use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;

mod cli;
mod client;
mod config;
mod daemon;
mod indexer;
mod lock;
mod logging;
mod semantic;
mod supervisor;
#[cfg(test)]
mod tests;

use client::QueryClient;
use config::{Config, ContextPaths};
use semantic::{EmbeddingModel, VectorStorage};
use supervisor::{DaemonStatus, DaemonSupervisor, ExeLauncher, ReadinessSettings, SystemClock};

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let base_path = config::base_path()?;
    let config = Config::load_with(&base_path)?;
    let paths = ContextPaths::from_config(&base_path, &config);

    match args.command {
        cli::Command::Daemon {} => {
            logging::init_file(&paths.log_file, "info")
                .with_context(|| format!("failed to open {}", paths.log_file.display()))?;

            if let Err(e) = daemon::run(&config, &paths) {
                log::error!("Daemon failed: {}", e);
                return Err(e.into());
            }
            Ok(())
        }

        cli::Command::Search { text, limit } => {
            logging::init_stderr("warn");

            let client = QueryClient::new(supervisor(&config, &paths)?, config.request_timeout());
            let context = client.search(&text, limit.unwrap_or(config.default_limit));
            if !context.is_empty() {
                println!("{}", context);
            }
            Ok(())
        }

        cli::Command::Index {
            records,
            batch_size,
            quiet,
        } => {
            logging::init_stderr("info");
            index(&config, &paths, &records, batch_size, quiet)
        }

        cli::Command::Status {} => {
            logging::init_stderr("warn");

            match supervisor(&config, &paths)?.status() {
                DaemonStatus::Running(pid) => {
                    println!("running (pid {}) on {}", pid, paths.socket.display())
                }
                DaemonStatus::Starting(pid) => println!("starting (pid {})", pid),
                DaemonStatus::Stopped => println!("stopped"),
            }
            Ok(())
        }

        cli::Command::Stop {} => {
            logging::init_stderr("warn");

            match supervisor(&config, &paths)?.status() {
                DaemonStatus::Running(pid) | DaemonStatus::Starting(pid) => {
                    supervisor::terminate(pid)
                        .with_context(|| format!("failed to signal pid {}", pid))?;
                    println!("sent SIGTERM to pid {}", pid);
                }
                DaemonStatus::Stopped => println!("daemon is not running"),
            }
            Ok(())
        }
    }
}

fn supervisor(config: &Config, paths: &ContextPaths) -> anyhow::Result<DaemonSupervisor> {
    let launcher =
        ExeLauncher::current(&paths.base_dir).context("failed to locate own executable")?;

    Ok(DaemonSupervisor::new(
        paths.clone(),
        ReadinessSettings::from_config(config),
        Box::new(launcher),
        Box::new(SystemClock),
    ))
}

fn index(
    config: &Config,
    paths: &ContextPaths,
    records: &Path,
    batch_size: Option<usize>,
    quiet: bool,
) -> anyhow::Result<()> {
    let batch_size = batch_size.unwrap_or(config.index_batch_size);
    if batch_size == 0 {
        bail!("batch size must be greater than 0");
    }

    let file = File::open(records)
        .with_context(|| format!("failed to open {}", records.display()))?;

    log::info!("Loading embedding model '{}'", config.model);
    let model = EmbeddingModel::new(
        &config.model,
        paths.models_dir.clone(),
        Some(config.download_timeout()),
    )?;

    let storage = VectorStorage::new(paths.store.clone());
    let report = indexer::run(BufReader::new(file), &model, &storage, batch_size, !quiet)?;

    println!(
        "{} emails indexed ({} empty, {} malformed skipped)",
        report.indexed, report.skipped_empty, report.skipped_malformed
    );

    if supervisor(config, paths)?.status() != DaemonStatus::Stopped {
        println!("restart the daemon (`mailctx stop`) to pick up the new index");
    }
    Ok(())
}
