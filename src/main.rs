//! graffiti: propagate EC2 instance tags to attached EBS volumes, and
//! volume tags to their snapshots.
mod cli;
mod config;
mod engine;
mod gateway;
mod logging;
mod model;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::ConfigError;
use engine::{Propagator, RunReport};
use gateway::Ec2Gateway;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(&cli) {
        Ok(report) => {
            tracing::info!(
                volumes_tagged = report.volumes.written,
                volumes_failed = report.volumes.failed,
                snapshots_tagged = report.snapshots.written,
                snapshots_failed = report.snapshots.failed,
                "graffiti completed successfully!"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: &Cli) -> Result<RunReport> {
    let settings = config::resolve(cli)?;
    tracing::info!(
        region = settings.region.as_str(),
        profile = settings.profile.as_str(),
        "Starting tag propagation"
    );
    if settings.rules.dry_run {
        tracing::info!("Dry run: no tags will be written");
    }
    let credentials =
        gateway::resolve_credentials(&settings.profile).context("resolve AWS credentials")?;
    let gateway = Ec2Gateway::new(&settings.region, credentials);

    let mut propagator = Propagator::new(&gateway, settings.rules, settings.selection);
    propagator.propagate_tags()?;
    Ok(propagator.report().clone())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ConfigError>())
        .map_or(1, ConfigError::exit_code)
}
