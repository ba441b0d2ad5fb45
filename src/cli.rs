//! Command-line arguments.
//!
//! Every option can also come from the YAML config file; see
//! [`crate::config`] for how the two are merged.
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "graffiti",
    version,
    about = "Propagates tags from EC2 instances to EBS volumes, and then to EBS snapshots",
    after_help = "Examples:\n  graffiti --region us-east-1 --dryrun\n  graffiti -c graffiti.yml -v\n  graffiti --region eu-west-1 --volumes vol-0123 vol-0456 --nosnapshots"
)]
pub struct Cli {
    /// AWS region to operate in
    #[arg(long, env = "AWS_REGION", value_name = "REGION")]
    pub region: Option<String>,

    /// Profile from the shared credentials file
    #[arg(long, value_name = "PROFILE")]
    pub profile: Option<String>,

    /// More output; repeat for more (-vvvv includes HTTP client debugging)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log the tags that would be written without writing them
    #[arg(long)]
    pub dryrun: bool,

    /// Keep tags already present on volumes and snapshots
    #[arg(long)]
    pub append: bool,

    /// Only tag these volume ids
    #[arg(long, value_name = "VOLUME_ID", num_args = 1..)]
    pub volumes: Vec<String>,

    /// Only tag these snapshot ids
    #[arg(long, value_name = "SNAPSHOT_ID", num_args = 1..)]
    pub snapshots: Vec<String>,

    /// Do not tag volumes
    #[arg(long)]
    pub novolumes: bool,

    /// Do not tag snapshots
    #[arg(long)]
    pub nosnapshots: bool,
}
