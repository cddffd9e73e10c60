//! CLI argument definitions using clap derive

use crate::config::Config;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Commune - content-addressed transformation cache
///
/// Computes transformations once and shares inputs, results and running
/// jobs with peer instances.
#[derive(Parser, Debug)]
#[command(name = "commune")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "COMMUNE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an instance and serve peers until interrupted
    Serve(ServeArgs),

    /// Compute a transformation and print its result checksum
    Run(RunArgs),

    /// Print the checksum of files
    Checksum(ChecksumArgs),

    /// Show or edit configuration
    Config(ConfigArgs),

    /// Execute one transformation request from stdin (used internally)
    #[command(hide = true)]
    Worker,
}

/// Overrides for the communion and execution sections
#[derive(Args, Debug, Default, Clone)]
pub struct NodeArgs {
    /// Port to accept peers on
    #[arg(long, env = "COMMUNE_COMMUNION_PORT")]
    pub port: Option<u16>,

    /// Peer addresses to dial (host:port, comma-separated)
    #[arg(long, value_delimiter = ',', env = "COMMUNE_COMMUNION_PEERS")]
    pub peers: Vec<String>,

    /// Instance ID announced to peers
    #[arg(long, env = "COMMUNE_COMMUNION_ID")]
    pub id: Option<String>,

    /// Concurrent local workers (0 disables local execution)
    #[arg(long, env = "COMMUNE_LOCAL_CORES")]
    pub cores: Option<usize>,
}

impl NodeArgs {
    /// Apply the flags that were given on top of the loaded file
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.communion.listen_port = Some(port);
        }
        if !self.peers.is_empty() {
            config.communion.peers = self.peers.clone();
        }
        if let Some(id) = &self.id {
            config.communion.id = Some(id.clone());
        }
        if let Some(cores) = self.cores {
            config.execution.local_cores = cores;
        }
    }
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub node: NodeArgs,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// File holding the transformation code
    #[arg(long)]
    pub code: PathBuf,

    /// Input pin (NAME=FILE), repeatable
    #[arg(short, long, value_parser = parse_input)]
    pub input: Vec<(String, PathBuf)>,

    /// Language of the code
    #[arg(short, long, default_value = "bash")]
    pub language: String,

    /// Write the result buffer to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Never ask peers to run it
    #[arg(long, conflicts_with = "remote_only")]
    pub local: bool,

    /// Never run it in a local worker
    #[arg(long)]
    pub remote_only: bool,

    #[command(flatten)]
    pub node: NodeArgs,
}

/// Arguments for the checksum command
#[derive(Parser, Debug)]
pub struct ChecksumArgs {
    /// Files to hash
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Parse an input pin in NAME=FILE format
fn parse_input(s: &str) -> Result<(String, PathBuf), String> {
    let (name, file) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid input '{}', expected NAME=FILE", s))?;
    if name.is_empty() || file.is_empty() {
        return Err(format!("invalid input '{}', expected NAME=FILE", s));
    }
    Ok((name.to_string(), PathBuf::from(file)))
}
