use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod command;
pub mod schema;

use command::CommandArgs;
use schema::SchemaArgs;

use cmdforge::config::{ProjectConfig, ProjectPaths};

#[derive(Parser, Debug)]
#[command(
    name = "cmdforge",
    about = "Compiles chained script and query commands into per-node artifacts",
    version
)]
pub struct Cli {
    /// Log filter directive (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write JSON log lines to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build and inspect commands
    Command(CommandArgs),

    /// Emit JSON Schemas of the command definition, manifest and config
    Schema(SchemaArgs),
}

#[derive(Debug, Clone)]
pub struct CliContext {
    pub cwd: PathBuf,
    pub config: ProjectConfig,
    pub paths: ProjectPaths,
}

impl CliContext {
    pub async fn load(cwd: PathBuf) -> anyhow::Result<Self> {
        let config = ProjectConfig::load(&cwd).await?;
        let paths = config.paths(&cwd);
        Ok(Self { cwd, config, paths })
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Command(args) => command::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}
