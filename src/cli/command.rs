use std::process;

use clap::{Args, Subcommand};
use tracing::info;

use super::CliContext;
use cmdforge::{
    build::{BuildOptions, Builder},
    config::DotenvFile,
    logger::log_build_error,
    toolchain::Toolchain,
};

#[derive(Args, Debug)]
pub struct CommandArgs {
    #[command(subcommand)]
    pub command: CommandCommands,
}

#[derive(Subcommand, Debug)]
pub enum CommandCommands {
    /// Build the given commands into `<base>/.generated/commands`
    Build(BuildArgs),

    /// List command ids found under the commands directory
    List,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Command ids to build, repeated or comma separated
    #[arg(long = "cmd", visible_alias = "command", value_delimiter = ',')]
    pub ids: Vec<String>,

    /// Minify script artifacts
    #[arg(long)]
    pub minify: bool,

    /// Leave readable script artifacts untidied
    #[arg(long)]
    pub no_format: bool,
}

pub async fn execute(args: CommandArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        CommandCommands::Build(args) => build(args, context).await,
        CommandCommands::List => {
            for id in context.paths.command_ids().await? {
                println!("{id}");
            }
            Ok(())
        }
    }
}

async fn build(args: BuildArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut options = BuildOptions::from(&context.config.command);
    options.minify |= args.minify;
    options.format &= !args.no_format;

    let env = DotenvFile::new(&context.paths.env_file, context.config.command.env);
    let builder = match Builder::with_env_source(context.paths.clone(), options, &env, Toolchain::default()).await {
        Ok(builder) => builder,
        Err(err) => {
            log_build_error("*", &err);
            process::exit(1);
        }
    };

    let report = match builder.build_all(&args.ids).await {
        Ok(report) => report,
        Err(err) => {
            log_build_error("*", &err);
            process::exit(1);
        }
    };

    for built in &report.built {
        info!(command = %built.id, artifacts = built.artifacts.len(), "written to {}", built.output_dir.display());
        println!("Built command: {}", built.id);
    }
    if !report.is_success() {
        for (id, err) in &report.failed {
            log_build_error(id, err);
        }
        process::exit(1);
    }
    Ok(())
}
