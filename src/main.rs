use std::env;

use clap::Parser;

mod cli;

use cli::{Cli, CliContext};
use cmdforge::logger::init_tracing;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_file.clone())?;

    let context = CliContext::load(env::current_dir()?).await?;
    cli::execute(&context, cli.command).await
}
