use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use cmdforge::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory. Defaults to `<base>/schemas`
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = args.out.unwrap_or_else(|| context.paths.base.join("schemas"));
    let written = write_schema(&out_dir).await?;
    println!("{} schemas written to {}", written.len(), out_dir.display());
    Ok(())
}
