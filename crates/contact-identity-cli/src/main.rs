use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = contact_identity_cli::Cli::parse();
    contact_identity_cli::init_logging();
    contact_identity_cli::run_cli(cli)
}
