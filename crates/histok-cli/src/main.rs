use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = histok_cli::Cli::parse();
    let code = histok_cli::run_cli(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
