mod commands;

use anyhow::Result;
use clap::Parser;

use kjarni_awq_cli::{verbosity_to_log_level, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG, when set, wins over -v
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(verbosity_to_log_level(cli.verbose)),
    )
    .init();

    match cli.command {
        Commands::Quantize(args) => commands::quantize::run(&args),
        Commands::InspectConfig { file } => commands::inspect::run(&file),
    }
}
