mod commands;
mod output;
mod utils;

use clap::Parser;
use rbdsr_core::DriverConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rbdsr")]
#[command(about = "Ceph RBD storage repository driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    #[arg(
        long,
        global = true,
        help = "Repository layout",
        value_enum,
        default_value = "rbd"
    )]
    driver: commands::DriverArg,

    #[arg(
        long,
        global = true,
        env = "RBDSR_CONFIG",
        help = "Path to the driver settings file (default: /etc/rbdsr/config.yaml)"
    )]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Quiet output")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Output format",
        value_enum,
        default_value = "table"
    )]
    format: output::OutputFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .init();

    let result = match DriverConfig::load(cli.config) {
        Ok(config) => commands::execute(cli.command, cli.driver.into(), config, cli.format).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            output::print_failure(cli.format, &e);
            std::process::exit(1);
        }
    }
}
