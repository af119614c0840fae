use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

mod commands;

#[derive(Parser)]
#[command(name = "harbor", about = "Harbor hosting runtime tools")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the backends and routes a config declares
    Backends {
        #[arg(long, default_value = "harbor.toml")]
        config: PathBuf,
    },
    /// Start every backend, probe every route, then stop
    Check {
        #[arg(long, default_value = "harbor.toml")]
        config: PathBuf,
        /// Host name used in reported instance addresses
        #[arg(long, default_value = "localhost")]
        host: String,
    },
    /// Round-trip a payload through the echo service
    Echo(EchoArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["endpoint", "loopback"])))]
struct EchoArgs {
    /// API server URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Use the in-process echo service
    #[arg(long)]
    loopback: bool,

    /// Deadline in seconds
    #[arg(long, default_value_t = 60.0)]
    deadline: f64,

    /// Comma-separated payload bytes
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4")]
    payload: Vec<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let subscriber = fmt()
        .with_env_filter(EnvFilter::from_env("HARBOR_LOG"))
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Command::Backends { config } => commands::backends(&config).await,
        Command::Check { config, host } => commands::check(&config, &host).await,
        Command::Echo(args) => {
            let endpoint = if args.loopback { None } else { args.endpoint };
            commands::echo(endpoint, args.deadline, args.payload).await
        }
    }
}
