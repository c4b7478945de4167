mod commands;
mod config;
mod logging;

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Multi-protocol managed file transfer runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/harbor/harbor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connection and transfer runtime
    Serve,

    /// Validate the configuration and load TLS material once
    CheckConfig,

    /// Ban a host through the defender overrides file
    ///
    /// Applied at the next start or SIGHUP.
    Ban {
        /// Host to ban
        host: IpAddr,

        /// Ban length in minutes
        #[arg(short, long, default_value_t = 60)]
        minutes: u32,
    },

    /// Lift a ban through the defender overrides file
    Unban {
        /// Host to unban
        host: IpAddr,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => commands::serve::run(&cli.config).await?,
        Commands::CheckConfig => commands::check::run(&cli.config).await?,
        Commands::Ban { host, minutes } => {
            commands::bans::ban(&cli.config, host, minutes).await?;
        }
        Commands::Unban { host } => commands::bans::unban(&cli.config, host).await?,
        Commands::InitConfig { force } => commands::init::run(&cli.config, force).await?,
    }

    Ok(())
}
