use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use synology_relay::comms;
use synology_relay::relay::config::{Config, ConfigStore, RelaySettings};
use synology_relay::utils;

#[derive(Parser)]
#[command(name = "synology-relay", version, about = "Synology NAS webhook relay for WeCom")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "data/config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook server
    Serve {
        #[arg(long, default_value_t = 5080)]
        port: u16,
    },
    /// Validate the config file and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let settings = RelaySettings::from_env();

    match args.command.unwrap_or(Commands::Serve { port: 5080 }) {
        Commands::Serve { port } => {
            info!(version = synology_relay::VERSION, config = %args.config, "starting relay");
            let config = ConfigStore::watch(&args.config).await?;
            comms::local_api::serve(config, port, settings).await?;
        }
        Commands::CheckConfig => {
            let config = Config::from_file(&args.config)?;
            println!("corp_id:        {}", config.corp_id);
            println!("agent_id:       {}", config.agent_id_number());
            println!("push base url:  {}", config.base_url());
            println!("ready:          {}", config.is_ready());
            println!("can verify:     {}", config.can_verify());
            println!("http timeout:   {}s", settings.http_timeout.as_secs());
            println!("refresh policy: {:?}", settings.refresh_policy);
        }
    }

    Ok(())
}
