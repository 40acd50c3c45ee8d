use alloy_primitives::Address;
use clap::{Parser, Subcommand};
use common::networks::{ChainId, NetworkRegistry};
use eyre::Result;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wave_client::{Portal, RpcWallet, SigningAgent, SimulatedWallet};

mod config;
mod terminal;

use config::PortalConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration directory
    #[arg(long, default_value = "./configs/dev")]
    config_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Use an in-memory wallet and ledger instead of a wallet endpoint
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show account and network without prompting
    Status,
    /// Connect the wallet and switch to the required network
    Connect,
    /// Send a wave and wait for confirmation
    Wave { message: String },
    /// Stream the feed; stdin lines are sent as waves
    Watch,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PortalConfig::load(&PathBuf::from(&cli.config_path)).await?;
    let settings = config.settings()?;

    tracing::info!(
        contract = %settings.contract,
        network = %settings.required_network.descriptor(),
        simulate = cli.simulate,
        "Config loaded"
    );

    let agent = if cli.simulate {
        Some(simulated_agent(settings.contract))
    } else {
        match RpcWallet::detect(config.agent.clone()).await {
            Some(wallet) => {
                wallet.spawn_notification_watcher();
                Some(SigningAgent::new(wallet))
            }
            None => {
                println!("No wallet found at {}. Start one or use --simulate.", config.agent.url);
                None
            }
        }
    };

    let mut portal = Portal::new(agent, NetworkRegistry::default(), settings);

    match cli.command {
        Command::Status => terminal::status(&mut portal).await,
        Command::Connect => terminal::connect(&mut portal).await,
        Command::Wave { message } => terminal::wave(&mut portal, &message).await,
        Command::Watch => terminal::watch(&mut portal).await,
    }
}

/// Wallet on Polygon Mainnet with a short history and a neighbour who waves now and then
fn simulated_agent(contract: Address) -> SigningAgent {
    let neighbour = Address::repeat_byte(0x42);
    let wallet = Arc::new(
        SimulatedWallet::new(contract)
            .with_accounts(vec![Address::repeat_byte(0xa1)])
            .on_chain(ChainId::new(0x89))
            .with_wave(neighbour, 1_650_000_000, "gm")
            .with_wave(neighbour, 1_650_000_600, "anyone here?")
            .with_wave(Address::repeat_byte(0x07), 1_650_001_200, "👋 from the testnet")
            .with_wave(neighbour, 1_650_001_800, "love this portal")
            .with_wave(Address::repeat_byte(0x07), 1_650_002_400, "wave back!"),
    );

    let ledger = wallet.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        ticker.tick().await;
        let mut count = 0u64;
        loop {
            ticker.tick().await;
            count += 1;
            ledger.external_wave(neighbour, &format!("still here ({})", count));
        }
    });

    SigningAgent::new(wallet)
}
