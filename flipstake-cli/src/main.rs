mod commands;
mod config;

use clap::{Parser, Subcommand, ValueEnum};
use flipstake_core::Side;
use flipstake_engine::EngineError;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flipstake")]
#[command(about = "Escrow-backed two-player coin flip wagers")]
#[command(version)]
struct Cli {
    /// Data directory for the database and configuration
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Heads,
    Tails,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Heads => Side::Heads,
            SideArg::Tails => Side::Tails,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration for a network and treasury
    Init {
        /// Network (bitcoin, testnet, signet, regtest)
        #[arg(short, long, default_value = "regtest")]
        network: String,
        /// Address that collects fees and escrow residue
        treasury: String,
        /// Esplora endpoint; repeat to add fallbacks in order
        #[arg(long = "esplora", value_name = "URL")]
        esplora: Vec<String>,
    },
    /// Open a new wager on one side of the coin
    Create {
        /// Side the creator takes
        #[arg(value_enum)]
        side: SideArg,
        /// Stake in satoshis
        amount: u64,
        /// Address the creator pays from and is paid to
        payout_address: String,
    },
    /// Confirm the creator's escrow deposit
    ConfirmCreator {
        /// Wager ID
        wager_id: String,
        /// Deposit transaction id
        signature: String,
    },
    /// Claim an open wager
    Accept {
        /// Wager ID
        wager_id: String,
        /// Address the acceptor pays from and is paid to
        payout_address: String,
    },
    /// Confirm the acceptor's deposit and settle the wager
    ConfirmAcceptor {
        /// Wager ID
        wager_id: String,
        /// Deposit transaction id
        signature: String,
    },
    /// Give up a pending claim
    Abandon {
        /// Wager ID
        wager_id: String,
    },
    /// Cancel an unaccepted wager and refund the stake
    Cancel {
        /// Wager ID
        wager_id: String,
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show wager status, outcome and settlement legs
    Status {
        /// Wager ID
        wager_id: String,
    },
    /// List wagers open for acceptance
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Compare escrow balances against wager states
    Report,
    /// Recompute a stored outcome from its entropy
    Verify {
        /// Wager ID
        wager_id: String,
    },
    /// Check every configured Esplora endpoint
    Health,
    /// Release claims that outlived the abandon timeout
    Reap {
        /// Keep running and reap on an interval
        #[arg(short, long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "flipstake={},flipstake_engine={},flipstake_core={},audit={}",
            log_level, log_level, log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let result = match cli.command {
        Commands::Init {
            network,
            treasury,
            esplora,
        } => commands::init(&data_dir, &network, &treasury, esplora).await,
        Commands::Create {
            side,
            amount,
            payout_address,
        } => commands::create_wager(&data_dir, side.into(), amount, &payout_address).await,
        Commands::ConfirmCreator {
            wager_id,
            signature,
        } => commands::confirm_creator(&data_dir, &wager_id, &signature).await,
        Commands::Accept {
            wager_id,
            payout_address,
        } => commands::accept(&data_dir, &wager_id, &payout_address).await,
        Commands::ConfirmAcceptor {
            wager_id,
            signature,
        } => commands::confirm_acceptor(&data_dir, &wager_id, &signature).await,
        Commands::Abandon { wager_id } => commands::abandon(&data_dir, &wager_id).await,
        Commands::Cancel { wager_id, yes } => commands::cancel(&data_dir, &wager_id, yes).await,
        Commands::Status { wager_id } => commands::show_status(&data_dir, &wager_id).await,
        Commands::List { limit } => commands::list_wagers(&data_dir, limit).await,
        Commands::Report => commands::show_report(&data_dir).await,
        Commands::Verify { wager_id } => commands::verify(&data_dir, &wager_id).await,
        Commands::Health => commands::health(&data_dir).await,
        Commands::Reap { watch } => commands::reap(&data_dir, watch).await,
    };

    if let Err(e) = result {
        match e.downcast_ref::<EngineError>() {
            Some(engine_err) => eprintln!("Error: {}", engine_err.user_message()),
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }

    Ok(())
}
