use anyhow::Result;
use chaumix::config::{self, ClientConfig};
use chaumix::coordinator::{CoordinatorTransport, SatoshiClient};
use chaumix::RoundState;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn default_config_path() -> PathBuf {
    config::default_path()
}

#[derive(Parser)]
#[command(name = "chaumix")]
#[command(about = "Chaumian CoinJoin client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Connection {
    #[arg(long, default_value_os_t = default_config_path())]
    config: PathBuf,
    /// Override the configured coordinator URL
    #[arg(long)]
    coordinator: Option<String>,
    /// Tor SOCKS5 address, e.g. 127.0.0.1:9050
    #[arg(long)]
    tor: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Command {
    /// List every round the coordinator runs
    States {
        #[command(flatten)]
        conn: Connection,
    },

    /// Show one round
    Round {
        #[arg(long)]
        id: u64,
        #[command(flatten)]
        conn: Connection,
    },

    /// Show the round currently accepting inputs
    Registrable {
        #[command(flatten)]
        conn: Connection,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        #[arg(long, default_value_os_t = default_config_path())]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show {
        #[arg(long, default_value_os_t = default_config_path())]
        path: PathBuf,
    },
}

fn satoshi(conn: Connection) -> Result<SatoshiClient> {
    let mut cfg = ClientConfig::load_or_default(&conn.config)?;
    if let Some(url) = conn.coordinator {
        cfg.coordinator_url = url;
    }
    if conn.tor.is_some() {
        cfg.tor_socks5 = conn.tor;
    }
    cfg.validate()?;
    Ok(SatoshiClient::new(CoordinatorTransport::new(&cfg)?))
}

fn print_round(state: &RoundState) {
    println!("Round {}", state.round_id);
    println!("  Phase:          {}", state.phase);
    println!("  Denomination:   {}", state.denomination);
    println!("  Mixing levels:  {}", state.mixing_level_count());
    println!("  Fee per input:  {}", state.fee_per_input);
    println!("  Fee per output: {}", state.fee_per_output);
    println!("  Coordinator:    {}%", state.coordinator_fee_percent);
    println!("  Max inputs:     {}", state.maximum_input_count_per_peer);
    println!("  Peers:          {}/{}", state.registered_peer_count, state.required_peer_count);
    println!("  Timeout:        {}s", state.registration_timeout);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chaumix=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::States { conn } => {
            let states = satoshi(conn)?.get_all_round_states().await?;
            if states.is_empty() {
                println!("No running rounds.");
            }
            for state in &states {
                print_round(state);
            }
            Ok(())
        }
        Command::Round { id, conn } => {
            let state = satoshi(conn)?.get_round_state(id).await?;
            print_round(&state);
            Ok(())
        }
        Command::Registrable { conn } => {
            let state = satoshi(conn)?.get_registrable_round_state().await?;
            print_round(&state);
            Ok(())
        }
        Command::Config { action } => handle_config(action),
    }
}

fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ClientConfig::default().save(&path)?;
            println!("Config written to {}", path.display());
        }
        ConfigAction::Show { path } => {
            let cfg = ClientConfig::load_or_default(&path)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }
    Ok(())
}
