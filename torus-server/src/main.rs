mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::run_node;

#[derive(Parser)]
#[command(name = "torus-server")]
#[command(about = "Storage peer for a Torus block cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a storage peer
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,
    },
    /// Print the ring described by the configuration
    Ring {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.yaml")]
        conf: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(cfg) => cfg,
        Err(error) => {
            tracing::error!("Failed to load config: {}", error);
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf } => {
            tracing::info!("Starting Torus peer with config: {}", conf);
            let cfg = load_config(&conf);

            if let Err(error) = run_node(cfg).await {
                if error.is_fatal() {
                    tracing::error!("Fatal error, node stopped: {}", error);
                } else {
                    tracing::error!("Server error: {}", error);
                }
                std::process::exit(1);
            }
        }
        Commands::Ring { conf, json } => {
            let cfg = load_config(&conf);
            match cfg.ring_builder().build() {
                Ok(ring) if json => {
                    let summary = serde_json::json!({
                        "version": ring.version(),
                        "members": ring.members(),
                        "description": ring.describe(),
                    });
                    println!("{}", summary);
                }
                Ok(ring) => {
                    println!("{}", ring.describe());
                    for member in ring.members() {
                        println!("  {}", member);
                    }
                }
                Err(error) => {
                    tracing::error!("Failed to build ring: {}", error);
                    std::process::exit(2);
                }
            }
        }
    }
}
