use anyhow::Result;
use clap::{Parser, Subcommand};
use schenker_tracker::{ShipmentLookupService, config::Config};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// CLI to search DB Schenker for shipment data
#[derive(Parser)]
#[command(name = "schenker-tracker")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for shipment data given a container identifier and a Bill of Ladens identifier
    Search {
        /// Container identifier
        container: String,
        /// Master bill of ladens identifier
        mbl: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "schenker_tracker=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Search { container, mbl } => {
            let service = ShipmentLookupService::chromium(config);

            match service.lookup(&container, &mbl).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    println!();
                    println!("Couldn't find data with given paramenters: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
