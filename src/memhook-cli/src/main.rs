mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memhook=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Mappers { json } => {
            commands::mappers::handle(json)?;
        }

        Commands::Watch {
            mapper,
            driver,
            json,
            once,
        } => {
            commands::watch::handle(&mapper, &driver, json, once).await?;
        }

        Commands::Capture {
            mapper,
            output,
            driver,
        } => {
            commands::capture::handle(&mapper, &output, &driver).await?;
        }

        Commands::Configure {
            mapper_folder,
            custom_mapper_folder,
            delay_ms,
            statistics,
            max_operations,
            show,
        } => {
            let changes = commands::configure::Changes {
                mapper_folder,
                custom_mapper_folder,
                delay_ms,
                statistics,
                max_operations,
            };
            commands::configure::handle(changes, show)?;
        }
    }

    Ok(())
}
