//! Live property streaming

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use memhook::{ChannelNotifier, EngineEvent, LoggingNotifier, PropertySnapshot, SyncEngine};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::cli::DriverArgs;
use crate::config::Config;

/// Handle the watch command
pub async fn handle(mapper: &str, driver_args: &DriverArgs, json: bool, once: bool) -> Result<()> {
    let config = Config::load()?;
    let catalog = super::catalog(&config)?;
    let file = super::find_mapper(catalog.as_ref(), mapper)?;
    let driver = super::driver(driver_args, &config)?;

    let channel = ChannelNotifier::default();
    let mut events = channel.subscribe();
    let engine = Arc::new(
        SyncEngine::new(catalog.clone(), config.engine.clone())
            .with_notifier(Arc::new(LoggingNotifier))
            .with_notifier(Arc::new(channel)),
    );

    engine
        .load(driver, &file.id)
        .await
        .with_context(|| format!("Failed to load mapper {}", file.display_name))?;

    if once {
        print_properties(&engine.properties()?, json)?;
        engine.reset().await;
        return Ok(());
    }

    let mut loaded = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.reset().await;
                break;
            }
            event = events.recv() => match event {
                Ok(EngineEvent::MapperLoaded { metadata }) => {
                    loaded = true;
                    eprintln!("Watching {} ({})", metadata.game_name, metadata.platform);
                }
                Ok(EngineEvent::InstanceReset) if loaded => {
                    bail!("The engine reset after a read failure; see the log for the cause");
                }
                Ok(EngineEvent::InstanceReset) => {}
                Ok(EngineEvent::PropertiesChanged { properties }) => print_properties(&properties, json)?,
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} engine events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    Ok(())
}

fn print_properties(properties: &[PropertySnapshot], json: bool) -> Result<()> {
    for property in properties {
        if json {
            println!("{}", serde_json::to_string(property)?);
        } else {
            println!("{} = {}", property.path, property.value);
        }
    }
    Ok(())
}
