//! Client notification.
//!
//! The engine fans every lifecycle and change event out to each registered
//! [`ClientNotifier`], in registration order.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::error::Result;
use crate::mapper::{Mapper, MapperMetadata, PropertySnapshot};

#[async_trait]
pub trait ClientNotifier: Send + Sync {
    /// The engine dropped its session (explicitly, on a failed load, or after a loop fault).
    async fn on_instance_reset(&self) -> Result<()>;

    async fn on_mapper_loaded(&self, mapper: &Mapper) -> Result<()>;

    /// Called once per cycle with every property whose change set is non-empty.
    async fn on_properties_changed(&self, properties: &[PropertySnapshot]) -> Result<()>;
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl ClientNotifier for LoggingNotifier {
    async fn on_instance_reset(&self) -> Result<()> {
        info!("Instance reset");
        Ok(())
    }

    async fn on_mapper_loaded(&self, mapper: &Mapper) -> Result<()> {
        info!(
            "Mapper loaded: {} ({}, {} properties)",
            mapper.metadata.game_name,
            mapper.metadata.platform,
            mapper.properties.len()
        );
        Ok(())
    }

    async fn on_properties_changed(&self, properties: &[PropertySnapshot]) -> Result<()> {
        for property in properties {
            debug!("{} = {}", property.path, property.value);
        }
        Ok(())
    }
}

/// An engine event as published on a [`ChannelNotifier`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceReset,
    MapperLoaded { metadata: MapperMetadata },
    PropertiesChanged { properties: Vec<PropertySnapshot> },
}

/// Republishes events on a broadcast channel.
///
/// Having no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: broadcast::Sender<EngineEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: EngineEvent) -> Result<()> {
        // Fails only when every receiver has been dropped.
        if self.sender.send(event).is_err() {
            trace!("No subscribers for engine event");
        }
        Ok(())
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ClientNotifier for ChannelNotifier {
    async fn on_instance_reset(&self) -> Result<()> {
        self.publish(EngineEvent::InstanceReset)
    }

    async fn on_mapper_loaded(&self, mapper: &Mapper) -> Result<()> {
        self.publish(EngineEvent::MapperLoaded {
            metadata: mapper.metadata.clone(),
        })
    }

    async fn on_properties_changed(&self, properties: &[PropertySnapshot]) -> Result<()> {
        self.publish(EngineEvent::PropertiesChanged {
            properties: properties.to_vec(),
        })
    }
}
