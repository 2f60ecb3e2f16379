//! The sync engine.
//!
//! A load wires driver, memory mirror, scripts and property graph into a
//! [`Session`], validates it with one read cycle and then hands it to a
//! background poll loop. Any failure, during load or later in the loop,
//! drops the session and tells every notifier the instance was reset.
//!
//! Each session carries a generation number. A poll loop only ever resets
//! the session it was started for, so a loop outliving its session (while a
//! newer load is underway or has finished) just stops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::mapper::{self, Mapper, MapperCatalog, MapperMetadata, PropertySnapshot};
use crate::memory::{MemoryAddress, MemoryAddressBlock, MemoryStore};
use crate::notifier::ClientNotifier;
use crate::platform::Platform;
use crate::script::{ScriptBindings, ScriptRuntime, POSTPROCESSOR, PREPROCESSOR};
use crate::settings::Settings;

/// Everything a loaded mapper runs against.
struct Session {
    generation: u64,
    driver: Arc<dyn Driver>,
    mapper: Arc<Mapper>,
    platform: Platform,
    blocks: Vec<MemoryAddressBlock>,
    memory: Arc<RwLock<MemoryStore>>,
    bindings: ScriptBindings,
    scripts: ScriptRuntime,
    cancelled: AtomicBool,
    /// Serializes read cycles between the poll loop and on-demand reads
    cycle: Mutex<()>,
}

impl Session {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub mapper: Option<MapperMetadata>,
    pub platform: Option<Platform>,
    pub driver: Option<String>,
    pub blocks: usize,
}

pub struct SyncEngine {
    catalog: Arc<dyn MapperCatalog>,
    notifiers: Vec<Arc<dyn ClientNotifier>>,
    settings: Settings,
    session: RwLock<Option<Arc<Session>>>,
    generation: AtomicU64,
    load_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(catalog: Arc<dyn MapperCatalog>, settings: Settings) -> Self {
        Self {
            catalog,
            notifiers: Vec::new(),
            settings,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            load_lock: Mutex::new(()),
        }
    }

    /// Register a notifier. Notifiers are called in registration order.
    pub fn with_notifier(mut self, notifier: Arc<dyn ClientNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn catalog(&self) -> &Arc<dyn MapperCatalog> {
        &self.catalog
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn require(&self, what: &'static str) -> Result<Arc<Session>> {
        self.current().ok_or(Error::NotInitialized(what))
    }

    /// Load the mapper `mapper_id` against `driver` and start polling.
    ///
    /// Any prior session is reset first. On failure the engine is reset
    /// again and left unloaded before the error is returned.
    pub async fn load(self: &Arc<Self>, driver: Arc<dyn Driver>, mapper_id: &str) -> Result<()> {
        let _loading = self.load_lock.lock().await;

        self.reset_inner().await;

        let session = match self.build_session(driver, mapper_id).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!("An error occurred when loading the mapper: {}", e);
                self.reset_inner().await;
                return Err(e);
            }
        };

        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&session));

        for notifier in &self.notifiers {
            if let Err(e) = notifier.on_mapper_loaded(&session.mapper).await {
                error!("An error occurred when loading the mapper: {}", e);
                self.reset_inner().await;
                return Err(e);
            }
        }

        self.spawn_poll_loop(Arc::clone(&session));

        info!(
            "Loaded mapper for {} ({})",
            session.mapper.metadata.game_name, session.mapper.metadata.id
        );
        Ok(())
    }

    async fn build_session(&self, driver: Arc<dyn Driver>, mapper_id: &str) -> Result<Session> {
        debug!("Creating mapper instance with driver {}", driver.proper_name());

        driver.establish_connection().await?;

        let file = self
            .catalog
            .resolve(mapper_id)
            .ok_or_else(|| Error::MapperNotFound(mapper_id.to_string()))?;
        let mapper = Arc::new(mapper::load_mapper_file(&file)?);

        let platform: Platform = mapper.metadata.platform.parse()?;

        let memory = Arc::new(RwLock::new(MemoryStore::new()));
        let bindings = ScriptBindings::new(Arc::clone(&mapper), Arc::clone(&memory));
        let scripts = ScriptRuntime::new(
            mapper.global_script.as_deref().unwrap_or_default(),
            &bindings,
            self.settings.script_limits(),
        )?;

        let blocks = mapper.block_plan(platform);
        if mapper.read_ranges.is_empty() {
            info!("Using default {} memory read ranges", platform);
        } else {
            info!("Using {} memory read ranges from mapper", blocks.len());
        }

        let session = Session {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            driver,
            mapper,
            platform,
            blocks,
            memory,
            bindings,
            scripts,
            cancelled: AtomicBool::new(false),
            cycle: Mutex::new(()),
        };

        // Validate the whole pipeline before declaring success
        self.run_cycle(&session).await?;

        Ok(session)
    }

    /// Run one read cycle now. A failure resets the engine.
    pub async fn read(&self) -> Result<()> {
        let session = self.require("no mapper is loaded")?;
        if let Err(e) = self.run_cycle(&session).await {
            error!("An error occurred when reading the mapper: {}", e);
            self.reset_generation(session.generation).await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_cycle(&self, session: &Session) -> Result<()> {
        let _cycle = session.cycle.lock().await;
        let started = Instant::now();

        let results = session.driver.read_bytes(&session.blocks).await?;
        {
            let mut memory = session.memory.write().unwrap_or_else(|e| e.into_inner());
            for result in &results {
                memory.apply(result);
            }
        }

        let properties = &session.mapper.properties;
        properties.clear_changes();

        let proceed = if session.mapper.has_global_preprocessor {
            session.scripts.invoke(PREPROCESSOR)? != Some(Value::Bool(false))
        } else {
            true
        };

        if proceed {
            properties.process_all(&session.memory, &session.scripts)?;

            if session.mapper.has_global_postprocessor {
                session.scripts.invoke(POSTPROCESSOR)?;
            }

            for write in session.bindings.writes.drain() {
                session.driver.write_bytes(write.address, &write.bytes).await?;
            }

            let changed = properties.changed();
            if !changed.is_empty() {
                for notifier in &self.notifiers {
                    notifier
                        .on_properties_changed(&changed)
                        .await
                        .map_err(|e| Error::notification(changed.len(), e))?;
                }
            }
        } else {
            let dropped = session.bindings.writes.drain().len();
            debug!("Preprocessor skipped this cycle, dropped {} queued writes", dropped);
        }

        if self.settings.show_read_loop_statistics {
            info!("Instance loop took {} ms", started.elapsed().as_millis());
        }

        Ok(())
    }

    fn spawn_poll_loop(self: &Arc<Self>, session: Arc<Session>) {
        let engine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let delay = session.driver.delay_between_reads();
            loop {
                tokio::time::sleep(delay).await;

                if session.is_cancelled() {
                    break;
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };

                if let Err(e) = engine.run_cycle(&session).await {
                    error!("An error occurred when read looping the mapper: {}", e);
                    engine.reset_generation(session.generation).await;
                    break;
                }
            }
            debug!("Poll loop for session {} stopped", session.generation);
        });
    }

    /// Drop the current session and notify every notifier.
    pub async fn reset(&self) {
        let _loading = self.load_lock.lock().await;
        self.reset_inner().await;
    }

    async fn reset_inner(&self) {
        let previous = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = previous {
            session.cancel();
        }
        self.notify_reset().await;
    }

    /// Reset only if `generation` is still the live session.
    async fn reset_generation(&self, generation: u64) {
        let previous = {
            let mut slot = self.session.write().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(session) if session.generation == generation => slot.take(),
                _ => None,
            }
        };

        match previous {
            Some(session) => {
                session.cancel();
                self.notify_reset().await;
            }
            None => debug!("Session {} was already replaced", generation),
        }
    }

    async fn notify_reset(&self) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.on_instance_reset().await {
                warn!("Notifier failed to handle instance reset: {}", e);
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        match self.current() {
            Some(session) => EngineStatus {
                initialized: true,
                mapper: Some(session.mapper.metadata.clone()),
                platform: Some(session.platform),
                driver: Some(session.driver.proper_name().to_string()),
                blocks: session.blocks.len(),
            },
            None => EngineStatus {
                initialized: false,
                mapper: None,
                platform: None,
                driver: None,
                blocks: 0,
            },
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    /// Evaluate `expression` with `x` bound to `value`.
    pub fn evaluate_expression(&self, expression: &str, value: Value) -> Result<Value> {
        let session = self.require("no mapper is loaded to evaluate against")?;
        session
            .scripts
            .evaluate_expression(expression, value)
            .inspect_err(|e| error!("Expression evaluation failed: {}", e))
    }

    /// Call a predicate with a property. `None` when no function is named.
    pub fn execute_predicate(
        &self,
        function: Option<&str>,
        property: &PropertySnapshot,
    ) -> Result<Option<bool>> {
        let session = self.require("no mapper is loaded to run functions")?;
        session
            .scripts
            .invoke_boolean_function(function, property)
            .inspect_err(|e| error!("Predicate {:?} failed: {}", function, e))
    }

    pub fn execute_byte_transform(
        &self,
        function: &str,
        bytes: &[u8],
        property: &PropertySnapshot,
    ) -> Result<Vec<u8>> {
        let session = self.require("no mapper is loaded to run functions")?;
        session
            .scripts
            .invoke_byte_transform(function, bytes, property)
            .inspect_err(|e| error!("Byte transform {} failed: {}", function, e))
    }

    /// Write straight through to the driver.
    pub async fn write_bytes(&self, address: MemoryAddress, bytes: &[u8]) -> Result<()> {
        let session = self.require("no driver is connected")?;
        session.driver.write_bytes(address, bytes).await
    }

    pub fn property(&self, path: &str) -> Result<Option<PropertySnapshot>> {
        let session = self.require("no mapper is loaded")?;
        Ok(session.mapper.properties.snapshot(path))
    }

    pub fn properties(&self) -> Result<Vec<PropertySnapshot>> {
        let session = self.require("no mapper is loaded")?;
        Ok(session.mapper.properties.snapshots())
    }

    /// Copy of the script state map.
    pub fn state(&self) -> Result<Value> {
        Ok(self.require("no mapper is loaded")?.bindings.state.to_value())
    }

    /// Copy of the script variable map.
    pub fn variables(&self) -> Result<Value> {
        Ok(self.require("no mapper is loaded")?.bindings.variables.to_value())
    }
}
