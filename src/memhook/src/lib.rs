//! # memhook
//!
//! Keeps a local mirror of an emulator's memory in sync and derives named,
//! typed properties from it, driven by user-authored mappers.
//!
//! Each read cycle fetches the mapper's memory blocks through a [`Driver`],
//! runs the mapper's optional preprocessor script, recomputes every
//! property, runs the optional postprocessor and reports the properties
//! that changed to every registered [`ClientNotifier`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use memhook::{
//!     LoggingNotifier, MapperCatalog, MapperFilesystemProvider, Settings, StaticDriver, SyncEngine,
//! };
//!
//! # async fn run() -> memhook::Result<()> {
//! let catalog = Arc::new(MapperFilesystemProvider::new("mappers", None));
//! let engine = Arc::new(
//!     SyncEngine::new(catalog.clone(), Settings::default())
//!         .with_notifier(Arc::new(LoggingNotifier)),
//! );
//!
//! let driver = Arc::new(StaticDriver::load_snapshot(
//!     "snapshot.json".as_ref(),
//!     Duration::from_millis(5),
//! )?);
//! let id = catalog.mapper_files()[0].id.clone();
//! engine.load(driver, &id).await?;
//!
//! println!("{:?}", engine.property("player.health")?);
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod memory;
pub mod notifier;
pub mod platform;
pub mod script;
pub mod settings;

#[doc(inline)]
pub use driver::{Driver, ProcessDriver, ProcessTarget, StaticDriver};
#[doc(inline)]
pub use engine::{EngineStatus, SyncEngine};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use mapper::{
    Mapper, MapperCatalog, MapperFile, MapperFilesystemProvider, MapperKind, MapperMetadata,
    PropertySnapshot, PropertyType,
};
#[doc(inline)]
pub use memory::{MemoryAddress, MemoryAddressBlock, MemoryAddressBlockResult, MemoryStore};
#[doc(inline)]
pub use notifier::{ChannelNotifier, ClientNotifier, EngineEvent, LoggingNotifier};
#[doc(inline)]
pub use platform::Platform;
#[doc(inline)]
pub use script::{ScriptLimits, ScriptRuntime};
#[doc(inline)]
pub use settings::Settings;
