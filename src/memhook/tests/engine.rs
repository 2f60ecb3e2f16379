//! End-to-end engine behaviour through the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use memhook::{
    ClientNotifier, Error, Mapper, MapperCatalog, MapperFilesystemProvider, PropertySnapshot,
    Result, Settings, StaticDriver, SyncEngine,
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Reset,
    Loaded(String),
    Changed(Vec<(String, Value)>),
}

/// Notifier that records every event
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    fail_changes: AtomicBool,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn changes(&self) -> Vec<Vec<(String, Value)>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Changed(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ClientNotifier for Recorder {
    async fn on_instance_reset(&self) -> Result<()> {
        self.events.lock().unwrap().push(Event::Reset);
        Ok(())
    }

    async fn on_mapper_loaded(&self, mapper: &Mapper) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Loaded(mapper.metadata.game_name.clone()));
        Ok(())
    }

    async fn on_properties_changed(&self, properties: &[PropertySnapshot]) -> Result<()> {
        if self.fail_changes.load(Ordering::SeqCst) {
            return Err(Error::Notifier("client went away".into()));
        }
        self.events.lock().unwrap().push(Event::Changed(
            properties
                .iter()
                .map(|p| (p.path.clone(), p.value.clone()))
                .collect(),
        ));
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    engine: Arc<SyncEngine>,
    recorder: Arc<Recorder>,
    catalog: Arc<MapperFilesystemProvider>,
}

impl Fixture {
    fn new(mapper: &str, script: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("game.xml"), mapper).unwrap();
        if let Some(script) = script {
            std::fs::write(dir.path().join("game.rhai"), script).unwrap();
        }

        let catalog = Arc::new(MapperFilesystemProvider::new(dir.path(), None));
        let recorder = Arc::new(Recorder::default());
        let engine = Arc::new(
            SyncEngine::new(catalog.clone(), Settings::default()).with_notifier(recorder.clone()),
        );

        Self {
            _dir: dir,
            engine,
            recorder,
            catalog,
        }
    }

    fn mapper_id(&self) -> String {
        self.catalog.mapper_files()[0].id.clone()
    }

    async fn load(&self, driver: &Arc<StaticDriver>) -> Result<()> {
        self.engine.load(driver.clone(), &self.mapper_id()).await
    }
}

const HEALTH_MAPPER: &str = r#"<mapper id="health" name="Health Quest" platform="NES">
  <memory>
    <read start="0x0000" end="0x00FF" />
  </memory>
  <properties>
    <property path="health" type="uint" address="0x0010" length="1" />
  </properties>
</mapper>"#;

/// A driver whose poll loop never fires during a test
fn idle_driver() -> Arc<StaticDriver> {
    let driver = Arc::new(StaticDriver::new(Duration::from_secs(3600)));
    driver.poke(0x0000, &[0; 0x100]);
    driver
}

async fn wait_until_unloaded(engine: &SyncEngine) {
    for _ in 0..200 {
        if !engine.status().initialized {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine never reset");
}

#[tokio::test]
async fn test_health_changes_across_cycles() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = idle_driver();
    driver.poke(0x10, &[10]);

    fixture.load(&driver).await.unwrap();
    assert_eq!(
        fixture.recorder.changes(),
        vec![vec![("health".to_string(), json!(10))]]
    );

    driver.poke(0x10, &[20]);
    fixture.engine.read().await.unwrap();
    fixture.engine.read().await.unwrap();

    assert_eq!(
        fixture.recorder.changes(),
        vec![
            vec![("health".to_string(), json!(10))],
            vec![("health".to_string(), json!(20))],
        ]
    );
    assert_eq!(
        fixture.engine.property("health").unwrap().unwrap().value,
        json!(20)
    );
}

#[tokio::test]
async fn test_changes_are_cleared_every_cycle() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = idle_driver();
    driver.poke(0x10, &[10]);

    fixture.load(&driver).await.unwrap();
    assert!(!fixture.engine.property("health").unwrap().unwrap().fields_changed.is_empty());

    fixture.engine.read().await.unwrap();
    assert!(fixture.engine.property("health").unwrap().unwrap().fields_changed.is_empty());
}

#[tokio::test]
async fn test_successful_load_notifies_once() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = idle_driver();

    fixture.load(&driver).await.unwrap();

    let events = fixture.recorder.events();
    assert_eq!(events.first(), Some(&Event::Reset));
    let loaded: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::Loaded(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(loaded.len(), 1);
    assert!(!events[loaded[0]..].contains(&Event::Reset));

    let status = fixture.engine.status();
    assert!(status.initialized);
    assert_eq!(status.blocks, 1);
    assert_eq!(status.mapper.unwrap().game_name, "Health Quest");
}

#[tokio::test]
async fn test_reload_resets_prior_session_first() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = idle_driver();

    fixture.load(&driver).await.unwrap();
    fixture.recorder.clear();

    fixture.load(&driver).await.unwrap();
    let events = fixture.recorder.events();
    assert_eq!(events.first(), Some(&Event::Reset));
    assert_eq!(events.last(), Some(&Event::Loaded("Health Quest".into())));
    assert_eq!(events.iter().filter(|e| **e == Event::Reset).count(), 1);
}

#[tokio::test]
async fn test_unknown_platform_leaves_engine_unloaded() {
    let mapper = HEALTH_MAPPER.replace("NES", "N64");
    let fixture = Fixture::new(&mapper, None);

    let err = fixture.load(&idle_driver()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownPlatform(ref p) if p == "N64"));
    assert!(!fixture.engine.status().initialized);
    assert_eq!(fixture.recorder.events().last(), Some(&Event::Reset));
}

#[tokio::test]
async fn test_unknown_mapper_id() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);

    let err = fixture
        .engine
        .load(idle_driver(), "ffffffffffffffffffffffffffffffff")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MapperNotFound(_)));
    assert!(!fixture.engine.status().initialized);
}

#[tokio::test]
async fn test_deleted_mapper_file() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let id = fixture.mapper_id();
    std::fs::remove_file(&fixture.catalog.resolve(&id).unwrap().absolute_path).unwrap();

    let err = fixture.engine.load(idle_driver(), &id).await.unwrap_err();
    assert!(matches!(err, Error::MapperFileMissing(_)));
}

#[tokio::test]
async fn test_preprocessor_false_skips_cycle() {
    let fixture = Fixture::new(HEALTH_MAPPER, Some("fn preprocessor() { false }\nexport { preprocessor };"));
    let driver = idle_driver();
    driver.poke(0x10, &[10]);

    fixture.load(&driver).await.unwrap();
    fixture.engine.read().await.unwrap();

    assert!(fixture.recorder.changes().is_empty());
    assert_eq!(
        fixture.engine.property("health").unwrap().unwrap().value,
        Value::Null
    );
}

#[tokio::test]
async fn test_skipped_cycle_discards_script_writes() {
    let script = r#"
fn preprocessor() {
    driver_write(0x20, [9]);
    false
}
export { preprocessor };
"#;
    let fixture = Fixture::new(HEALTH_MAPPER, Some(script));
    let driver = idle_driver();

    fixture.load(&driver).await.unwrap();
    fixture.engine.read().await.unwrap();

    assert_eq!(driver.peek(0x20, 1), Some(vec![0]));
}

#[tokio::test]
async fn test_script_hooks_and_script_owned_properties() {
    let mapper = r#"<mapper id="hooks" name="Hooks" platform="GB">
  <memory><read start="0x00" end="0x3F" /></memory>
  <properties>
    <property path="health" address="0x10" />
    <property path="scaled" address="0x11" after-read="x * 3" />
    <property path="inverted" address="0x12" before-read="invert" />
    <property path="gated" address="0x13" read-condition="never" />
    <group name="derived">
      <property path="doubled" />
    </group>
  </properties>
</mapper>"#;
    let script = r#"
fn invert(bytes, property) { bytes.map(|b| 255 - b) }
fn never(property) { property.path != "gated" }
fn postprocessor() {
    set_property_value("derived.doubled", property_value("health") * 2);
    state_set("cycles", (state_get("cycles") ?? 0) + 1);
    driver_write(0x30, [7, 8]);
}
"#;
    let fixture = Fixture::new(mapper, Some(script));
    let driver = Arc::new(StaticDriver::new(Duration::from_secs(3600)));
    driver.poke(0x00, &[0; 0x40]);
    driver.poke(0x10, &[21, 5, 200, 9]);

    fixture.load(&driver).await.unwrap();

    let value = |path: &str| fixture.engine.property(path).unwrap().unwrap().value;
    assert_eq!(value("health"), json!(21));
    assert_eq!(value("scaled"), json!(15));
    assert_eq!(value("inverted"), json!(55));
    assert_eq!(value("gated"), Value::Null);
    assert_eq!(value("derived.doubled"), json!(42));
    assert_eq!(fixture.engine.state().unwrap()["cycles"], json!(1));
    assert_eq!(driver.peek(0x30, 2), Some(vec![7, 8]));
}

#[tokio::test]
async fn test_property_failure_resets_engine() {
    let mapper = HEALTH_MAPPER.replace("length=\"1\"", "length=\"1\" before-read=\"check\"");
    let script = r#"fn check(bytes, property) { if bytes[0] == 255 { throw "corrupt"; } bytes }"#;
    let fixture = Fixture::new(&mapper, Some(script));
    let driver = idle_driver();

    fixture.load(&driver).await.unwrap();
    fixture.recorder.clear();

    driver.poke(0x10, &[255]);
    let err = fixture.engine.read().await.unwrap_err();
    assert!(err.to_string().starts_with("Property health failed to run processor"));

    assert_eq!(fixture.recorder.events(), vec![Event::Reset]);
    assert!(matches!(
        fixture.engine.read().await,
        Err(Error::NotInitialized(_))
    ));
}

#[tokio::test]
async fn test_poll_loop_fault_resets_engine() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = Arc::new(StaticDriver::new(Duration::from_millis(5)));
    driver.poke(0x0000, &[0; 0x100]);

    fixture.load(&driver).await.unwrap();
    driver.set_fail_reads(true);

    wait_until_unloaded(&fixture.engine).await;
    assert_eq!(fixture.recorder.events().last(), Some(&Event::Reset));
    assert!(matches!(
        fixture.engine.read().await,
        Err(Error::NotInitialized(_))
    ));
}

#[tokio::test]
async fn test_poll_loop_picks_up_changes() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = Arc::new(StaticDriver::new(Duration::from_millis(5)));
    driver.poke(0x0000, &[0; 0x100]);
    driver.poke(0x10, &[1]);

    fixture.load(&driver).await.unwrap();
    driver.poke(0x10, &[2]);

    for _ in 0..200 {
        if fixture.engine.property("health").unwrap().unwrap().value == json!(2) {
            fixture.engine.reset().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("poll loop never saw the new value");
}

/// Let any in-flight cycle finish, then check no further reads happen.
async fn assert_reads_stopped(driver: &StaticDriver) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    let settled = driver.read_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.read_count(), settled);
}

async fn wait_for_reads(driver: &StaticDriver, count: usize) {
    for _ in 0..200 {
        if driver.read_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("poll loop never read");
}

#[tokio::test]
async fn test_reset_stops_poll_loop() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let driver = Arc::new(StaticDriver::new(Duration::from_millis(2)));
    driver.poke(0x0000, &[0; 0x100]);

    fixture.load(&driver).await.unwrap();
    wait_for_reads(&driver, 3).await;

    fixture.engine.reset().await;
    assert!(!fixture.engine.status().initialized);
    assert_reads_stopped(&driver).await;
}

#[tokio::test]
async fn test_reload_stops_previous_poll_loop() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    let fast = Arc::new(StaticDriver::new(Duration::from_millis(2)));
    fast.poke(0x0000, &[0; 0x100]);

    fixture.load(&fast).await.unwrap();
    wait_for_reads(&fast, 3).await;

    fixture.load(&idle_driver()).await.unwrap();
    assert!(fixture.engine.status().initialized);
    assert_reads_stopped(&fast).await;
}

#[tokio::test]
async fn test_reset_before_load_is_harmless() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);

    fixture.engine.reset().await;
    assert_eq!(fixture.recorder.events(), vec![Event::Reset]);
    assert!(!fixture.engine.status().initialized);

    fixture.engine.reset().await;
    assert_eq!(fixture.recorder.events(), vec![Event::Reset, Event::Reset]);
    assert!(!fixture.engine.status().initialized);
}

#[tokio::test]
async fn test_notifier_failure_aborts_load() {
    let fixture = Fixture::new(HEALTH_MAPPER, None);
    fixture.recorder.fail_changes.store(true, Ordering::SeqCst);

    let err = fixture.load(&idle_driver()).await.unwrap_err();
    assert!(err
        .to_string()
        .starts_with("Could not send 1 property change events"));
    assert!(!fixture.engine.status().initialized);
}

#[tokio::test]
async fn test_manual_script_calls() {
    let script = r#"
fn clamp_bytes(bytes, property) { bytes.map(|b| b + 200) }
fn edges(bytes, property) { [0, 255] }
fn is_health(property) { property.path == "health" }
"#;
    let fixture = Fixture::new(HEALTH_MAPPER, Some(script));
    fixture.load(&idle_driver()).await.unwrap();
    let health = fixture.engine.property("health").unwrap().unwrap();

    assert_eq!(
        fixture.engine.evaluate_expression("x + 1", json!(41)).unwrap(),
        json!(42)
    );
    assert_eq!(
        fixture.engine.execute_predicate(Some("is_health"), &health).unwrap(),
        Some(true)
    );
    assert_eq!(fixture.engine.execute_predicate(None, &health).unwrap(), None);
    assert_eq!(
        fixture.engine.execute_byte_transform("edges", &[1], &health).unwrap(),
        vec![0, 255]
    );
    assert!(matches!(
        fixture.engine.execute_byte_transform("clamp_bytes", &[100], &health),
        Err(Error::ByteRange(_))
    ));

    fixture.engine.write_bytes(0x05, &[9]).await.unwrap();
}
