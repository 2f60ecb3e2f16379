//! Handles shared by every script context of a session.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde_json::{Map, Value};

use crate::mapper::Mapper;
use crate::memory::{MemoryAddress, MemoryStore};

/// A JSON-valued key/value map shared between contexts.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct SharedMap(Arc<Mutex<Map<String, Value>>>);

impl SharedMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Value under `key`, or `null` when absent.
    pub fn get(&self, key: &str) -> Value {
        self.entries().get(key).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Value {
        self.entries().remove(key).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Copy of the whole map.
    pub fn to_value(&self) -> Value {
        Value::Object(self.entries().clone())
    }
}

/// A driver write requested by a script, applied at the end of the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub address: MemoryAddress,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteQueue(Arc<Mutex<Vec<PendingWrite>>>);

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, address: MemoryAddress, bytes: Vec<u8>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingWrite { address, bytes });
    }

    /// Take every queued write, oldest first.
    pub fn drain(&self) -> Vec<PendingWrite> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a context binds into its scripts.
///
/// All three contexts of a session are built from clones of one value, so
/// they observe the same state, variables, properties and memory.
#[derive(Debug, Clone)]
pub struct ScriptBindings {
    pub state: SharedMap,
    pub variables: SharedMap,
    pub mapper: Arc<Mapper>,
    pub memory: Arc<RwLock<MemoryStore>>,
    pub writes: WriteQueue,
}

impl ScriptBindings {
    /// Fresh state, variables and write queue over an existing mapper and memory mirror.
    pub fn new(mapper: Arc<Mapper>, memory: Arc<RwLock<MemoryStore>>) -> Self {
        Self {
            state: SharedMap::new(),
            variables: SharedMap::new(),
            mapper,
            memory,
            writes: WriteQueue::new(),
        }
    }
}
