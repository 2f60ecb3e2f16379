//! Properties and the property graph.
//!
//! A property turns a slice of mirrored memory into a named value. Each
//! cycle its change set is cleared, then recomputed by [`Property::process`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, RwLock};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::memory::{MemoryAddress, MemoryStore, DEFAULT_NAMESPACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Uint,
    Int,
    Bool,
    Bit,
    String,
    Bytes,
}

impl FromStr for PropertyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uint" => Ok(PropertyType::Uint),
            "int" => Ok(PropertyType::Int),
            "bool" => Ok(PropertyType::Bool),
            "bit" => Ok(PropertyType::Bit),
            "string" => Ok(PropertyType::String),
            "bytes" => Ok(PropertyType::Bytes),
            other => Err(Error::MapperParse(format!("unknown property type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Fields whose change is tracked per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyField {
    Value,
    Bytes,
}

impl fmt::Display for PropertyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyField::Value => f.write_str("value"),
            PropertyField::Bytes => f.write_str("bytes"),
        }
    }
}

/// Static description of a property, as declared by the mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    pub path: String,
    pub kind: PropertyType,
    pub address: Option<MemoryAddress>,
    pub length: usize,
    pub bit: Option<u32>,
    pub endian: Endian,
    pub namespace: Option<String>,
    /// Predicate function; returning `false` skips the property for a cycle
    pub read_condition: Option<String>,
    /// Byte-transform function applied to the raw bytes before decoding
    pub before_read: Option<String>,
    /// Expression over `x` applied to the decoded value
    pub after_read: Option<String>,
}

impl PropertySpec {
    pub fn new(path: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            path: path.into(),
            kind,
            address: None,
            length: 1,
            bit: None,
            endian: Endian::Little,
            namespace: None,
            read_condition: None,
            before_read: None,
            after_read: None,
        }
    }

    pub fn at(mut self, address: MemoryAddress, length: usize) -> Self {
        self.address = Some(address);
        self.length = length;
        self
    }
}

/// Read-only view of a property handed to scripts and notifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: PropertyType,
    pub address: Option<MemoryAddress>,
    pub length: usize,
    pub value: Value,
    pub bytes: Option<Vec<u8>>,
    pub fields_changed: Vec<PropertyField>,
}

/// Script hooks a property may call while processing.
pub trait PropertyScripts {
    fn predicate(&self, function: &str, property: &PropertySnapshot) -> Result<Option<bool>>;

    fn byte_transform(
        &self,
        function: &str,
        bytes: &[u8],
        property: &PropertySnapshot,
    ) -> Result<Vec<u8>>;

    fn expression(&self, expression: &str, value: Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct Property {
    spec: PropertySpec,
    value: Value,
    bytes: Option<Vec<u8>>,
    fields_changed: BTreeSet<PropertyField>,
}

impl Property {
    pub fn new(spec: PropertySpec) -> Self {
        Self {
            spec,
            value: Value::Null,
            bytes: None,
            fields_changed: BTreeSet::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.spec.path
    }

    pub fn spec(&self) -> &PropertySpec {
        &self.spec
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn fields_changed(&self) -> &BTreeSet<PropertyField> {
        &self.fields_changed
    }

    pub fn has_changed(&self) -> bool {
        !self.fields_changed.is_empty()
    }

    pub fn clear_changes(&mut self) {
        self.fields_changed.clear();
    }

    /// Set the value directly. Used for script-owned properties.
    pub fn set_value(&mut self, value: Value) {
        if self.value != value {
            self.value = value;
            self.fields_changed.insert(PropertyField::Value);
        }
    }

    pub fn snapshot(&self) -> PropertySnapshot {
        PropertySnapshot {
            path: self.spec.path.clone(),
            kind: self.spec.kind,
            address: self.spec.address,
            length: self.spec.length,
            value: self.value.clone(),
            bytes: self.bytes.clone(),
            fields_changed: self.fields_changed.iter().copied().collect(),
        }
    }

    /// Recompute the value from memory, recording what changed.
    ///
    /// A first computed value always differs from the unset (`null`)
    /// baseline, so it is reported as a change.
    pub fn process(&mut self, memory: &RwLock<MemoryStore>, scripts: &dyn PropertyScripts) -> Result<()> {
        let Some(address) = self.spec.address else {
            return Ok(());
        };

        if let Some(function) = &self.spec.read_condition {
            if scripts.predicate(function, &self.snapshot())? == Some(false) {
                return Ok(());
            }
        }

        let namespace = self.spec.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let mut bytes = memory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .read(namespace, address, self.spec.length)?;

        if let Some(function) = &self.spec.before_read {
            bytes = scripts.byte_transform(function, &bytes, &self.snapshot())?;
        }

        let mut value = decode(&self.spec, &bytes)?;

        if let Some(expression) = &self.spec.after_read {
            value = scripts.expression(expression, value)?;
        }

        if self.bytes.as_deref() != Some(bytes.as_slice()) {
            self.bytes = Some(bytes);
            self.fields_changed.insert(PropertyField::Bytes);
        }
        self.set_value(value);

        Ok(())
    }
}

fn decode(spec: &PropertySpec, bytes: &[u8]) -> Result<Value> {
    let integer_width = || {
        if bytes.is_empty() || bytes.len() > 8 {
            Err(Error::Decode(format!(
                "{} needs 1 to 8 bytes for an integer, got {}",
                spec.path,
                bytes.len()
            )))
        } else {
            Ok(bytes.len())
        }
    };

    let value = match spec.kind {
        PropertyType::Uint => {
            let n = integer_width()?;
            match spec.endian {
                Endian::Little => Value::from(LittleEndian::read_uint(bytes, n)),
                Endian::Big => Value::from(BigEndian::read_uint(bytes, n)),
            }
        }
        PropertyType::Int => {
            let n = integer_width()?;
            match spec.endian {
                Endian::Little => Value::from(LittleEndian::read_int(bytes, n)),
                Endian::Big => Value::from(BigEndian::read_int(bytes, n)),
            }
        }
        PropertyType::Bool => Value::Bool(bytes.iter().any(|&b| b != 0)),
        PropertyType::Bit => {
            let index = spec.bit.unwrap_or(0) as usize;
            let byte = bytes.get(index / 8).ok_or_else(|| {
                Error::Decode(format!("{} has no bit {} in {} bytes", spec.path, index, bytes.len()))
            })?;
            Value::Bool((byte >> (index % 8)) & 1 == 1)
        }
        PropertyType::String => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Value::String(String::from_utf8_lossy(&bytes[..end]).to_string())
        }
        PropertyType::Bytes => Value::Array(bytes.iter().map(|&b| Value::from(b)).collect()),
    };

    Ok(value)
}

/// Lock a property, recovering from a poisoned lock.
pub fn lock(property: &Mutex<Property>) -> MutexGuard<'_, Property> {
    property.lock().unwrap_or_else(|e| e.into_inner())
}

/// All properties of a mapper, addressable by path, in declaration order.
#[derive(Debug, Default)]
pub struct PropertyGraph {
    properties: Vec<Mutex<Property>>,
    index: HashMap<String, usize>,
}

impl PropertyGraph {
    /// Build a graph, rejecting duplicate paths.
    pub fn new(specs: Vec<PropertySpec>) -> Result<Self> {
        let mut graph = PropertyGraph::default();
        for spec in specs {
            if graph.index.contains_key(&spec.path) {
                return Err(Error::MapperParse(format!(
                    "duplicate property path '{}'",
                    spec.path
                )));
            }
            graph.index.insert(spec.path.clone(), graph.properties.len());
            graph.properties.push(Mutex::new(Property::new(spec)));
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Mutex<Property>> {
        self.index.get(path).map(|&i| &self.properties[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<Property>> {
        self.properties.iter()
    }

    pub fn clear_changes(&self) {
        for property in &self.properties {
            lock(property).clear_changes();
        }
    }

    /// Process every property in declaration order, stopping at the first failure.
    ///
    /// Each property is computed on a copy and written back, so scripts
    /// called along the way can read any property without blocking.
    pub fn process_all(&self, memory: &RwLock<MemoryStore>, scripts: &dyn PropertyScripts) -> Result<()> {
        for slot in &self.properties {
            let mut working = lock(slot).clone();
            working
                .process(memory, scripts)
                .map_err(|e| Error::property(working.path(), e))?;
            *lock(slot) = working;
        }
        Ok(())
    }

    pub fn snapshot(&self, path: &str) -> Option<PropertySnapshot> {
        self.get(path).map(|p| lock(p).snapshot())
    }

    pub fn snapshots(&self) -> Vec<PropertySnapshot> {
        self.properties.iter().map(|p| lock(p).snapshot()).collect()
    }

    /// Snapshots of every property whose change set is non-empty.
    pub fn changed(&self) -> Vec<PropertySnapshot> {
        self.properties
            .iter()
            .filter_map(|p| {
                let property = lock(p);
                property.has_changed().then(|| property.snapshot())
            })
            .collect()
    }
}
