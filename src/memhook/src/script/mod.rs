//! Mapper scripting.
//!
//! Every loaded mapper gets three execution contexts built from the same
//! global script and the same [`ScriptBindings`]. Each context serves one
//! call-site role, so the poll loop, ad-hoc expression evaluation and
//! property transforms never interleave calls into the same context, while
//! still sharing the state and variable maps.

mod bindings;
mod rhai_context;

pub use bindings::{PendingWrite, ScriptBindings, SharedMap, WriteQueue};
pub use rhai_context::RhaiContext;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::mapper::{PropertyScripts, PropertySnapshot};

/// Entry point run before properties are processed each cycle.
pub const PREPROCESSOR: &str = "preprocessor";
/// Entry point run after properties are processed each cycle.
pub const POSTPROCESSOR: &str = "postprocessor";

/// Sandbox limits applied to every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 5_000_000,
            max_call_levels: 64,
            max_string_size: 1 << 20,
        }
    }
}

/// One isolated script execution context.
pub trait ScriptContext: Send + Sync {
    fn has_function(&self, name: &str) -> bool;

    /// Call a top-level function. A missing function is an error.
    fn call(&self, function: &str, args: Vec<Value>) -> Result<Value>;

    /// Evaluate an expression with `name` bound to `value`.
    fn evaluate(&self, expression: &str, name: &str, value: Value) -> Result<Value>;
}

pub struct ScriptRuntime {
    cyclic: Box<dyn ScriptContext>,
    expression: Box<dyn ScriptContext>,
    transform: Box<dyn ScriptContext>,
}

impl ScriptRuntime {
    /// Build the three contexts, running `source` once in each.
    pub fn new(source: &str, bindings: &ScriptBindings, limits: ScriptLimits) -> Result<Self> {
        Ok(Self::with_contexts(
            Box::new(RhaiContext::new(source, bindings, limits)?),
            Box::new(RhaiContext::new(source, bindings, limits)?),
            Box::new(RhaiContext::new(source, bindings, limits)?),
        ))
    }

    /// Assemble a runtime from already-built contexts.
    pub fn with_contexts(
        cyclic: Box<dyn ScriptContext>,
        expression: Box<dyn ScriptContext>,
        transform: Box<dyn ScriptContext>,
    ) -> Self {
        Self {
            cyclic,
            expression,
            transform,
        }
    }

    /// Call an entry point in the cyclic context. `None` when it returns nothing.
    pub fn invoke(&self, entry_point: &str) -> Result<Option<Value>> {
        if !self.cyclic.has_function(entry_point) {
            return Err(Error::Script(format!("function {} is not defined", entry_point)));
        }

        match self.cyclic.call(entry_point, Vec::new())? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    /// Evaluate `expression` in the expression context with `x` bound to `value`.
    pub fn evaluate_expression(&self, expression: &str, value: Value) -> Result<Value> {
        self.expression.evaluate(expression, "x", value)
    }

    /// Call a predicate with a property handle. `None` when no function is
    /// named or the function returns nothing.
    pub fn invoke_boolean_function(
        &self,
        function: Option<&str>,
        property: &PropertySnapshot,
    ) -> Result<Option<bool>> {
        let Some(function) = function.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };

        match self.transform.call(function, vec![property_handle(property)?])? {
            Value::Bool(b) => Ok(Some(b)),
            Value::Null => Ok(None),
            other => Err(Error::Script(format!(
                "function {} must return a boolean, got {}",
                function, other
            ))),
        }
    }

    /// Call a byte transform: `fn(bytes, property) -> array of numbers`.
    ///
    /// Each returned number is rounded to the nearest integer and must land
    /// in `0..=255`.
    pub fn invoke_byte_transform(
        &self,
        function: &str,
        bytes: &[u8],
        property: &PropertySnapshot,
    ) -> Result<Vec<u8>> {
        let input = Value::Array(bytes.iter().map(|&b| Value::from(b)).collect());
        let result = self
            .transform
            .call(function, vec![input, property_handle(property)?])?;

        let Value::Array(items) = result else {
            return Err(Error::Script(format!("function {} must return a byte array", function)));
        };

        items
            .iter()
            .map(|item| {
                item.as_f64().ok_or_else(|| {
                    Error::Script(format!("function {} must return a byte array", function))
                })
            })
            .map(|n| n.and_then(to_byte))
            .collect()
    }
}

impl PropertyScripts for ScriptRuntime {
    fn predicate(&self, function: &str, property: &PropertySnapshot) -> Result<Option<bool>> {
        self.invoke_boolean_function(Some(function), property)
    }

    fn byte_transform(
        &self,
        function: &str,
        bytes: &[u8],
        property: &PropertySnapshot,
    ) -> Result<Vec<u8>> {
        self.invoke_byte_transform(function, bytes, property)
    }

    fn expression(&self, expression: &str, value: Value) -> Result<Value> {
        self.evaluate_expression(expression, value)
    }
}

fn property_handle(property: &PropertySnapshot) -> Result<Value> {
    serde_json::to_value(property).map_err(|e| Error::Script(e.to_string()))
}

fn to_byte(value: f64) -> Result<u8> {
    let rounded = value.round();
    if !(0.0..=255.0).contains(&rounded) {
        return Err(Error::ByteRange(value));
    }
    Ok(rounded as u8)
}

/// Names of the top-level functions a script declares.
pub fn declared_functions(source: &str) -> Result<Vec<String>> {
    let engine = rhai::Engine::new();
    let ast = engine.compile(source)?;
    Ok(ast.iter_functions().map(|f| f.name.to_string()).collect())
}
