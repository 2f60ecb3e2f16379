//! Rhai-backed script context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rhai::{
    Array, CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope, AST,
    INT,
};
use serde_json::{Number, Value};
use tracing::{debug, info};

use super::{ScriptBindings, ScriptContext, ScriptLimits};
use crate::error::{Error, Result};
use crate::mapper::property::lock;
use crate::memory::{MemoryAddress, DEFAULT_NAMESPACE};

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Distinct expressions kept compiled per context. Later ones compile per call.
const EXPRESSION_CACHE_CAPACITY: usize = 256;

pub struct RhaiContext {
    engine: Engine,
    ast: AST,
    scope: Mutex<Scope<'static>>,
    /// Compiled expressions merged with the script's functions, keyed by source
    expressions: Mutex<HashMap<String, AST>>,
}

impl RhaiContext {
    /// Build a sandboxed engine, bind `bindings` and run `source` once.
    pub fn new(source: &str, bindings: &ScriptBindings, limits: ScriptLimits) -> Result<Self> {
        let mut engine = Engine::new();
        engine
            .disable_symbol("eval")
            .set_max_operations(limits.max_operations)
            .set_max_call_levels(limits.max_call_levels)
            .set_max_string_size(limits.max_string_size)
            .set_max_expr_depths(64, 32);

        engine.on_print(|text| info!(target: "memhook::script", "{}", text));
        engine.on_debug(|text, source, pos: Position| {
            debug!(target: "memhook::script", "{} {}: {}", source.unwrap_or("script"), pos, text)
        });

        register_bindings(&mut engine, bindings);

        let ast = engine.compile(source)?;
        let mut scope = Scope::new();
        engine.run_ast_with_scope(&mut scope, &ast)?;

        Ok(Self {
            engine,
            ast,
            scope: Mutex::new(scope),
            expressions: Mutex::new(HashMap::new()),
        })
    }

    fn scope(&self) -> MutexGuard<'_, Scope<'static>> {
        self.scope.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn compiled_expression(&self, expression: &str) -> Result<AST> {
        let mut cache = self.expressions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ast) = cache.get(expression) {
            return Ok(ast.clone());
        }

        let compiled = self.engine.compile_expression(expression)?;
        let merged = self.ast.clone_functions_only().merge(&compiled);
        if cache.len() < EXPRESSION_CACHE_CAPACITY {
            cache.insert(expression.to_string(), merged.clone());
        }
        Ok(merged)
    }
}

impl ScriptContext for RhaiContext {
    fn has_function(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }

    fn call(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        if !self.has_function(function) {
            return Err(Error::Script(format!("function {} is not defined", function)));
        }

        let args: Vec<Dynamic> = args.into_iter().map(json_to_dynamic).collect();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);

        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut self.scope(),
            &self.ast,
            function,
            args,
        )?;
        dynamic_to_json(result)
    }

    fn evaluate(&self, expression: &str, name: &str, value: Value) -> Result<Value> {
        let ast = self.compiled_expression(expression)?;

        let mut scope = self.scope();
        let mark = scope.len();
        scope.push(name.to_string(), json_to_dynamic(value));
        let result = self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
        scope.rewind(mark);

        dynamic_to_json(result?)
    }
}

fn register_bindings(engine: &mut Engine, bindings: &ScriptBindings) {
    for (prefix, map) in [("state", &bindings.state), ("var", &bindings.variables)] {
        let get = map.clone();
        engine.register_fn(format!("{}_get", prefix), move |key: ImmutableString| {
            json_to_dynamic(get.get(&key))
        });

        let set = map.clone();
        engine.register_fn(
            format!("{}_set", prefix),
            move |key: ImmutableString, value: Dynamic| -> ScriptResult<()> {
                set.set(key.to_string(), dynamic_to_json(value).map_err(script_error)?);
                Ok(())
            },
        );

        let remove = map.clone();
        engine.register_fn(format!("{}_remove", prefix), move |key: ImmutableString| {
            json_to_dynamic(remove.remove(&key))
        });
    }

    let mapper = Arc::clone(&bindings.mapper);
    engine.register_fn("property_value", move |path: ImmutableString| -> ScriptResult<Dynamic> {
        let property = mapper
            .properties
            .get(&path)
            .ok_or_else(|| unknown_property(&path))?;
        Ok(json_to_dynamic(lock(property).value().clone()))
    });

    let mapper = Arc::clone(&bindings.mapper);
    engine.register_fn("property_bytes", move |path: ImmutableString| -> ScriptResult<Dynamic> {
        let property = mapper
            .properties
            .get(&path)
            .ok_or_else(|| unknown_property(&path))?;
        Ok(match lock(property).bytes() {
            Some(bytes) => bytes_to_dynamic(bytes),
            None => Dynamic::UNIT,
        })
    });

    let mapper = Arc::clone(&bindings.mapper);
    engine.register_fn(
        "set_property_value",
        move |path: ImmutableString, value: Dynamic| -> ScriptResult<()> {
            let property = mapper
                .properties
                .get(&path)
                .ok_or_else(|| unknown_property(&path))?;
            let value = dynamic_to_json(value).map_err(script_error)?;
            lock(property).set_value(value);
            Ok(())
        },
    );

    let memory = Arc::clone(&bindings.memory);
    engine.register_fn("memory_read", move |address: INT, length: INT| -> ScriptResult<Dynamic> {
        let store = memory.read().unwrap_or_else(|e| e.into_inner());
        let bytes = store
            .read(DEFAULT_NAMESPACE, to_address(address)?, to_length(length)?)
            .map_err(script_error)?;
        Ok(bytes_to_dynamic(&bytes))
    });

    let memory = Arc::clone(&bindings.memory);
    engine.register_fn(
        "memory_read_ns",
        move |namespace: ImmutableString, address: INT, length: INT| -> ScriptResult<Dynamic> {
            let store = memory.read().unwrap_or_else(|e| e.into_inner());
            let bytes = store
                .read(&namespace, to_address(address)?, to_length(length)?)
                .map_err(script_error)?;
            Ok(bytes_to_dynamic(&bytes))
        },
    );

    let memory = Arc::clone(&bindings.memory);
    engine.register_fn(
        "memory_fill",
        move |namespace: ImmutableString, address: INT, bytes: Array| -> ScriptResult<()> {
            if namespace.as_str() == DEFAULT_NAMESPACE {
                return Err("the default namespace is filled by the driver only".into());
            }
            let address = to_address(address)?;
            let bytes = array_to_bytes(&bytes)?;
            memory
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .namespace_mut(&namespace)
                .fill(address, &bytes);
            Ok(())
        },
    );

    let writes = bindings.writes.clone();
    engine.register_fn("driver_write", move |address: INT, bytes: Array| -> ScriptResult<()> {
        writes.push(to_address(address)?, array_to_bytes(&bytes)?);
        Ok(())
    });
}

fn script_error(err: Error) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn unknown_property(path: &str) -> Box<EvalAltResult> {
    format!("no property at path {}", path).into()
}

fn to_address(address: INT) -> ScriptResult<MemoryAddress> {
    MemoryAddress::try_from(address).map_err(|_| format!("invalid address {}", address).into())
}

fn to_length(length: INT) -> ScriptResult<usize> {
    usize::try_from(length).map_err(|_| format!("invalid length {}", length).into())
}

fn array_to_bytes(array: &Array) -> ScriptResult<Vec<u8>> {
    array
        .iter()
        .map(|item| -> ScriptResult<u8> {
            item.as_int()
                .ok()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| format!("{} is not a byte", item).into())
        })
        .collect()
}

fn bytes_to_dynamic(bytes: &[u8]) -> Dynamic {
    Dynamic::from_array(bytes.iter().map(|&b| Dynamic::from_int(INT::from(b))).collect())
}

/// Convert a JSON value into a script value.
pub(crate) fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => Dynamic::from_float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Dynamic::from(s),
        Value::Array(items) => Dynamic::from_array(items.into_iter().map(json_to_dynamic).collect()),
        Value::Object(entries) => Dynamic::from_map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), json_to_dynamic(v)))
                .collect(),
        ),
    }
}

/// Convert a script value into JSON. Non-finite floats become `null`.
pub(crate) fn dynamic_to_json(value: Dynamic) -> Result<Value> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null));
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if value.is_string() {
        let type_name = value.type_name();
        return value
            .into_string()
            .map(Value::String)
            .map_err(|_| Error::Script(format!("cannot convert {}", type_name)));
    }
    if value.is_blob() {
        let bytes = value.cast::<rhai::Blob>();
        return Ok(Value::Array(bytes.into_iter().map(Value::from).collect()));
    }
    if value.is_array() {
        let items = value.cast::<Array>();
        return items
            .into_iter()
            .map(dynamic_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let entries = value.cast::<rhai::Map>();
        let mut object = serde_json::Map::new();
        for (key, item) in entries {
            object.insert(key.to_string(), dynamic_to_json(item)?);
        }
        return Ok(Value::Object(object));
    }

    Err(Error::Script(format!("cannot convert {} to a value", value.type_name())))
}
