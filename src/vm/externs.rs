use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use rill_core::json::{coerce_to_string, value_to_json};
use rill_core::value::{ClassMeta, ObjectRef};
use rill_core::{Value, VmError, VmResult};

use super::OutputSink;

/// Context handed to extern handlers: the constant pool (for JSON
/// serialisation of objects) and the active output sink.
pub struct ExternCtx<'a> {
    pub constants: &'a [Value],
    pub output: &'a OutputSink,
}

pub type ExternFn = Arc<dyn Fn(&[Value], &ExternCtx<'_>) -> VmResult<Value> + Send + Sync>;

/// A host-registered class. The tag starts negative and is upgraded to a
/// positive constant-pool index when a loaded program declares a class of
/// the same name.
pub struct ExternClassInfo {
    pub name: String,
    class_idx: AtomicI32,
}

impl ExternClassInfo {
    pub fn class_idx(&self) -> i32 {
        self.class_idx.load(Ordering::Acquire)
    }

    fn set_class_idx(&self, idx: i32) {
        self.class_idx.store(idx, Ordering::Release);
    }
}

pub type ExternClassHandle = Arc<ExternClassInfo>;

/// Name -> handler table plus the extern-class registry. Populated during
/// VM construction and by the host before execution; read-only while
/// bytecode runs.
pub struct ExternRegistry {
    functions: RwLock<HashMap<String, ExternFn>>,
    classes: RwLock<HashMap<String, ExternClassHandle>>,
    next_negative_idx: AtomicI32,
}

impl ExternRegistry {
    pub fn new() -> ExternRegistry {
        ExternRegistry {
            functions: RwLock::new(HashMap::new()),
            classes: RwLock::new(HashMap::new()),
            next_negative_idx: AtomicI32::new(-2),
        }
    }

    pub fn register(&self, name: &str, func: ExternFn) {
        self.functions.write().insert(name.to_string(), func);
    }

    pub fn register_fn<F>(&self, name: &str, func: F)
    where
        F: Fn(&[Value], &ExternCtx<'_>) -> VmResult<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<ExternFn> {
        self.functions.read().get(name).cloned()
    }

    pub fn ensure_class(&self, name: &str) -> ExternClassHandle {
        if let Some(existing) = self.classes.read().get(name) {
            return existing.clone();
        }
        let mut classes = self.classes.write();
        if let Some(existing) = classes.get(name) {
            return existing.clone();
        }
        let idx = self.next_negative_idx.fetch_sub(1, Ordering::AcqRel);
        let handle = Arc::new(ExternClassInfo {
            name: name.to_string(),
            class_idx: AtomicI32::new(idx),
        });
        classes.insert(name.to_string(), handle.clone());
        handle
    }

    /// Upgrade extern class tags to constant-pool indices where the loaded
    /// program declares a class of the same name. Runs once per `run`.
    pub fn refresh_class_indices(&self, constants: &[Value]) {
        let classes = self.classes.read();
        for handle in classes.values() {
            if let Some(idx) = find_pool_class_idx(&handle.name, constants) {
                handle.set_class_idx(idx as i32);
            }
        }
    }
}

impl Default for ExternRegistry {
    fn default() -> Self {
        ExternRegistry::new()
    }
}

fn find_pool_class_idx(name: &str, constants: &[Value]) -> Option<usize> {
    constants.iter().position(|candidate| {
        ClassMeta::from_value(candidate)
            .map(|meta| meta.name == name)
            .unwrap_or(false)
    })
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Null)
}

/// Built-in externs available to every program.
pub fn register_builtins(registry: &ExternRegistry) {
    registry.register_fn("println", |args, ctx| {
        let value = arg(args, 0);
        let mut text = match &value {
            Value::String(s) => s.clone(),
            other => value_to_json(other, ctx.constants).to_string(),
        };
        text.push('\n');
        ctx.output.emit(&text, "stdout");
        Ok(Value::Null)
    });

    registry.register_fn("panic", |args, ctx| {
        let message = match arg(args, 0) {
            Value::String(s) => s,
            _ => String::new(),
        };
        let text = if message.is_empty() {
            "panic".to_string()
        } else {
            format!("panic: {message}")
        };
        ctx.output.emit(&format!("{text}\n"), "stderr");
        std::process::exit(1)
    });

    register_string_builtins(registry);
    register_array_builtins(registry);
    register_string_builder(registry);
}

fn register_string_builtins(registry: &ExternRegistry) {
    registry.register_fn("String::substring", |args, _ctx| {
        let (Value::String(text), Value::Int(start)) = (arg(args, 0), arg(args, 1)) else {
            return Ok(Value::string(""));
        };
        let bytes = text.as_bytes();
        let start = start.max(0) as usize;
        if start >= bytes.len() {
            return Ok(Value::string(""));
        }
        let end = match arg(args, 2) {
            Value::Int(end) => {
                if end <= start as i32 {
                    return Ok(Value::string(""));
                }
                (end as usize).min(bytes.len())
            }
            _ => bytes.len(),
        };
        Ok(Value::string(
            String::from_utf8_lossy(&bytes[start..end]).into_owned(),
        ))
    });

    registry.register_fn("String::indexOf", |args, _ctx| {
        let (Value::String(text), Value::String(search)) = (arg(args, 0), arg(args, 1)) else {
            return Ok(Value::Int(-1));
        };
        Ok(Value::Int(
            text.find(&search).map(|pos| pos as i32).unwrap_or(-1),
        ))
    });

    registry.register_fn("String::replace", |args, _ctx| {
        let (Value::String(text), Value::String(from), Value::String(to)) =
            (arg(args, 0), arg(args, 1), arg(args, 2))
        else {
            return Ok(Value::string(""));
        };
        // First occurrence only.
        Ok(Value::string(text.replacen(&from, &to, 1)))
    });

    registry.register_fn("String::toUpperCase", |args, _ctx| {
        match arg(args, 0) {
            Value::String(text) => Ok(Value::string(text.to_ascii_uppercase())),
            _ => Ok(Value::string("")),
        }
    });

    registry.register_fn("String::toLowerCase", |args, _ctx| {
        match arg(args, 0) {
            Value::String(text) => Ok(Value::string(text.to_ascii_lowercase())),
            _ => Ok(Value::string("")),
        }
    });

    registry.register_fn("String::split", |args, _ctx| {
        let (Value::String(text), Value::String(separator)) = (arg(args, 0), arg(args, 1)) else {
            return Ok(Value::array_from(Vec::new()));
        };
        let parts = if separator.is_empty() {
            text.chars().map(|c| Value::string(c.to_string())).collect()
        } else {
            text.split(separator.as_str())
                .map(|part| Value::string(part))
                .collect()
        };
        Ok(Value::array_from(parts))
    });
}

fn register_array_builtins(registry: &ExternRegistry) {
    registry.register_fn("Array::push", |args, _ctx| {
        if let Value::Array(array) = arg(args, 0) {
            array.lock().push(arg(args, 1));
        }
        Ok(Value::Null)
    });

    registry.register_fn("Array::pop", |args, _ctx| {
        if let Value::Array(array) = arg(args, 0) {
            return Ok(array.lock().pop().unwrap_or(Value::Null));
        }
        Ok(Value::Null)
    });

    registry.register_fn("Array::length", |args, _ctx| {
        if let Value::Array(array) = arg(args, 0) {
            return Ok(Value::Int(array.lock().len() as i32));
        }
        Ok(Value::Int(0))
    });
}

const SB_BUFFER: usize = 0;
const SB_RESERVED: usize = 1;

fn sb_instance(receiver: &Value, class: &ExternClassInfo) -> VmResult<ObjectRef> {
    let object = receiver
        .as_object()
        .map_err(|_| VmError::runtime("Extern method called with non-object receiver"))?;
    if object.lock().class_idx != class.class_idx() {
        return Err(VmError::runtime("Extern method receiver class mismatch"));
    }
    Ok(object.clone())
}

fn new_string_builder(class: &ExternClassInfo, capacity: i32) -> Value {
    let object = Value::new_object(class.class_idx(), 2);
    {
        let handle = object.as_object().expect("fresh object");
        let mut data = handle.lock();
        let mut buffer = String::new();
        if capacity > 0 {
            buffer.reserve(capacity as usize);
        }
        data.fields[SB_BUFFER] = Value::String(buffer);
        data.fields[SB_RESERVED] = Value::Int(capacity.max(0));
    }
    object
}

fn register_string_builder(registry: &ExternRegistry) {
    let class = registry.ensure_class("StringBuilder");

    {
        let class = class.clone();
        registry.register_fn("StringBuilder::create", move |_args, _ctx| {
            Ok(new_string_builder(&class, 0))
        });
    }

    {
        let class = class.clone();
        registry.register_fn("StringBuilder::createWithCapacity", move |args, _ctx| {
            let capacity = match arg(args, 0) {
                Value::Int(n) => n,
                _ => 0,
            };
            Ok(new_string_builder(&class, capacity))
        });
    }

    {
        let class = class.clone();
        registry.register_fn("StringBuilder::append", move |args, ctx| {
            let receiver = arg(args, 0);
            let object = sb_instance(&receiver, &class)?;
            let appended = match arg(args, 1) {
                Value::String(s) => s,
                other => coerce_to_string(&other, ctx.constants),
            };
            {
                let mut data = object.lock();
                if let Value::String(buffer) = &mut data.fields[SB_BUFFER] {
                    buffer.push_str(&appended);
                }
            }
            Ok(receiver)
        });
    }

    {
        let class = class.clone();
        registry.register_fn("StringBuilder::toString", move |args, _ctx| {
            let object = sb_instance(&arg(args, 0), &class)?;
            let data = object.lock();
            Ok(data.fields[SB_BUFFER].clone())
        });
    }

    {
        let class = class.clone();
        registry.register_fn("StringBuilder::clear", move |args, _ctx| {
            let object = sb_instance(&arg(args, 0), &class)?;
            let mut data = object.lock();
            data.fields[SB_BUFFER] = Value::string("");
            Ok(Value::Null)
        });
    }

    {
        let class = class.clone();
        registry.register_fn("StringBuilder::reserve", move |args, _ctx| {
            let object = sb_instance(&arg(args, 0), &class)?;
            if let Value::Int(capacity) = arg(args, 1) {
                let mut data = object.lock();
                let reserved = data.fields[SB_RESERVED].as_int().unwrap_or(0);
                data.fields[SB_RESERVED] = Value::Int(reserved.max(capacity.max(0)));
                if let Value::String(buffer) = &mut data.fields[SB_BUFFER] {
                    buffer.reserve(capacity.max(0) as usize);
                }
            }
            Ok(Value::Null)
        });
    }
}
