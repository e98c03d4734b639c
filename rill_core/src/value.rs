use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{VmError, VmResult};
use crate::iter::IterState;
pub use crate::task::TaskRef;

pub type ArrayRef = Arc<Mutex<Vec<Value>>>;
pub type MapRef = Arc<Mutex<BTreeMap<String, Value>>>;
pub type SetRef = Arc<Mutex<HashSet<Value>>>;
pub type IntMapRef = Arc<Mutex<BTreeMap<i32, Value>>>;
pub type IntSetRef = Arc<Mutex<HashSet<i32>>>;
pub type ObjectRef = Arc<Mutex<ObjectData>>;
pub type LambdaRef = Arc<Mutex<LambdaData>>;
pub type IterRef = Arc<Mutex<IterState>>;

/// Record backing an Object value. `class_idx` points at class metadata in
/// the constant pool; negative indices denote extern classes without
/// constant-pool metadata.
#[derive(Debug)]
pub struct ObjectData {
    pub class_idx: i32,
    pub fields: Vec<Value>,
}

#[derive(Debug)]
pub struct LambdaData {
    pub code_index: usize,
    pub parameter_count: usize,
    pub captured: Vec<Value>,
}

/// Runtime value tag, observable through `TYPE_OF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null = 0,
    Bool,
    Int,
    Float,
    Double,
    Char,
    String,
    Object,
    Array,
    Lambda,
    Map,
    Set,
    IntMap,
    IntSet,
    Iterator,
    Future,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::Char => "char",
            ValueType::String => "string",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Lambda => "lambda",
            ValueType::Map => "map",
            ValueType::Set => "set",
            ValueType::IntMap => "intmap",
            ValueType::IntSet => "intset",
            ValueType::Iterator => "iterator",
            ValueType::Future => "future",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tagged runtime value. Primitives are stored inline; containers, objects,
/// lambdas, iterators and futures are shared handles that compare and hash
/// by identity.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    Char(u8),
    String(String),
    Object(ObjectRef),
    Array(ArrayRef),
    Lambda(LambdaRef),
    Map(MapRef),
    Set(SetRef),
    IntMap(IntMapRef),
    IntSet(IntSetRef),
    Iterator(IterRef),
    Future(TaskRef),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::Char(_) => ValueType::Char,
            Value::String(_) => ValueType::String,
            Value::Object(_) => ValueType::Object,
            Value::Array(_) => ValueType::Array,
            Value::Lambda(_) => ValueType::Lambda,
            Value::Map(_) => ValueType::Map,
            Value::Set(_) => ValueType::Set,
            Value::IntMap(_) => ValueType::IntMap,
            Value::IntSet(_) => ValueType::IntSet,
            Value::Iterator(_) => ValueType::Iterator,
            Value::Future(_) => ValueType::Future,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn string(text: impl Into<String>) -> Value {
        Value::String(text.into())
    }

    pub fn new_array(size: usize) -> Value {
        Value::Array(Arc::new(Mutex::new(vec![Value::Null; size])))
    }

    pub fn array_from(values: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(values)))
    }

    pub fn new_map() -> Value {
        Value::Map(Arc::new(Mutex::new(BTreeMap::new())))
    }

    pub fn new_set() -> Value {
        Value::Set(Arc::new(Mutex::new(HashSet::new())))
    }

    pub fn new_int_map() -> Value {
        Value::IntMap(Arc::new(Mutex::new(BTreeMap::new())))
    }

    pub fn new_int_set() -> Value {
        Value::IntSet(Arc::new(Mutex::new(HashSet::new())))
    }

    pub fn new_object(class_idx: i32, field_count: usize) -> Value {
        Value::Object(Arc::new(Mutex::new(ObjectData {
            class_idx,
            fields: vec![Value::Null; field_count],
        })))
    }

    pub fn new_lambda(code_index: usize, parameter_count: usize) -> Value {
        Value::Lambda(Arc::new(Mutex::new(LambdaData {
            code_index,
            parameter_count,
            captured: Vec::new(),
        })))
    }

    fn type_error(&self, expected: ValueType) -> VmError {
        VmError::Type {
            expected,
            found: self.value_type(),
        }
    }

    pub fn as_bool(&self) -> VmResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.type_error(ValueType::Bool)),
        }
    }

    pub fn as_int(&self) -> VmResult<i32> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.type_error(ValueType::Int)),
        }
    }

    pub fn as_float(&self) -> VmResult<f32> {
        match self {
            Value::Float(f) => Ok(*f),
            other => Err(other.type_error(ValueType::Float)),
        }
    }

    pub fn as_double(&self) -> VmResult<f64> {
        match self {
            Value::Double(d) => Ok(*d),
            other => Err(other.type_error(ValueType::Double)),
        }
    }

    pub fn as_char(&self) -> VmResult<u8> {
        match self {
            Value::Char(c) => Ok(*c),
            other => Err(other.type_error(ValueType::Char)),
        }
    }

    pub fn as_str(&self) -> VmResult<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.type_error(ValueType::String)),
        }
    }

    pub fn as_object(&self) -> VmResult<&ObjectRef> {
        match self {
            Value::Object(o) => Ok(o),
            other => Err(other.type_error(ValueType::Object)),
        }
    }

    pub fn as_array(&self) -> VmResult<&ArrayRef> {
        match self {
            Value::Array(a) => Ok(a),
            other => Err(other.type_error(ValueType::Array)),
        }
    }

    pub fn as_lambda(&self) -> VmResult<&LambdaRef> {
        match self {
            Value::Lambda(l) => Ok(l),
            other => Err(other.type_error(ValueType::Lambda)),
        }
    }

    pub fn as_map(&self) -> VmResult<&MapRef> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(other.type_error(ValueType::Map)),
        }
    }

    pub fn as_set(&self) -> VmResult<&SetRef> {
        match self {
            Value::Set(s) => Ok(s),
            other => Err(other.type_error(ValueType::Set)),
        }
    }

    pub fn as_int_map(&self) -> VmResult<&IntMapRef> {
        match self {
            Value::IntMap(m) => Ok(m),
            other => Err(other.type_error(ValueType::IntMap)),
        }
    }

    pub fn as_int_set(&self) -> VmResult<&IntSetRef> {
        match self {
            Value::IntSet(s) => Ok(s),
            other => Err(other.type_error(ValueType::IntSet)),
        }
    }

    pub fn as_iterator(&self) -> VmResult<&IterRef> {
        match self {
            Value::Iterator(it) => Ok(it),
            other => Err(other.type_error(ValueType::Iterator)),
        }
    }

    pub fn as_future(&self) -> VmResult<&TaskRef> {
        match self {
            Value::Future(t) => Ok(t),
            other => Err(other.type_error(ValueType::Future)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // IEEE-754 strict equality: NaN != NaN.
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Lambda(a), Value::Lambda(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
            (Value::IntMap(a), Value::IntMap(b)) => Arc::ptr_eq(a, b),
            (Value::IntSet(a), Value::IntSet(b)) => Arc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Arc::ptr_eq(a, b),
            (Value::Future(a), Value::Future(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// Sets require Eq. Float NaN breaks reflexivity the same way it does for the
// reference implementation's unordered_set; membership of NaN is simply never
// observable through HAS_SET.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            // Hash the bit pattern, folding -0.0 into +0.0 so equal floats
            // land in the same bucket.
            Value::Float(f) => {
                let f = if *f == 0.0 { 0.0f32 } else { *f };
                f.to_bits().hash(state);
            }
            Value::Double(d) => {
                let d = if *d == 0.0 { 0.0f64 } else { *d };
                d.to_bits().hash(state);
            }
            Value::Char(c) => c.hash(state),
            Value::String(s) => s.hash(state),
            Value::Object(o) => (Arc::as_ptr(o) as usize).hash(state),
            Value::Array(a) => (Arc::as_ptr(a) as usize).hash(state),
            Value::Lambda(l) => (Arc::as_ptr(l) as usize).hash(state),
            Value::Map(m) => (Arc::as_ptr(m) as usize).hash(state),
            Value::Set(s) => (Arc::as_ptr(s) as usize).hash(state),
            Value::IntMap(m) => (Arc::as_ptr(m) as usize).hash(state),
            Value::IntSet(s) => (Arc::as_ptr(s) as usize).hash(state),
            Value::Iterator(it) => (Arc::as_ptr(it) as usize).hash(state),
            Value::Future(t) => (Arc::as_ptr(t) as usize).hash(state),
        }
    }
}

/// View of a function descriptor in the constant pool. Descriptors are
/// Objects with the fixed field layout
/// `[parameterCount, registerCount, codeIndex, name]`.
#[derive(Debug, Clone)]
pub struct FunctionMeta {
    pub parameter_count: usize,
    pub register_count: usize,
    pub code_index: usize,
    pub name: String,
}

impl FunctionMeta {
    pub fn from_value(value: &Value) -> VmResult<FunctionMeta> {
        let object = value
            .as_object()
            .map_err(|_| VmError::runtime("Constant pool entry is not a function descriptor"))?;
        let data = object.lock();
        if data.fields.len() < 4 {
            return Err(VmError::runtime(
                "Constant pool entry is not a function descriptor",
            ));
        }
        Ok(FunctionMeta {
            parameter_count: data.fields[0].as_int()? as usize,
            register_count: data.fields[1].as_int()? as usize,
            code_index: data.fields[2].as_int()? as usize,
            name: data.fields[3].as_str()?.to_string(),
        })
    }

    pub fn into_value(self) -> Value {
        Value::Object(Arc::new(Mutex::new(ObjectData {
            class_idx: -1,
            fields: vec![
                Value::Int(self.parameter_count as i32),
                Value::Int(self.register_count as i32),
                Value::Int(self.code_index as i32),
                Value::String(self.name),
            ],
        })))
    }
}

/// View of a class descriptor in the constant pool. Descriptors are Objects
/// with the fixed field layout `[name, fieldCount, methodCount, fieldNames]`.
#[derive(Debug, Clone)]
pub struct ClassMeta {
    pub name: String,
    pub field_count: usize,
    pub method_count: usize,
    pub field_names: Vec<String>,
}

impl ClassMeta {
    pub fn from_value(value: &Value) -> VmResult<ClassMeta> {
        let object = value
            .as_object()
            .map_err(|_| VmError::runtime("Constant pool entry is not a class descriptor"))?;
        let data = object.lock();
        if data.fields.len() < 4 {
            return Err(VmError::runtime(
                "Constant pool entry is not a class descriptor",
            ));
        }
        let mut field_names = Vec::new();
        if let Value::Array(names) = &data.fields[3] {
            for name in names.lock().iter() {
                if let Value::String(s) = name {
                    field_names.push(s.clone());
                }
            }
        }
        Ok(ClassMeta {
            name: data.fields[0].as_str()?.to_string(),
            field_count: data.fields[1].as_int()? as usize,
            method_count: data.fields[2].as_int()? as usize,
            field_names,
        })
    }

    pub fn into_value(self) -> Value {
        let names = self
            .field_names
            .into_iter()
            .map(Value::String)
            .collect::<Vec<_>>();
        Value::Object(Arc::new(Mutex::new(ObjectData {
            class_idx: -1,
            fields: vec![
                Value::String(self.name),
                Value::Int(self.field_count as i32),
                Value::Int(self.method_count as i32),
                Value::array_from(names),
            ],
        })))
    }
}
