use thiserror::Error;

use crate::value::ValueType;

/// Errors raised while executing bytecode. Fatal to the running thread.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("type error: expected {expected}, found {found}")]
    Type {
        expected: ValueType,
        found: ValueType,
    },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Modulo by zero")]
    ModuloByZero,
    #[error("Division by zero ({0})")]
    NearZeroDivisor(&'static str),
    #[error("Register index out of bounds: {0}")]
    RegisterOutOfBounds(u8),
    #[error("Constant pool index out of bounds: {0}")]
    ConstantOutOfBounds(usize),
    #[error("Global variable index out of bounds: {0}")]
    GlobalOutOfBounds(usize),
    #[error("External function not found: {0}")]
    UnknownExtern(String),
    #[error("{0}")]
    Runtime(String),
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl VmError {
    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime(message.into())
    }
}

pub type VmResult<T> = Result<T, VmError>;

/// Errors raised while decoding a bytecode document. Loading aborts.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid bytecode JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bytecode root must be an object")]
    RootNotObject,
    #[error("missing '{0}'")]
    MissingField(&'static str),
    #[error("'{0}' has the wrong type")]
    FieldType(&'static str),
    #[error("unsupported constant type: {0}")]
    UnsupportedConstant(String),
    #[error("invalid entry point {0}")]
    InvalidEntryPoint(i64),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err.to_string())
    }
}
