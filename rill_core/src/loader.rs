use std::fs;
use std::path::Path;

use serde_json::Value as JsonValue;
use tracing::warn;

use crate::debug::{
    DebugInfo, FileInfo, FunctionInfo, LocationKind, SourceMapEntry, VariableInfo,
    VariableLocation,
};
use crate::error::LoadError;
use crate::opcode::Instruction;
use crate::value::{ClassMeta, FunctionMeta, Value};

const SUPPORTED_VERSION: &str = "1.0.0";

/// Everything materialised from a bytecode document.
#[derive(Debug, Clone, Default)]
pub struct LoadedProgram {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub entry_point: usize,
    pub global_count: usize,
    pub debug_info: Option<DebugInfo>,
}

pub fn load_file(path: impl AsRef<Path>) -> Result<LoadedProgram, LoadError> {
    let content = fs::read_to_string(path)?;
    load_str(&content)
}

pub fn load_str(content: &str) -> Result<LoadedProgram, LoadError> {
    let root: JsonValue = serde_json::from_str(content)?;
    let root = root.as_object().ok_or(LoadError::RootNotObject)?;

    let version = get_str(root, "version")?;
    if version != SUPPORTED_VERSION {
        warn!(version, "bytecode version may not be fully supported");
    }

    let mut program = LoadedProgram::default();
    if let Some(constants) = root.get("constants") {
        let constants = constants
            .as_array()
            .ok_or(LoadError::FieldType("constants"))?;
        program.constants = load_constants(constants)?;
    }

    let instructions = root
        .get("instructions")
        .ok_or(LoadError::MissingField("instructions"))?
        .as_array()
        .ok_or(LoadError::FieldType("instructions"))?;
    program.instructions = load_instructions(instructions)?;

    let entry_point = get_i64(root, "entryPoint")?;
    if entry_point < 0 || entry_point as usize >= program.instructions.len() {
        return Err(LoadError::InvalidEntryPoint(entry_point));
    }
    program.entry_point = entry_point as usize;

    program.global_count = root
        .get("globalCount")
        .and_then(JsonValue::as_i64)
        .unwrap_or(0)
        .max(0) as usize;

    if let Some(debug) = root.get("debug") {
        match load_debug_info(debug) {
            Ok(info) => program.debug_info = Some(info),
            Err(err) => warn!(error = %err, "debug info load failed"),
        }
    }

    Ok(program)
}

fn load_constants(entries: &[JsonValue]) -> Result<Vec<Value>, LoadError> {
    let mut constants = Vec::with_capacity(entries.len());
    for entry in entries {
        let object = entry.as_object().ok_or(LoadError::FieldType("constants"))?;
        let kind = get_str(object, "type")?;
        let value = match kind {
            "null" => Value::Null,
            "bool" => Value::Bool(get_field(object, "value")?.as_bool().ok_or(
                LoadError::FieldType("value"),
            )?),
            "int" => Value::Int(get_i64(object, "value")? as i32),
            "float" => Value::Float(get_f64(object, "value")? as f32),
            "double" => Value::Double(get_f64(object, "value")?),
            "string" => Value::string(get_str(object, "value")?),
            "function" => {
                let body = get_field(object, "value")?
                    .as_object()
                    .ok_or(LoadError::FieldType("value"))?;
                FunctionMeta {
                    parameter_count: get_i64(body, "parameterCount")? as usize,
                    register_count: get_i64(body, "registerCount")? as usize,
                    code_index: get_i64(body, "codeIndex")? as usize,
                    name: get_str(body, "name")?.to_string(),
                }
                .into_value()
            }
            "class" => {
                let body = get_field(object, "value")?
                    .as_object()
                    .ok_or(LoadError::FieldType("value"))?;
                let field_names = body
                    .get("fields")
                    .and_then(JsonValue::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(JsonValue::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                ClassMeta {
                    name: get_str(body, "name")?.to_string(),
                    field_count: get_i64(body, "fieldCount")? as usize,
                    method_count: get_i64(body, "methodCount")? as usize,
                    field_names,
                }
                .into_value()
            }
            other => return Err(LoadError::UnsupportedConstant(other.to_string())),
        };
        constants.push(value);
    }
    Ok(constants)
}

fn load_instructions(entries: &[JsonValue]) -> Result<Vec<Instruction>, LoadError> {
    let mut instructions = Vec::with_capacity(entries.len());
    for entry in entries {
        let object = entry
            .as_object()
            .ok_or(LoadError::FieldType("instructions"))?;
        instructions.push(Instruction {
            opcode: get_i64(object, "opcode")? as u8,
            a: get_i64(object, "a")? as u8,
            b: get_i64(object, "b")? as u8,
            c: get_i64(object, "c")? as u8,
        });
    }
    Ok(instructions)
}

fn load_debug_info(debug: &JsonValue) -> Result<DebugInfo, LoadError> {
    let debug = debug.as_object().ok_or(LoadError::FieldType("debug"))?;
    let mut info = DebugInfo::default();

    if let Some(entries) = debug.get("sourceMap").and_then(JsonValue::as_array) {
        for entry in entries {
            let o = entry.as_object().ok_or(LoadError::FieldType("sourceMap"))?;
            info.source_map.push(SourceMapEntry {
                instruction_index: get_i64(o, "instructionIndex")?.max(0) as usize,
                source_line: get_i64(o, "sourceLine")? as i32,
                source_column: get_i64(o, "sourceColumn")? as i32,
                file_index: get_i64(o, "fileIndex")? as i32,
            });
        }
    }

    if let Some(entries) = debug.get("functions").and_then(JsonValue::as_array) {
        for entry in entries {
            let o = entry.as_object().ok_or(LoadError::FieldType("functions"))?;
            info.functions.push(FunctionInfo {
                name: get_str(o, "name")?.to_string(),
                start_instruction: get_i64(o, "startInstruction")?.max(0) as usize,
                end_instruction: get_i64(o, "endInstruction")?.max(0) as usize,
                file_index: get_i64(o, "fileIndex")? as i32,
                source_line: get_i64(o, "sourceLine")? as i32,
                source_column: get_i64(o, "sourceColumn")? as i32,
                parameter_count: get_i64(o, "parameterCount")?.max(0) as usize,
                local_variable_count: get_i64(o, "localVariableCount")?.max(0) as usize,
            });
        }
    }

    if let Some(entries) = debug.get("variables").and_then(JsonValue::as_array) {
        for entry in entries {
            let o = entry.as_object().ok_or(LoadError::FieldType("variables"))?;
            let location = get_field(o, "location")?
                .as_object()
                .ok_or(LoadError::FieldType("location"))?;
            let kind = match get_str(location, "type")? {
                "register" => LocationKind::Register,
                "global" => LocationKind::Global,
                "constant" => LocationKind::Constant,
                _ => return Err(LoadError::FieldType("location")),
            };
            let end = get_i64(o, "endInstruction")?;
            info.variables.push(VariableInfo {
                name: get_str(o, "name")?.to_string(),
                type_name: get_str(o, "type")?.to_string(),
                start_instruction: get_i64(o, "startInstruction")?.max(0) as usize,
                end_instruction: if end < 0 { None } else { Some(end as usize) },
                location: VariableLocation {
                    kind,
                    index: get_i64(location, "index")?.max(0) as usize,
                },
            });
        }
    }

    if let Some(entries) = debug.get("files").and_then(JsonValue::as_array) {
        for entry in entries {
            let o = entry.as_object().ok_or(LoadError::FieldType("files"))?;
            info.files.push(FileInfo {
                path: get_str(o, "path")?.to_string(),
                content: o
                    .get("content")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            });
        }
    }

    Ok(info)
}

fn get_field<'a>(
    object: &'a serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<&'a JsonValue, LoadError> {
    object.get(key).ok_or(LoadError::MissingField(key))
}

fn get_str<'a>(
    object: &'a serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<&'a str, LoadError> {
    get_field(object, key)?
        .as_str()
        .ok_or(LoadError::FieldType(key))
}

fn get_i64(
    object: &serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<i64, LoadError> {
    get_field(object, key)?
        .as_i64()
        .ok_or(LoadError::FieldType(key))
}

fn get_f64(
    object: &serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<f64, LoadError> {
    get_field(object, key)?
        .as_f64()
        .ok_or(LoadError::FieldType(key))
}
