//=============================================
// rill_core/tests/loader.rs
//=============================================
// Purpose: Validate JSON bytecode decoding, constants and debug info.
//=============================================

use std::io::Write;

use rill_core::loader::{load_file, load_str};
use rill_core::value::{ClassMeta, FunctionMeta};
use rill_core::{LoadError, Opcode, Value};

const HELLO_PROGRAM: &str = r#"{
  "version": "1.0.0",
  "constants": [
    {"type": "string", "value": "Hello world!"},
    {"type": "string", "value": "println"},
    {"type": "function", "value": {"name": "main", "parameterCount": 0, "registerCount": 3, "codeIndex": 2}}
  ],
  "instructions": [
    {"opcode": 161, "a": 1, "b": 0, "c": 2},
    {"opcode": 1, "a": 0, "b": 0, "c": 0},
    {"opcode": 17, "a": 2, "b": 0, "c": 0},
    {"opcode": 163, "a": 2, "b": 0, "c": 1},
    {"opcode": 16, "a": 1, "b": 0, "c": 0},
    {"opcode": 18, "a": 0, "b": 0, "c": 0},
    {"opcode": 162, "a": 0, "b": 0, "c": 0}
  ],
  "entryPoint": 0,
  "globalCount": 0
}"#;

#[test]
fn loads_constants_and_instructions() {
    let program = load_str(HELLO_PROGRAM).expect("load bytecode");
    assert_eq!(program.instructions.len(), 7);
    assert_eq!(program.entry_point, 0);
    assert_eq!(program.global_count, 0);
    assert_eq!(program.constants[0], Value::string("Hello world!"));
    assert_eq!(
        program.instructions[0].opcode(),
        Some(Opcode::Call),
        "first instruction decodes as CALL"
    );

    let meta = FunctionMeta::from_value(&program.constants[2]).expect("function descriptor");
    assert_eq!(meta.name, "main");
    assert_eq!(meta.parameter_count, 0);
    assert_eq!(meta.register_count, 3);
    assert_eq!(meta.code_index, 2);
}

#[test]
fn loads_class_constants_with_field_names() {
    let doc = r#"{
      "version": "1.0.0",
      "constants": [
        {"type": "class", "value": {"name": "Point", "fieldCount": 2, "methodCount": 0, "fields": ["x", "y"]}}
      ],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 0,
      "globalCount": 0
    }"#;
    let program = load_str(doc).expect("load bytecode");
    let meta = ClassMeta::from_value(&program.constants[0]).expect("class descriptor");
    assert_eq!(meta.name, "Point");
    assert_eq!(meta.field_count, 2);
    assert_eq!(meta.field_names, vec!["x", "y"]);
}

#[test]
fn missing_instructions_is_a_hard_error() {
    let doc = r#"{"version": "1.0.0", "constants": [], "entryPoint": 0}"#;
    let err = load_str(doc).expect_err("must reject");
    assert!(matches!(err, LoadError::MissingField("instructions")));
}

#[test]
fn unknown_constant_type_is_a_hard_error() {
    let doc = r#"{
      "version": "1.0.0",
      "constants": [{"type": "decimal", "value": 1}],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 0
    }"#;
    let err = load_str(doc).expect_err("must reject");
    assert!(matches!(err, LoadError::UnsupportedConstant(ref t) if t == "decimal"));
}

#[test]
fn entry_point_must_be_inside_instructions() {
    let doc = r#"{
      "version": "1.0.0",
      "constants": [],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 5
    }"#;
    let err = load_str(doc).expect_err("must reject");
    assert!(matches!(err, LoadError::InvalidEntryPoint(5)));
}

#[test]
fn malformed_json_is_a_hard_error() {
    assert!(matches!(
        load_str("{ not json").expect_err("must reject"),
        LoadError::Json(_)
    ));
}

#[test]
fn other_versions_still_load() {
    let doc = r#"{
      "version": "0.9.0",
      "constants": [],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 0
    }"#;
    let program = load_str(doc).expect("warn but load");
    assert_eq!(program.instructions.len(), 1);
}

#[test]
fn global_count_defaults_to_zero() {
    let doc = r#"{
      "version": "1.0.0",
      "constants": [],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 0
    }"#;
    let program = load_str(doc).expect("load bytecode");
    assert_eq!(program.global_count, 0);
}

#[test]
fn broken_debug_info_downgrades_to_warning() {
    let doc = r#"{
      "version": "1.0.0",
      "constants": [],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 0,
      "debug": {"sourceMap": [{"instructionIndex": "zero"}]}
    }"#;
    let program = load_str(doc).expect("load despite bad debug info");
    assert!(program.debug_info.is_none());
}

#[test]
fn loads_debug_info_sections() {
    let doc = r#"{
      "version": "1.0.0",
      "constants": [],
      "instructions": [
        {"opcode": 0, "a": 0, "b": 0, "c": 0},
        {"opcode": 1, "a": 0, "b": 0, "c": 0}
      ],
      "entryPoint": 0,
      "debug": {
        "sourceMap": [{"instructionIndex": 0, "sourceLine": 42, "sourceColumn": 1, "fileIndex": 0}],
        "functions": [{"name": "main", "startInstruction": 0, "endInstruction": 1, "fileIndex": 0,
                        "sourceLine": 42, "sourceColumn": 1, "parameterCount": 0, "localVariableCount": 1}],
        "variables": [{"name": "x", "type": "int", "startInstruction": 0, "endInstruction": -1,
                        "location": {"type": "register", "index": 1}}],
        "files": [{"path": "main.do"}]
      }
    }"#;
    let program = load_str(doc).expect("load bytecode");
    let debug = program.debug_info.expect("debug info present");
    assert_eq!(debug.source_map.len(), 1);
    assert_eq!(debug.source_map[0].source_line, 42);
    assert_eq!(debug.functions[0].name, "main");
    assert_eq!(debug.variables[0].name, "x");
    assert!(debug.variables[0].end_instruction.is_none());
    assert_eq!(debug.files[0].path, "main.do");
}

#[test]
fn load_file_reads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(HELLO_PROGRAM.as_bytes()).expect("write bytecode");
    let program = load_file(file.path()).expect("load from file");
    assert_eq!(program.instructions.len(), 7);
}
