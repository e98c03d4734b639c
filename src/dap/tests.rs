//=============================================
// src/dap/tests.rs
//=============================================
// Purpose: DAP request handling against an in-memory channel: breakpoint
//          stop flow, stepping, introspection and error responses.
//=============================================

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use rill_core::debug::{
    DebugInfo, FileInfo, FunctionInfo, LocationKind, SourceMapEntry, VariableInfo,
    VariableLocation,
};
use rill_core::{Instruction, Opcode};

use crate::vm::{ProgramImage, Vm};

use super::channel::MessageWriter;
use super::handler::{DapHandler, DapSession};

#[derive(Clone, Default)]
struct SharedWriter {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MessageWriter for SharedWriter {
    fn write_message(&mut self, payload: &str) -> io::Result<()> {
        self.messages.lock().push(payload.to_string());
        Ok(())
    }
}

struct Harness {
    handler: DapHandler,
    messages: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(vm: &Vm) -> Harness {
        let writer = SharedWriter::default();
        let messages = writer.messages.clone();
        let session = DapSession::new(Box::new(writer));
        Harness {
            handler: DapHandler::new(vm, session),
            messages,
        }
    }

    fn request(&mut self, seq: i64, command: &str, arguments: JsonValue) {
        let mut message = json!({"seq": seq, "type": "request", "command": command});
        if !arguments.is_null() {
            message["arguments"] = arguments;
        }
        self.handler.process_message(&message.to_string());
    }

    fn parsed(&self) -> Vec<JsonValue> {
        self.messages
            .lock()
            .iter()
            .map(|m| serde_json::from_str(m).expect("well-formed outgoing JSON"))
            .collect()
    }

    fn response_for(&self, command: &str) -> Option<JsonValue> {
        self.parsed()
            .into_iter()
            .rev()
            .find(|m| m["type"] == "response" && m["command"] == command)
    }

    fn wait_for_event(&self, event: &str, predicate: impl Fn(&JsonValue) -> bool) -> JsonValue {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(found) = self
                .parsed()
                .into_iter()
                .find(|m| m["type"] == "event" && m["event"] == event && predicate(m))
            {
                return found;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {event} event"
            );
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Instruction 5 maps to line 42 of main.do; r1 holds variable `x` from
/// instruction 1 onward.
fn debuggable_program() -> (Arc<ProgramImage>, DebugInfo) {
    let code = vec![
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 1, 1),
        Instruction::op(Opcode::Nop, 0),
        Instruction::op(Opcode::Nop, 0),
        Instruction::op(Opcode::Nop, 0),
        Instruction::op(Opcode::Nop, 0),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 0, 7),
        Instruction::op(Opcode::Halt, 0),
    ];
    let debug_info = DebugInfo {
        source_map: vec![
            SourceMapEntry {
                instruction_index: 0,
                source_line: 40,
                source_column: 1,
                file_index: 0,
            },
            SourceMapEntry {
                instruction_index: 2,
                source_line: 41,
                source_column: 1,
                file_index: 0,
            },
            SourceMapEntry {
                instruction_index: 5,
                source_line: 42,
                source_column: 3,
                file_index: 0,
            },
        ],
        functions: vec![FunctionInfo {
            name: "main".to_string(),
            start_instruction: 0,
            end_instruction: 6,
            file_index: 0,
            source_line: 40,
            source_column: 1,
            parameter_count: 0,
            local_variable_count: 1,
        }],
        variables: vec![VariableInfo {
            name: "x".to_string(),
            type_name: "int".to_string(),
            start_instruction: 1,
            end_instruction: None,
            location: VariableLocation {
                kind: LocationKind::Register,
                index: 1,
            },
        }],
        files: vec![FileInfo {
            path: "main.do".to_string(),
            content: None,
        }],
    };
    (
        Arc::new(ProgramImage {
            code,
            constants: Vec::new(),
        }),
        debug_info,
    )
}

#[test]
fn initialize_reports_capabilities_and_fires_initialized() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.request(1, "initialize", JsonValue::Null);

    let response = harness.response_for("initialize").expect("response sent");
    assert_eq!(response["success"], true);
    assert_eq!(response["request_seq"], 1);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);
    harness.wait_for_event("initialized", |_| true);
}

#[test]
fn launch_without_bytecode_fails() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.request(1, "launch", JsonValue::Null);
    let response = harness.response_for("launch").expect("response sent");
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "No bytecode loaded");
}

#[test]
fn unknown_commands_fail_politely() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.request(1, "gotoTargets", JsonValue::Null);
    let response = harness.response_for("gotoTargets").expect("response sent");
    assert_eq!(response["success"], false);
    assert!(response["message"]
        .as_str()
        .expect("error message")
        .contains("Command not supported"));
}

#[test]
fn evaluate_is_not_supported() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.request(1, "evaluate", json!({"expression": "1 + 1"}));
    let response = harness.response_for("evaluate").expect("response sent");
    assert_eq!(response["success"], false);
}

#[test]
fn malformed_json_is_ignored_and_the_session_continues() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.handler.process_message("{ not json");
    harness.request(1, "initialize", JsonValue::Null);
    assert!(harness.response_for("initialize").is_some());
}

#[test]
fn upload_bytecode_installs_a_program() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    let document = r#"{
      "version": "1.0.0",
      "constants": [],
      "instructions": [{"opcode": 1, "a": 0, "b": 0, "c": 0}],
      "entryPoint": 0,
      "globalCount": 0
    }"#;
    harness.request(1, "uploadBytecode", json!({"bytecode": document}));
    let response = harness
        .response_for("uploadBytecode")
        .expect("response sent");
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["instructions"], 1);

    // A launch is now possible.
    harness.request(2, "launch", JsonValue::Null);
    assert_eq!(
        harness.response_for("launch").expect("response")["success"],
        true
    );
}

#[test]
fn upload_bytecode_rejects_bad_documents() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.request(1, "uploadBytecode", json!({"bytecode": "{"}));
    let response = harness
        .response_for("uploadBytecode")
        .expect("response sent");
    assert_eq!(response["success"], false);
    assert!(response["message"]
        .as_str()
        .expect("error message")
        .starts_with("Load failed"));
}

#[test]
fn set_breakpoints_verifies_against_the_source_map() {
    let vm = Vm::new();
    let (program, debug_info) = debuggable_program();
    vm.debug().state.lock().set_debug_info(debug_info);
    let mut harness = Harness::new(&vm);
    harness.handler.set_program(program, 0, 0);

    harness.request(
        1,
        "setBreakpoints",
        json!({
            "source": {"path": "main.do"},
            "breakpoints": [{"line": 42}, {"line": 9999}],
        }),
    );
    let response = harness
        .response_for("setBreakpoints")
        .expect("response sent");
    let breakpoints = response["body"]["breakpoints"]
        .as_array()
        .expect("breakpoints array");
    assert_eq!(breakpoints.len(), 2);
    assert_eq!(breakpoints[0]["verified"], true);
    assert_eq!(breakpoints[0]["line"], 42);
    assert_eq!(breakpoints[1]["verified"], false);

    // The unresolved line produced a stderr output event.
    let output = harness.wait_for_event("output", |m| m["body"]["category"] == "stderr");
    assert!(output["body"]["output"]
        .as_str()
        .expect("output text")
        .contains("unresolved breakpoint"));
}

#[test]
fn breakpoint_stop_flow_reports_stack_scopes_and_variables() {
    let vm = Vm::new();
    let (program, debug_info) = debuggable_program();
    vm.debug().state.lock().set_debug_info(debug_info);
    let mut harness = Harness::new(&vm);
    harness.handler.set_program(program, 0, 0);

    harness.request(1, "initialize", JsonValue::Null);
    harness.request(2, "launch", json!({"stopOnEntry": false}));
    harness.wait_for_event("stopped", |m| m["body"]["reason"] == "entry");
    harness.request(
        3,
        "setBreakpoints",
        json!({"source": {"path": "main.do"}, "breakpoints": [{"line": 42}]}),
    );
    harness.request(4, "configurationDone", JsonValue::Null);
    harness.request(5, "continue", JsonValue::Null);

    harness.wait_for_event("stopped", |m| m["body"]["reason"] == "breakpoint");

    harness.request(6, "threads", JsonValue::Null);
    let threads = harness.response_for("threads").expect("response sent");
    assert_eq!(threads["body"]["threads"][0]["name"], "main");

    harness.request(7, "stackTrace", json!({"threadId": 1}));
    let stack = harness.response_for("stackTrace").expect("response sent");
    let frame = &stack["body"]["stackFrames"][0];
    assert_eq!(frame["name"], "main");
    assert_eq!(frame["line"], 42);
    assert_eq!(frame["source"]["path"], "main.do");

    harness.request(8, "scopes", json!({"frameId": 1}));
    let scopes = harness.response_for("scopes").expect("response sent");
    assert_eq!(scopes["body"]["scopes"][0]["name"], "Locals");

    harness.request(9, "variables", json!({"variablesReference": 1}));
    let variables = harness.response_for("variables").expect("response sent");
    let listed = variables["body"]["variables"]
        .as_array()
        .expect("variables array");
    assert!(listed
        .iter()
        .any(|v| v["name"] == "x" && v["value"] == "1"));

    harness.request(10, "continue", JsonValue::Null);
    harness.wait_for_event("terminated", |_| true);
}

#[test]
fn stepping_stops_on_the_next_source_line() {
    let vm = Vm::new();
    let (program, debug_info) = debuggable_program();
    vm.debug().state.lock().set_debug_info(debug_info);
    let mut harness = Harness::new(&vm);
    harness.handler.set_program(program, 0, 0);

    harness.request(1, "initialize", JsonValue::Null);
    harness.request(2, "launch", JsonValue::Null);
    harness.request(
        3,
        "setBreakpoints",
        json!({"source": {"path": "main.do"}, "breakpoints": [{"line": 40}]}),
    );
    harness.request(4, "continue", JsonValue::Null);
    harness.wait_for_event("stopped", |m| m["body"]["reason"] == "breakpoint");

    // Step over: the next stop is line 41 (instruction 2).
    harness.request(5, "next", JsonValue::Null);
    harness.wait_for_event("stopped", |m| m["body"]["reason"] == "step");
    harness.request(6, "stackTrace", json!({"threadId": 1}));
    let stack = harness.response_for("stackTrace").expect("response sent");
    assert_eq!(stack["body"]["stackFrames"][0]["line"], 41);

    harness.request(7, "continue", JsonValue::Null);
    harness.wait_for_event("terminated", |_| true);
}

#[test]
fn disconnect_terminates_the_session() {
    let vm = Vm::new();
    let mut harness = Harness::new(&vm);
    harness.request(1, "disconnect", JsonValue::Null);
    assert!(harness.handler.is_terminated());
    assert_eq!(
        harness.response_for("disconnect").expect("response")["success"],
        true
    );
}
