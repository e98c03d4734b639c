use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, warn};

use rill_core::debug::{FileInfo, LocationKind, StepMode};
use rill_core::{loader, Value};

use crate::vm::thread::VmThread;
use crate::vm::{DebugControl, OutputSink, ProgramImage, SharedState, Vm};

use super::channel::{MessageReader, MessageWriter};

/// Outgoing half of a DAP session: owns the writer and the sequence
/// counter. Shared with the interpreter thread (output redirection and
/// stopped events), so every send is atomic at the channel level.
pub struct DapSession {
    writer: Mutex<Box<dyn MessageWriter>>,
    seq: AtomicI64,
}

impl DapSession {
    pub fn new(writer: Box<dyn MessageWriter>) -> Arc<DapSession> {
        Arc::new(DapSession {
            writer: Mutex::new(writer),
            seq: AtomicI64::new(0),
        })
    }

    fn send(&self, mut message: JsonValue) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        message["seq"] = json!(seq);
        let payload = message.to_string();
        if let Err(err) = self.writer.lock().write_message(&payload) {
            warn!("failed to write DAP message: {err}");
        }
    }

    pub fn send_response(
        &self,
        request_seq: i64,
        command: &str,
        success: bool,
        body: Option<JsonValue>,
        message: Option<String>,
    ) {
        let mut response = json!({
            "type": "response",
            "command": command,
            "request_seq": request_seq,
            "success": success,
        });
        if let Some(body) = body {
            response["body"] = body;
        }
        if let Some(text) = message {
            response["message"] = json!(text);
        }
        self.send(response);
    }

    pub fn send_event(&self, event: &str, body: Option<JsonValue>) {
        let mut message = json!({"type": "event", "event": event});
        if let Some(body) = body {
            message["body"] = body;
        }
        self.send(message);
    }

    pub fn send_output(&self, output: &str, category: &str) {
        self.send_event(
            "output",
            Some(json!({"category": category, "output": output})),
        );
    }
}

struct ArrayVariable {
    register_index: usize,
    element_type: String,
}

/// Debug Adapter Protocol request handler. Reads framed requests, mutates
/// the debug state, drives the interpreter through the pause gate, and
/// emits responses and events.
pub struct DapHandler {
    shared: Arc<SharedState>,
    debug: Arc<DebugControl>,
    session: Arc<DapSession>,
    program: Option<Arc<ProgramImage>>,
    entry_point: usize,
    global_count: usize,
    initialized: bool,
    launched: bool,
    execution_started: bool,
    terminated: bool,
    stop_on_entry: bool,
    array_refs: HashMap<i64, ArrayVariable>,
    // Reference 1 is the Locals scope; arrays get 2 upward.
    next_variable_reference: i64,
}

impl DapHandler {
    pub fn new(vm: &Vm, session: Arc<DapSession>) -> DapHandler {
        {
            let session = session.clone();
            vm.set_output(OutputSink::Handler(Arc::new(move |text, category| {
                session.send_output(text, category);
            })));
        }
        {
            let session = session.clone();
            vm.debug().set_stopped_callback(Arc::new(move |reason| {
                session.send_event(
                    "stopped",
                    Some(json!({
                        "reason": reason.as_str(),
                        "threadId": 1,
                        "allThreadsStopped": true,
                    })),
                );
            }));
        }
        DapHandler {
            shared: vm.shared().clone(),
            debug: vm.debug().clone(),
            session,
            program: None,
            entry_point: 0,
            global_count: 0,
            initialized: false,
            launched: false,
            execution_started: false,
            terminated: false,
            stop_on_entry: true,
            array_refs: HashMap::new(),
            next_variable_reference: 2,
        }
    }

    pub fn set_program(
        &mut self,
        program: Arc<ProgramImage>,
        entry_point: usize,
        global_count: usize,
    ) {
        self.program = Some(program);
        self.entry_point = entry_point;
        self.global_count = global_count;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn session(&self) -> &Arc<DapSession> {
        &self.session
    }

    /// Serve requests until `disconnect` or transport EOF.
    pub fn run(&mut self, reader: &mut dyn MessageReader) {
        while !self.terminated {
            match reader.read_message() {
                Ok(Some(payload)) => self.process_message(&payload),
                Ok(None) => break,
                Err(err) => {
                    error!("DAP transport error: {err}");
                    break;
                }
            }
        }
    }

    /// Handle one request. Malformed JSON is logged and the session
    /// continues.
    pub fn process_message(&mut self, payload: &str) {
        let message: JsonValue = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(err) => {
                error!("DAP Error: {err}");
                return;
            }
        };
        if message["type"] != "request" {
            return;
        }
        let request_seq = message["seq"].as_i64().unwrap_or(0);
        let command = message["command"].as_str().unwrap_or("").to_string();
        let arguments = message
            .get("arguments")
            .cloned()
            .unwrap_or(JsonValue::Null);
        debug!(command = %command, "handling DAP request");

        match command.as_str() {
            "initialize" => self.handle_initialize(request_seq),
            "launch" => self.handle_launch(request_seq, &arguments),
            "configurationDone" => {
                // Execution still waits for the first continue.
                self.session
                    .send_response(request_seq, "configurationDone", true, None, None);
            }
            "uploadBytecode" => self.handle_upload_bytecode(request_seq, &arguments),
            "setBreakpoints" => self.handle_set_breakpoints(request_seq, &arguments),
            "continue" => self.handle_continue(request_seq),
            "next" => self.handle_step(request_seq, "next", StepMode::StepOver),
            "stepIn" => self.handle_step(request_seq, "stepIn", StepMode::StepIn),
            "stepOut" => self.handle_step(request_seq, "stepOut", StepMode::StepOut),
            "pause" => {
                self.debug.request_pause();
                self.session
                    .send_response(request_seq, "pause", true, None, None);
            }
            "threads" => {
                self.session.send_response(
                    request_seq,
                    "threads",
                    true,
                    Some(json!({"threads": [{"id": 1, "name": "main"}]})),
                    None,
                );
            }
            "stackTrace" => self.handle_stack_trace(request_seq),
            "scopes" => {
                self.session.send_response(
                    request_seq,
                    "scopes",
                    true,
                    Some(json!({
                        "scopes": [{"name": "Locals", "variablesReference": 1, "expensive": false}]
                    })),
                    None,
                );
            }
            "variables" => self.handle_variables(request_seq, &arguments),
            "evaluate" => {
                self.session.send_response(
                    request_seq,
                    "evaluate",
                    false,
                    None,
                    Some("Expression evaluation not implemented".to_string()),
                );
            }
            "disconnect" => {
                self.session
                    .send_response(request_seq, "disconnect", true, None, None);
                self.terminated = true;
            }
            other => {
                self.session.send_response(
                    request_seq,
                    other,
                    false,
                    None,
                    Some(format!("Command not supported: {other}")),
                );
            }
        }
    }

    fn handle_initialize(&mut self, request_seq: i64) {
        let capabilities = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsFunctionBreakpoints": false,
            "supportsConditionalBreakpoints": false,
            "supportsHitConditionalBreakpoints": false,
            "supportsEvaluateForHovers": false,
            "supportsStepBack": false,
            "supportsSetVariable": false,
            "supportsRestartFrame": false,
            "supportsGotoTargetsRequest": false,
            "supportsStepInTargetsRequest": false,
            "supportsCompletionsRequest": false,
            "supportsModulesRequest": false,
            "supportsRestartRequest": false,
            "supportsExceptionOptions": false,
            "supportsValueFormattingOptions": false,
            "supportsExceptionInfoRequest": false,
            "supportTerminateDebuggee": true,
            "supportSuspendDebuggee": true,
            "supportsDelayedStackTraceLoading": false,
            "supportsLoadedSourcesRequest": false,
            "supportsLogPoints": false,
            "supportsTerminateThreadsRequest": false,
            "supportsSetExpression": false,
            "supportsTerminateRequest": true,
            "supportsDataBreakpoints": false,
            "supportsReadMemoryRequest": false,
            "supportsWriteMemoryRequest": false,
            "supportsDisassembleRequest": false,
            "supportsCancelRequest": false,
            "supportsBreakpointLocationsRequest": false,
            "supportsClipboardContext": false,
        });
        self.session
            .send_response(request_seq, "initialize", true, Some(capabilities), None);
        self.initialized = true;
        self.session.send_event("initialized", None);
    }

    fn handle_launch(&mut self, request_seq: i64, arguments: &JsonValue) {
        if self.program.is_none() {
            self.session.send_response(
                request_seq,
                "launch",
                false,
                None,
                Some("No bytecode loaded".to_string()),
            );
            return;
        }
        if !self.initialized {
            debug!("launch received before initialize");
        }
        self.stop_on_entry = arguments
            .get("stopOnEntry")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true);
        debug!(stop_on_entry = self.stop_on_entry, "launch configured");
        self.session
            .send_response(request_seq, "launch", true, None, None);
        self.launched = true;

        self.session.send_event(
            "process",
            Some(json!({
                "name": "rillvm",
                "systemProcessId": 1,
                "isLocalProcess": true,
                "startMethod": "launch",
            })),
        );

        // Always pause at entry; the client continues when it is done
        // configuring, which removes the race with breakpoint setup.
        self.debug.request_pause();
        self.session.send_event(
            "stopped",
            Some(json!({"reason": "entry", "threadId": 1, "allThreadsStopped": true})),
        );
    }

    fn handle_upload_bytecode(&mut self, request_seq: i64, arguments: &JsonValue) {
        let Some(bytecode) = arguments.get("bytecode").and_then(JsonValue::as_str) else {
            self.session.send_response(
                request_seq,
                "uploadBytecode",
                false,
                None,
                Some("Missing bytecode string".to_string()),
            );
            return;
        };
        match loader::load_str(bytecode) {
            Ok(program) => {
                if let Some(info) = program.debug_info.clone() {
                    self.debug.state.lock().set_debug_info(info);
                }
                let instruction_count = program.instructions.len();
                self.set_program(
                    ProgramImage::from_loaded(&program),
                    program.entry_point,
                    program.global_count,
                );
                self.session.send_response(
                    request_seq,
                    "uploadBytecode",
                    true,
                    Some(json!({"status": "ok", "instructions": instruction_count})),
                    None,
                );
            }
            Err(err) => {
                self.session.send_response(
                    request_seq,
                    "uploadBytecode",
                    false,
                    None,
                    Some(format!("Load failed: {err}")),
                );
            }
        }
    }

    fn handle_set_breakpoints(&mut self, request_seq: i64, arguments: &JsonValue) {
        let source_path = arguments
            .get("source")
            .and_then(|source| source.get("path"))
            .and_then(JsonValue::as_str)
            .unwrap_or("")
            .to_string();
        let lines: Vec<i64> = arguments
            .get("breakpoints")
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|bp| bp.get("line").and_then(JsonValue::as_i64))
                    .collect()
            })
            .unwrap_or_default();

        let mut state = self.debug.state.lock();
        let file_index = if state.has_debug_info() && !source_path.is_empty() {
            state
                .info()
                .and_then(|info| resolve_file_index(&source_path, &info.files))
        } else {
            None
        };

        // The request carries the full set for the source; start fresh.
        state.clear_breakpoints();

        let mut entries = Vec::new();
        let mut unresolved = Vec::new();
        for line in &lines {
            let id = file_index.and_then(|fi| state.add_breakpoint(*line as i32, fi));
            let verified = id.is_some();
            let mut entry = json!({"verified": verified, "line": line});
            if let Some(id) = id {
                entry["id"] = json!(id);
            }
            if !verified {
                let shown = if source_path.is_empty() {
                    "<unknown>"
                } else {
                    &source_path
                };
                let reason = format!("Debugger: unresolved breakpoint at {shown}:{line}");
                entry["message"] = json!(reason);
                unresolved.push(reason);
            }
            entries.push(entry);
        }
        drop(state);

        for reason in unresolved {
            self.session.send_output(&format!("{reason}\n"), "stderr");
        }
        self.session.send_response(
            request_seq,
            "setBreakpoints",
            true,
            Some(json!({"breakpoints": entries})),
            None,
        );
    }

    fn handle_continue(&mut self, request_seq: i64) {
        self.debug.state.lock().set_step_mode(StepMode::None);
        self.debug.resume();
        self.session
            .send_response(request_seq, "continue", true, None, None);

        if self.execution_started {
            return;
        }
        if !self.launched {
            debug!("continue before launch; starting anyway");
        }
        let Some(program) = self.program.clone() else {
            return;
        };
        self.execution_started = true;

        let shared = self.shared.clone();
        let debug = self.debug.clone();
        let session = self.session.clone();
        let entry_point = self.entry_point;
        let global_count = self.global_count;
        thread::spawn(move || {
            shared.externs.refresh_class_indices(&program.constants);
            shared.init_globals(global_count);
            let mut vm_thread = VmThread::new(shared, program);
            vm_thread.enable_debug(debug);
            if let Err(err) = vm_thread.run(entry_point) {
                session.send_output(&format!("VM Error: {err}\n"), "stderr");
            }
            session.send_event("terminated", None);
        });
    }

    fn handle_step(&mut self, request_seq: i64, command: &str, mode: StepMode) {
        let current = self.debug.current_instruction();
        let call_depth = self.debug.call_depth();
        {
            let mut state = self.debug.state.lock();
            if let Some(location) = state.source_for_instruction(current) {
                state.set_step_from_line(location.source_line, location.file_index);
            }
            state.set_step_mode(mode);
            match mode {
                StepMode::StepOver => state.set_step_over_depth(call_depth),
                StepMode::StepOut => state.set_step_out_depth(call_depth),
                _ => {}
            }
        }
        self.debug.resume();
        self.session
            .send_response(request_seq, command, true, None, None);
    }

    fn handle_stack_trace(&mut self, request_seq: i64) {
        let current = self.debug.current_instruction();
        let state = self.debug.state.lock();
        let body = if state.has_debug_info() {
            let entry = state.source_for_instruction(current);
            let function_name = state
                .function_at(current)
                .map(|f| f.name.clone())
                .unwrap_or_else(|| "main".to_string());
            let source_path = entry
                .filter(|e| e.file_index >= 0)
                .and_then(|e| {
                    state
                        .info()
                        .and_then(|info| info.files.get(e.file_index as usize))
                })
                .or_else(|| state.info().and_then(|info| info.files.first()))
                .map(|file| file.path.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let file_name = source_path
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(&source_path)
                .to_string();
            let line = entry.map(|e| e.source_line).filter(|l| *l > 0).unwrap_or(1);
            let column = entry
                .map(|e| e.source_column)
                .filter(|c| *c > 0)
                .unwrap_or(1);
            json!({
                "stackFrames": [{
                    "id": 1,
                    "name": function_name,
                    "source": {"name": file_name, "path": source_path},
                    "line": line,
                    "column": column,
                }],
                "totalFrames": 1,
            })
        } else {
            json!({
                "stackFrames": [{
                    "id": 1,
                    "name": "main",
                    "source": {"name": "unknown", "path": "unknown"},
                    "line": 1,
                    "column": 1,
                }],
                "totalFrames": 1,
            })
        };
        drop(state);
        self.session
            .send_response(request_seq, "stackTrace", true, Some(body), None);
    }

    fn handle_variables(&mut self, request_seq: i64, arguments: &JsonValue) {
        let reference = arguments
            .get("variablesReference")
            .and_then(JsonValue::as_i64)
            .unwrap_or(1);
        let snapshot = self.debug.snapshot();
        let mut entries = Vec::new();

        if reference == 1 {
            self.array_refs.clear();
            self.next_variable_reference = 2;
            let current = self.debug.current_instruction();
            let variables = self.debug.state.lock().variables_in_scope(current);
            for info in variables {
                let value = if info.location.kind == LocationKind::Register {
                    snapshot
                        .as_ref()
                        .and_then(|snap| snap.registers.get(info.location.index).cloned())
                } else {
                    None
                };

                let mut variables_reference = 0i64;
                if info.type_name.contains("[]") {
                    if let Some(Value::Array(_)) = &value {
                        variables_reference = self.next_variable_reference;
                        self.next_variable_reference += 1;
                        let element_type = info
                            .type_name
                            .split("[]")
                            .next()
                            .unwrap_or("")
                            .to_string();
                        self.array_refs.insert(
                            variables_reference,
                            ArrayVariable {
                                register_index: info.location.index,
                                element_type,
                            },
                        );
                    }
                }
                let rendered = value
                    .as_ref()
                    .map(variable_display)
                    .unwrap_or_else(|| "<unavailable>".to_string());
                entries.push(json!({
                    "name": info.name,
                    "type": info.type_name,
                    "variablesReference": variables_reference,
                    "value": rendered,
                }));
            }
        } else if let Some(array_ref) = self.array_refs.get(&reference) {
            if let Some(snapshot) = &snapshot {
                if let Some(Value::Array(array)) =
                    snapshot.registers.get(array_ref.register_index)
                {
                    for (i, element) in array.lock().iter().enumerate() {
                        entries.push(json!({
                            "name": format!("[{i}]"),
                            "type": array_ref.element_type,
                            "variablesReference": 0,
                            "value": variable_display(element),
                        }));
                    }
                }
            }
        }

        self.session.send_response(
            request_seq,
            "variables",
            true,
            Some(json!({"variables": entries})),
            None,
        );
    }
}

fn variable_display(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Char(c) => format!("'{}'", *c as char),
        Value::String(s) => s.clone(),
        Value::Object(_) => "<object>".to_string(),
        Value::Array(a) => format!("<array[{}]>", a.lock().len()),
        Value::Lambda(_) => "<lambda>".to_string(),
        Value::Map(m) => format!("<map[{}]>", m.lock().len()),
        Value::Set(s) => format!("<set[{}]>", s.lock().len()),
        Value::IntMap(m) => format!("<intmap[{}]>", m.lock().len()),
        Value::IntSet(s) => format!("<intset[{}]>", s.lock().len()),
        Value::Iterator(_) => "<iterator>".to_string(),
        Value::Future(_) => "<future>".to_string(),
    }
}

fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(true, |p| *p == "..") {
                    if !absolute {
                        parts.push("..");
                    }
                } else {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Resolve a client source path against the debug file table: exact match,
/// suffix match in either direction, bare filename, then single-file
/// fallback.
fn resolve_file_index(source_path: &str, files: &[FileInfo]) -> Option<i32> {
    let requested = normalize_path(source_path);
    if requested.is_empty() {
        return None;
    }
    for (idx, file) in files.iter().enumerate() {
        let candidate = normalize_path(&file.path);
        if candidate.is_empty() {
            continue;
        }
        if candidate == requested
            || requested.ends_with(&candidate)
            || candidate.ends_with(&requested)
        {
            return Some(idx as i32);
        }
    }
    let requested_name = file_name(&requested).to_string();
    for (idx, file) in files.iter().enumerate() {
        let candidate = normalize_path(&file.path);
        if file_name(&candidate) == requested_name {
            return Some(idx as i32);
        }
    }
    if files.len() == 1 {
        return Some(0);
    }
    None
}
