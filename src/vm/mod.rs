pub mod externs;
pub mod frame;
pub mod thread;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::error;

use rill_core::debug::{DebugInfo, DebugState};
use rill_core::loader::LoadedProgram;
use rill_core::{Instruction, Value, VmError, VmResult};

use externs::{register_builtins, ExternClassHandle, ExternFn, ExternRegistry};
use thread::VmThread;

/// Immutable code + constant pool shared by every thread executing a
/// program.
#[derive(Debug)]
pub struct ProgramImage {
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
}

impl ProgramImage {
    pub fn from_loaded(program: &LoadedProgram) -> Arc<ProgramImage> {
        Arc::new(ProgramImage {
            code: program.instructions.clone(),
            constants: program.constants.clone(),
        })
    }
}

/// Destination for `println`/`panic` text. A DAP session installs a handler
/// that forwards text as `output` events; tests capture into a buffer.
#[derive(Clone)]
pub enum OutputSink {
    Stdout,
    Capture(Arc<Mutex<String>>),
    Handler(Arc<dyn Fn(&str, &str) + Send + Sync>),
}

impl OutputSink {
    pub fn capture() -> (OutputSink, Arc<Mutex<String>>) {
        let buffer = Arc::new(Mutex::new(String::new()));
        (OutputSink::Capture(buffer.clone()), buffer)
    }

    pub fn emit(&self, text: &str, category: &str) {
        match self {
            OutputSink::Stdout => {
                if category == "stderr" {
                    eprint!("{text}");
                } else {
                    print!("{text}");
                }
            }
            OutputSink::Capture(buffer) => buffer.lock().push_str(text),
            OutputSink::Handler(handler) => handler(text, category),
        }
    }
}

/// Process-wide state shared by the main thread and async workers.
pub struct SharedState {
    globals: Mutex<Vec<Value>>,
    pub externs: ExternRegistry,
    output: RwLock<OutputSink>,
}

impl SharedState {
    pub fn new() -> Arc<SharedState> {
        let shared = Arc::new(SharedState {
            globals: Mutex::new(Vec::new()),
            externs: ExternRegistry::new(),
            output: RwLock::new(OutputSink::Stdout),
        });
        register_builtins(&shared.externs);
        shared
    }

    pub fn init_globals(&self, count: usize) {
        let mut globals = self.globals.lock();
        globals.clear();
        globals.resize(count, Value::Null);
    }

    pub fn set_global(&self, index: usize, value: Value) -> VmResult<()> {
        let mut globals = self.globals.lock();
        let slot = globals
            .get_mut(index)
            .ok_or(VmError::GlobalOutOfBounds(index))?;
        *slot = value;
        Ok(())
    }

    pub fn get_global(&self, index: usize) -> VmResult<Value> {
        let globals = self.globals.lock();
        globals
            .get(index)
            .cloned()
            .ok_or(VmError::GlobalOutOfBounds(index))
    }

    pub fn globals_snapshot(&self) -> Vec<Value> {
        self.globals.lock().clone()
    }

    pub fn output(&self) -> OutputSink {
        self.output.read().clone()
    }

    pub fn set_output(&self, sink: OutputSink) {
        *self.output.write() = sink;
    }
}

/// Why the interpreter stopped; forwarded to the debug adapter as the
/// `stopped` event reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
        }
    }
}

/// State of the paused frame, published for stack/variable introspection so
/// the debug adapter never reads live interpreter state.
#[derive(Debug, Clone)]
pub struct PauseSnapshot {
    pub instruction: usize,
    pub call_depth: usize,
    pub function_index: i32,
    pub registers: Vec<Value>,
}

type StoppedCallback = Arc<dyn Fn(StopReason) + Send + Sync>;

/// Debugger-side control block. The DAP handler mutates breakpoints and the
/// pause gate; the interpreter consults them at each instruction boundary
/// and blocks on the condvar while paused.
pub struct DebugControl {
    pub state: Mutex<DebugState>,
    paused: Mutex<bool>,
    resumed: Condvar,
    snapshot: Mutex<Option<PauseSnapshot>>,
    current_instruction: AtomicUsize,
    call_depth: AtomicUsize,
    stopped: Mutex<Option<StoppedCallback>>,
}

impl DebugControl {
    pub fn new() -> Arc<DebugControl> {
        Arc::new(DebugControl {
            state: Mutex::new(DebugState::new()),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            snapshot: Mutex::new(None),
            current_instruction: AtomicUsize::new(0),
            call_depth: AtomicUsize::new(0),
            stopped: Mutex::new(None),
        })
    }

    pub fn request_pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    pub fn set_stopped_callback(&self, callback: StoppedCallback) {
        *self.stopped.lock() = Some(callback);
    }

    pub fn current_instruction(&self) -> usize {
        self.current_instruction.load(Ordering::Acquire)
    }

    pub fn call_depth(&self) -> usize {
        self.call_depth.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Option<PauseSnapshot> {
        self.snapshot.lock().clone()
    }

    pub(crate) fn publish_location(&self, instruction: usize, call_depth: usize) {
        self.current_instruction
            .store(instruction, Ordering::Release);
        self.call_depth.store(call_depth, Ordering::Release);
    }

    pub(crate) fn store_snapshot(&self, snapshot: PauseSnapshot) {
        *self.snapshot.lock() = Some(snapshot);
    }

    pub(crate) fn block_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }

    /// Pause and notify the adapter, then block until resumed.
    pub(crate) fn stop(&self, reason: StopReason, snapshot: PauseSnapshot) {
        self.store_snapshot(snapshot);
        *self.paused.lock() = true;
        let callback = self.stopped.lock().clone();
        if let Some(callback) = callback {
            callback(reason);
        }
        self.block_while_paused();
    }
}

/// Owns the shared process state and the main interpreter thread; spawns
/// async workers on demand.
pub struct Vm {
    shared: Arc<SharedState>,
    debug: Arc<DebugControl>,
    debug_mode: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            shared: SharedState::new(),
            debug: DebugControl::new(),
            debug_mode: false,
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn debug(&self) -> &Arc<DebugControl> {
        &self.debug
    }

    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    pub fn set_output(&self, sink: OutputSink) {
        self.shared.set_output(sink);
    }

    pub fn register_extern(&self, name: &str, func: ExternFn) {
        self.shared.externs.register(name, func);
    }

    pub fn ensure_extern_class(&self, name: &str) -> ExternClassHandle {
        self.shared.externs.ensure_class(name)
    }

    /// Execute a program image on the main thread until HALT or the call
    /// stack drains. Runtime errors dump the thread state before
    /// propagating.
    pub fn run(
        &mut self,
        program: &Arc<ProgramImage>,
        entry_point: usize,
        global_count: usize,
    ) -> VmResult<Value> {
        self.shared.externs.refresh_class_indices(&program.constants);
        self.shared.init_globals(global_count);
        let mut thread = VmThread::new(self.shared.clone(), program.clone());
        if self.debug_mode {
            thread.enable_debug(self.debug.clone());
        }
        match thread.run(entry_point) {
            Ok(value) => Ok(value),
            Err(err) => {
                error!("vm thread failed: {err}");
                error!("{}", thread.dump_state());
                Err(err)
            }
        }
    }

    pub fn run_with_debug(
        &mut self,
        program: &Arc<ProgramImage>,
        entry_point: usize,
        global_count: usize,
        debug_info: DebugInfo,
    ) -> VmResult<Value> {
        self.debug.state.lock().set_debug_info(debug_info);
        self.debug_mode = true;
        self.run(program, entry_point, global_count)
    }

    pub fn run_loaded(&mut self, program: &LoadedProgram) -> VmResult<Value> {
        let image = ProgramImage::from_loaded(program);
        if let Some(debug_info) = program.debug_info.clone() {
            self.run_with_debug(&image, program.entry_point, program.global_count, debug_info)
        } else {
            self.run(&image, program.entry_point, program.global_count)
        }
    }
}
