mod extern_tests;

pub(crate) mod util {
    use std::sync::Arc;

    use rill_core::{Instruction, Value, VmResult};

    use crate::vm::{OutputSink, ProgramImage, Vm};

    pub fn run_program(code: Vec<Instruction>, constants: Vec<Value>) -> VmResult<Value> {
        run_program_with_globals(code, constants, 0)
    }

    pub fn run_program_with_globals(
        code: Vec<Instruction>,
        constants: Vec<Value>,
        global_count: usize,
    ) -> VmResult<Value> {
        let mut vm = Vm::new();
        let image = Arc::new(ProgramImage { code, constants });
        vm.run(&image, 0, global_count)
    }

    /// Run with println/panic output captured instead of written to stdout.
    pub fn run_program_captured(
        code: Vec<Instruction>,
        constants: Vec<Value>,
    ) -> (VmResult<Value>, String) {
        let mut vm = Vm::new();
        let (sink, buffer) = OutputSink::capture();
        vm.set_output(sink);
        let image = Arc::new(ProgramImage { code, constants });
        let result = vm.run(&image, 0, 0);
        let output = buffer.lock().clone();
        (result, output)
    }
}
