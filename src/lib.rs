pub mod dap;
pub mod disasm;
pub mod vm;

pub use vm::{OutputSink, ProgramImage, Vm};
