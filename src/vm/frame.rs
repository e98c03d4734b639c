use rill_core::Value;

/// Default register window for frames without declared sizes (entry frame
/// and lambda invocations).
pub const DEFAULT_REGISTER_COUNT: usize = 256;

/// Per-call unit of register storage. Register 0 receives the callee's
/// return value.
#[derive(Debug)]
pub struct Frame {
    pub registers: Vec<Value>,
    pub ip: usize,
    /// Constant-pool index of the function executing in this frame;
    /// -1 for the entry frame and lambda frames.
    pub function_index: i32,
}

impl Frame {
    pub fn new(register_count: usize) -> Frame {
        Frame {
            registers: vec![Value::Null; register_count],
            ip: 0,
            function_index: -1,
        }
    }
}
