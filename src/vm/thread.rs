use std::fmt::Write as _;
use std::sync::Arc;
use std::thread;

use tracing::{error, trace};

use rill_core::iter::IterState;
use rill_core::json::{coerce_to_string, object_from_json, value_to_json};
use rill_core::task::Task;
use rill_core::value::{ClassMeta, FunctionMeta, ValueType};
use rill_core::{Instruction, Opcode, Value, VmError, VmResult};

use parking_lot::Mutex;

use crate::disasm;

use super::frame::{Frame, DEFAULT_REGISTER_COUNT};
use super::{DebugControl, PauseSnapshot, ProgramImage, SharedState, StopReason};

/// Elided in `unchecked` builds, like every other validation in this file.
macro_rules! bounds_check {
    ($cond:expr, $msg:expr) => {
        #[cfg(not(feature = "unchecked"))]
        if !$cond {
            return Err(VmError::runtime($msg));
        }
    };
}

fn is_reference_type(tag: ValueType) -> bool {
    matches!(
        tag,
        ValueType::Object
            | ValueType::Array
            | ValueType::Lambda
            | ValueType::Map
            | ValueType::Set
            | ValueType::IntMap
            | ValueType::IntSet
            | ValueType::Iterator
            | ValueType::Future
    )
}

/// What the dispatch loop should do after an instruction.
enum Flow {
    Next,
    Jump(i64),
    /// CALL / RETURN / INVOKE_LAMBDA changed the frame stack; re-enter the
    /// outer loop and pick up the active frame's saved ip.
    FrameChange,
    Halt,
}

/// A single-threaded interpreter instance. The main thread and every async
/// worker is one of these; they share globals and the extern registry
/// through `SharedState` and the program image through an `Arc`.
pub struct VmThread {
    shared: Arc<SharedState>,
    program: Arc<ProgramImage>,
    frames: Vec<Frame>,
    debug: Option<Arc<DebugControl>>,
    current_instruction: usize,
    result: Value,
}

impl VmThread {
    pub fn new(shared: Arc<SharedState>, program: Arc<ProgramImage>) -> VmThread {
        VmThread {
            shared,
            program,
            frames: vec![Frame::new(DEFAULT_REGISTER_COUNT)],
            debug: None,
            current_instruction: 0,
            result: Value::Null,
        }
    }

    /// Worker-thread constructor: seeds the entry frame's registers 1..=P
    /// with the snapshotted arguments.
    pub fn with_args(
        shared: Arc<SharedState>,
        program: Arc<ProgramImage>,
        args: &[Value],
    ) -> VmThread {
        let mut thread = VmThread::new(shared, program);
        let frame = thread.frames.last_mut().expect("entry frame");
        for (i, value) in args.iter().enumerate() {
            if let Some(slot) = frame.registers.get_mut(i + 1) {
                *slot = value.clone();
            }
        }
        thread
    }

    pub fn enable_debug(&mut self, control: Arc<DebugControl>) {
        self.debug = Some(control);
    }

    pub fn current_instruction(&self) -> usize {
        self.current_instruction
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("call stack is not empty")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("call stack is not empty")
    }

    #[inline]
    fn check_register(&self, _reg: u8) -> VmResult<()> {
        #[cfg(not(feature = "unchecked"))]
        if _reg as usize >= self.frame().registers.len() {
            return Err(VmError::RegisterOutOfBounds(_reg));
        }
        Ok(())
    }

    #[inline]
    fn check_constant(&self, _index: usize) -> VmResult<()> {
        #[cfg(not(feature = "unchecked"))]
        if _index >= self.program.constants.len() {
            return Err(VmError::ConstantOutOfBounds(_index));
        }
        Ok(())
    }

    #[inline]
    fn reg(&self, reg: u8) -> &Value {
        &self.frame().registers[reg as usize]
    }

    #[inline]
    fn set_reg(&mut self, reg: u8, value: Value) {
        self.frame_mut().registers[reg as usize] = value;
    }

    #[inline]
    fn constant(&self, index: usize) -> &Value {
        &self.program.constants[index]
    }

    /// Execute from `entry_point` until HALT or the call stack drains.
    pub fn run(&mut self, entry_point: usize) -> VmResult<Value> {
        if self.frames.is_empty() {
            self.frames.push(Frame::new(DEFAULT_REGISTER_COUNT));
        }
        self.frame_mut().ip = entry_point;

        'frames: while !self.frames.is_empty() {
            let mut ip = self.frame().ip as i64;
            loop {
                #[cfg(not(feature = "unchecked"))]
                if ip < 0 || ip >= self.program.code.len() as i64 {
                    return Err(VmError::runtime("Falling off the end of code"));
                }

                self.current_instruction = ip as usize;
                if self.debug.is_some() {
                    self.debug_checkpoint(ip as usize);
                }

                let instr = self.program.code[ip as usize];
                let op = match Opcode::from_u8(instr.opcode) {
                    Some(op) => op,
                    None => {
                        self.frame_mut().ip = ip as usize;
                        return Err(VmError::runtime(format!(
                            "Unimplemented or unknown opcode: {}",
                            instr.opcode
                        )));
                    }
                };
                trace!(
                    ip,
                    depth = self.frames.len(),
                    "{}",
                    disasm::format_instruction(&instr, &self.program.constants)
                );

                match self.execute(op, instr, ip) {
                    Ok(Flow::Next) => ip += 1,
                    Ok(Flow::Jump(target)) => ip = target,
                    Ok(Flow::FrameChange) => continue 'frames,
                    Ok(Flow::Halt) => {
                        self.frame_mut().ip = ip as usize;
                        self.result = self
                            .frame()
                            .registers
                            .first()
                            .cloned()
                            .unwrap_or(Value::Null);
                        return Ok(self.result.clone());
                    }
                    Err(err) => {
                        self.frame_mut().ip = ip as usize;
                        return Err(err);
                    }
                }
            }
        }
        Ok(self.result.clone())
    }

    fn execute(&mut self, op: Opcode, instr: Instruction, ip: i64) -> VmResult<Flow> {
        use Opcode::*;
        match op {
            Nop => Ok(Flow::Next),
            Halt => Ok(Flow::Halt),

            Move => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                let value = self.reg(instr.b).clone();
                self.set_reg(instr.a, value);
                Ok(Flow::Next)
            }
            Loadk => {
                self.check_register(instr.a)?;
                let index = instr.uimm16() as usize;
                self.check_constant(index)?;
                let value = self.constant(index).clone();
                self.set_reg(instr.a, value);
                Ok(Flow::Next)
            }
            LoadkNull => {
                self.check_register(instr.a)?;
                self.set_reg(instr.a, Value::Null);
                Ok(Flow::Next)
            }
            LoadkInt16 => {
                self.check_register(instr.a)?;
                self.set_reg(instr.a, Value::Int(instr.imm16()));
                Ok(Flow::Next)
            }
            LoadkBool => {
                self.check_register(instr.a)?;
                self.set_reg(instr.a, Value::Bool(instr.b != 0));
                Ok(Flow::Next)
            }
            LoadkFloat => {
                self.check_register(instr.a)?;
                // 8.8 fixed point.
                self.set_reg(instr.a, Value::Float(instr.imm16() as f32 / 256.0));
                Ok(Flow::Next)
            }
            LoadkChar => {
                self.check_register(instr.a)?;
                self.set_reg(instr.a, Value::Char(instr.b));
                Ok(Flow::Next)
            }

            AddInt | SubInt | MulInt | DivInt | ModInt => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let left = self.reg(instr.b).as_int()?;
                let right = self.reg(instr.c).as_int()?;
                let result = match op {
                    AddInt => left.wrapping_add(right),
                    SubInt => left.wrapping_sub(right),
                    MulInt => left.wrapping_mul(right),
                    DivInt => {
                        #[cfg(not(feature = "unchecked"))]
                        if right == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        left.wrapping_div(right)
                    }
                    _ => {
                        #[cfg(not(feature = "unchecked"))]
                        if right == 0 {
                            return Err(VmError::ModuloByZero);
                        }
                        left.wrapping_rem(right)
                    }
                };
                self.set_reg(instr.a, Value::Int(result));
                Ok(Flow::Next)
            }

            AddFloat | SubFloat | MulFloat | DivFloat | AddDouble | SubDouble | MulDouble
            | DivDouble => {
                self.handle_arithmetic(op, instr)?;
                Ok(Flow::Next)
            }

            NotBool => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                let value = self.reg(instr.b).as_bool()?;
                self.set_reg(instr.a, Value::Bool(!value));
                Ok(Flow::Next)
            }
            AndBool | OrBool => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let left = self.reg(instr.b).as_bool()?;
                let right = self.reg(instr.c).as_bool()?;
                let result = if op == AndBool {
                    left && right
                } else {
                    left || right
                };
                self.set_reg(instr.a, Value::Bool(result));
                Ok(Flow::Next)
            }

            EqInt | LtInt | EqFloat | LtFloat | LteFloat | EqDouble | LtDouble | LteDouble
            | EqString | LtString | EqBool | LtBool | EqObject | EqChar | LtChar => {
                self.handle_comparison(op, instr)?;
                Ok(Flow::Next)
            }

            IntToFloat | IntToDouble | FloatToInt | DoubleToInt | FloatToDouble
            | DoubleToFloat | IsNull | GetClassIdx | IntToString | FloatToString
            | DoubleToString | BoolToString | CharToString | TypeOf | StringToInt
            | StringToFloat | StringToDouble | StringToBool | StringToChar | IntToBool
            | FloatToBool | DoubleToBool | BoolToInt | BoolToFloat | BoolToDouble
            | CharToInt | IntToChar | IntToEnum | StringToEnum | EnumToString => {
                self.handle_conversion(op, instr)?;
                Ok(Flow::Next)
            }

            ClassToJson => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                let text = value_to_json(self.reg(instr.b), &self.program.constants).to_string();
                self.set_reg(instr.a, Value::String(text));
                Ok(Flow::Next)
            }
            ClassFromJson => {
                self.check_register(instr.a)?;
                let class_idx = instr.uimm16() as usize;
                self.check_constant(class_idx)?;
                let text = self.reg(instr.a).as_str()?.to_string();
                let object = object_from_json(&text, class_idx, &self.program.constants)?;
                self.set_reg(instr.a, object);
                Ok(Flow::Next)
            }

            AddString | LengthString => {
                self.handle_string_ops(op, instr)?;
                Ok(Flow::Next)
            }

            NewArray | GetArray | SetArray | LengthArray => {
                self.handle_array_ops(op, instr)?;
                Ok(Flow::Next)
            }

            NewObject | GetField | SetField => {
                self.handle_object_ops(op, instr)?;
                Ok(Flow::Next)
            }

            NewMap | GetMap | SetMap | HasKeyMap | DeleteMap | KeysMap | ValuesMap | SizeMap
            | ClearMap | NewMapInt | GetMapInt | SetMapInt | HasKeyMapInt | DeleteMapInt => {
                self.handle_map_ops(op, instr)?;
                Ok(Flow::Next)
            }

            NewSet | AddSet | HasSet | DeleteSet | SizeSet | ClearSet | ToArraySet | NewSetInt
            | AddSetInt | HasSetInt | DeleteSetInt => {
                self.handle_set_ops(op, instr)?;
                Ok(Flow::Next)
            }

            IterInit | IterNext | IterValue | IterKey => {
                self.handle_iterator_ops(op, instr)?;
                Ok(Flow::Next)
            }

            CreateLambda | CaptureValue => {
                self.handle_lambda_ops(op, instr)?;
                Ok(Flow::Next)
            }

            Jmp => Ok(Flow::Jump(ip + instr.imm16() as i64)),
            JmpIfTrue => {
                self.check_register(instr.a)?;
                if self.reg(instr.a).as_bool()? {
                    Ok(Flow::Jump(ip + instr.imm16() as i64))
                } else {
                    Ok(Flow::Next)
                }
            }
            JmpIfFalse => {
                self.check_register(instr.a)?;
                if self.reg(instr.a).as_bool()? {
                    Ok(Flow::Next)
                } else {
                    Ok(Flow::Jump(ip + instr.imm16() as i64))
                }
            }

            Call => {
                self.check_register(instr.a)?;
                let function_index = instr.uimm16() as usize;
                self.check_constant(function_index)?;
                let meta = FunctionMeta::from_value(self.constant(function_index))?;

                self.frame_mut().ip = (ip + 1) as usize;
                let caller_index = self.frames.len() - 1;
                self.frames.push(Frame::new(meta.register_count));
                let (callers, callees) = self.frames.split_at_mut(caller_index + 1);
                let caller = &callers[caller_index];
                let callee = &mut callees[0];
                callee.ip = meta.code_index;
                callee.function_index = function_index as i32;
                let base = instr.a as usize;
                for i in 0..meta.parameter_count {
                    if let (Some(value), Some(slot)) = (
                        caller.registers.get(base + i),
                        callee.registers.get_mut(i + 1),
                    ) {
                        *slot = value.clone();
                    }
                }
                Ok(Flow::FrameChange)
            }

            Return => {
                self.check_register(instr.a)?;
                let value = self.reg(instr.a).clone();
                self.frames.pop();
                match self.frames.last_mut() {
                    Some(caller) => {
                        if let Some(slot) = caller.registers.get_mut(0) {
                            *slot = value;
                        }
                    }
                    None => self.result = value,
                }
                Ok(Flow::FrameChange)
            }

            ExternCall => {
                self.check_register(instr.a)?;
                let name_index = instr.uimm16() as usize;
                self.check_constant(name_index)?;
                let name = self.constant(name_index).as_str()?.to_string();
                let func = self
                    .shared
                    .externs
                    .get(&name)
                    .ok_or_else(|| VmError::UnknownExtern(name.clone()))?;
                let output = self.shared.output();
                let result = {
                    let frame = self.frame();
                    let args = &frame.registers[instr.a as usize..];
                    let ctx = super::externs::ExternCtx {
                        constants: &self.program.constants,
                        output: &output,
                    };
                    func(args, &ctx)?
                };
                self.set_reg(0, result);
                Ok(Flow::Next)
            }

            InvokeLambda => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                let (code_index, parameter_count, captured) = {
                    let lambda = self.reg(instr.b).as_lambda()?.lock();
                    (
                        lambda.code_index,
                        lambda.parameter_count,
                        lambda.captured.clone(),
                    )
                };
                self.frame_mut().ip = (ip + 1) as usize;
                let caller_index = self.frames.len() - 1;
                self.frames.push(Frame::new(DEFAULT_REGISTER_COUNT));
                let (callers, callees) = self.frames.split_at_mut(caller_index + 1);
                let caller = &callers[caller_index];
                let callee = &mut callees[0];
                callee.ip = code_index;
                let base = instr.a as usize;
                for i in 0..parameter_count {
                    if let (Some(value), Some(slot)) = (
                        caller.registers.get(base + i),
                        callee.registers.get_mut(i + 1),
                    ) {
                        *slot = value.clone();
                    }
                }
                // Captured values land after the parameters.
                for (i, value) in captured.iter().enumerate() {
                    if let Some(slot) = callee.registers.get_mut(parameter_count + 1 + i) {
                        *slot = value.clone();
                    }
                }
                Ok(Flow::FrameChange)
            }

            AsyncCall => {
                self.check_register(instr.a)?;
                let function_index = instr.uimm16() as usize;
                self.check_constant(function_index)?;
                let meta = FunctionMeta::from_value(self.constant(function_index))?;
                let base = instr.a as usize;
                let args: Vec<Value> = {
                    let frame = self.frame();
                    (0..meta.parameter_count)
                        .map(|i| {
                            frame
                                .registers
                                .get(base + i)
                                .cloned()
                                .unwrap_or(Value::Null)
                        })
                        .collect()
                };
                let task = Task::new();
                self.set_reg(instr.a, Value::Future(task.clone()));

                let shared = self.shared.clone();
                let program = self.program.clone();
                let entry = meta.code_index;
                let name = meta.name;
                thread::spawn(move || {
                    if !task.try_start() {
                        return;
                    }
                    let mut worker = VmThread::with_args(shared, program, &args);
                    match worker.run(entry) {
                        Ok(value) => task.complete(value),
                        Err(err) => {
                            error!(task = %name, "async task failed: {err}");
                            task.complete(Value::Null);
                        }
                    }
                });
                Ok(Flow::Next)
            }

            Await => {
                self.check_register(instr.a)?;
                self.check_register(instr.b)?;
                let value = self.reg(instr.b).clone();
                let resolved = match value {
                    Value::Future(task) => task.wait(),
                    other => other,
                };
                self.set_reg(instr.a, resolved);
                Ok(Flow::Next)
            }

            GetGlobal => {
                self.check_register(instr.a)?;
                let index = instr.uimm16() as usize;
                let value = self.shared.get_global(index)?;
                self.set_reg(instr.a, value);
                Ok(Flow::Next)
            }
            SetGlobal => {
                self.check_register(instr.a)?;
                let index = instr.uimm16() as usize;
                let value = self.reg(instr.a).clone();
                self.shared.set_global(index, value)?;
                Ok(Flow::Next)
            }
        }
    }

    fn handle_arithmetic(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        self.check_register(instr.b)?;
        self.check_register(instr.c)?;
        let result = match op {
            AddFloat => Value::Float(self.reg(instr.b).as_float()? + self.reg(instr.c).as_float()?),
            SubFloat => Value::Float(self.reg(instr.b).as_float()? - self.reg(instr.c).as_float()?),
            MulFloat => Value::Float(self.reg(instr.b).as_float()? * self.reg(instr.c).as_float()?),
            DivFloat => {
                let divisor = self.reg(instr.c).as_float()?;
                #[cfg(not(feature = "unchecked"))]
                if divisor.abs() < 1e-6 {
                    return Err(VmError::NearZeroDivisor("float"));
                }
                Value::Float(self.reg(instr.b).as_float()? / divisor)
            }
            AddDouble => {
                Value::Double(self.reg(instr.b).as_double()? + self.reg(instr.c).as_double()?)
            }
            SubDouble => {
                Value::Double(self.reg(instr.b).as_double()? - self.reg(instr.c).as_double()?)
            }
            MulDouble => {
                Value::Double(self.reg(instr.b).as_double()? * self.reg(instr.c).as_double()?)
            }
            DivDouble => {
                let divisor = self.reg(instr.c).as_double()?;
                #[cfg(not(feature = "unchecked"))]
                if divisor.abs() < 1e-12 {
                    return Err(VmError::NearZeroDivisor("double"));
                }
                Value::Double(self.reg(instr.b).as_double()? / divisor)
            }
            _ => return Err(VmError::runtime("Invalid arithmetic opcode")),
        };
        self.set_reg(instr.a, result);
        Ok(())
    }

    fn handle_comparison(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        self.check_register(instr.b)?;
        self.check_register(instr.c)?;
        let left = self.reg(instr.b);
        let right = self.reg(instr.c);
        let result = match op {
            EqInt => left.as_int()? == right.as_int()?,
            LtInt => left.as_int()? < right.as_int()?,
            // IEEE-754 strict equality; NaN compares false everywhere.
            EqFloat => left.as_float()? == right.as_float()?,
            LtFloat => left.as_float()? < right.as_float()?,
            LteFloat => left.as_float()? <= right.as_float()?,
            EqDouble => left.as_double()? == right.as_double()?,
            LtDouble => left.as_double()? < right.as_double()?,
            LteDouble => left.as_double()? <= right.as_double()?,
            EqString => left.as_str()? == right.as_str()?,
            LtString => left.as_str()? < right.as_str()?,
            EqBool => left.as_bool()? == right.as_bool()?,
            // false < true
            LtBool => left.as_bool()? < right.as_bool()?,
            // Identity comparison over any shared heap variant; Value
            // equality is Arc pointer equality for these tags.
            EqObject => {
                if !is_reference_type(left.value_type()) {
                    return Err(VmError::Type {
                        expected: ValueType::Object,
                        found: left.value_type(),
                    });
                }
                left == right
            }
            EqChar => left.as_char()? == right.as_char()?,
            LtChar => left.as_char()? < right.as_char()?,
            _ => return Err(VmError::runtime("Invalid comparison opcode")),
        };
        self.set_reg(instr.a, Value::Bool(result));
        Ok(())
    }

    fn handle_conversion(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        self.check_register(instr.b)?;
        let source = self.reg(instr.b);
        let result = match op {
            IntToFloat => Value::Float(source.as_int()? as f32),
            IntToDouble => Value::Double(source.as_int()? as f64),
            FloatToInt => Value::Int(source.as_float()? as i32),
            DoubleToInt => Value::Int(source.as_double()? as i32),
            FloatToDouble => Value::Double(source.as_float()? as f64),
            DoubleToFloat => Value::Float(source.as_double()? as f32),
            IsNull => Value::Bool(source.is_null()),
            GetClassIdx => {
                let class_idx = match source {
                    Value::Object(object) => object.lock().class_idx,
                    _ => -1,
                };
                Value::Int(class_idx)
            }
            TypeOf => Value::Int(source.value_type() as i32),
            IntToString => Value::String(source.as_int()?.to_string()),
            FloatToString => Value::String(source.as_float()?.to_string()),
            DoubleToString => Value::String(source.as_double()?.to_string()),
            BoolToString => Value::String(source.as_bool()?.to_string()),
            CharToString => Value::String((source.as_char()? as char).to_string()),
            StringToInt => {
                let text = source.as_str()?;
                let parsed: i32 = text.trim().parse().map_err(|_| {
                    VmError::runtime(format!(
                        "Invalid string format for int conversion: \"{text}\""
                    ))
                })?;
                Value::Int(parsed)
            }
            StringToFloat => {
                let text = source.as_str()?;
                let parsed: f32 = text.trim().parse().map_err(|_| {
                    VmError::runtime(format!(
                        "Invalid string format for float conversion: \"{text}\""
                    ))
                })?;
                Value::Float(parsed)
            }
            StringToDouble => {
                let text = source.as_str()?;
                let parsed: f64 = text.trim().parse().map_err(|_| {
                    VmError::runtime(format!(
                        "Invalid string format for double conversion: \"{text}\""
                    ))
                })?;
                Value::Double(parsed)
            }
            StringToBool => {
                let text = source.as_str()?;
                match text {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => {
                        return Err(VmError::runtime(format!(
                            "Invalid string format for bool conversion: \"{text}\" (must be \"true\" or \"false\")"
                        )))
                    }
                }
            }
            StringToChar => {
                let text = source.as_str()?;
                let first = text
                    .as_bytes()
                    .first()
                    .copied()
                    .ok_or_else(|| VmError::runtime("Cannot convert empty string to char"))?;
                Value::Char(first)
            }
            IntToBool => Value::Bool(source.as_int()? != 0),
            FloatToBool => Value::Bool(source.as_float()? != 0.0),
            DoubleToBool => Value::Bool(source.as_double()? != 0.0),
            BoolToInt => Value::Int(source.as_bool()? as i32),
            BoolToFloat => Value::Float(if source.as_bool()? { 1.0 } else { 0.0 }),
            BoolToDouble => Value::Double(if source.as_bool()? { 1.0 } else { 0.0 }),
            CharToInt => Value::Int(source.as_char()? as i32),
            IntToChar => {
                let value = source.as_int()?;
                if !(0..=255).contains(&value) {
                    return Err(VmError::runtime(format!(
                        "Integer value {value} is out of range for char conversion (0-255)"
                    )));
                }
                Value::Char(value as u8)
            }
            // Enums are string-backed; the value passes through unchanged.
            IntToEnum | StringToEnum | EnumToString => source.clone(),
            _ => return Err(VmError::runtime("Invalid type conversion opcode")),
        };
        self.set_reg(instr.a, result);
        Ok(())
    }

    fn handle_string_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        self.check_register(instr.b)?;
        match op {
            AddString => {
                self.check_register(instr.c)?;
                let left = coerce_to_string(self.reg(instr.b), &self.program.constants);
                let right = coerce_to_string(self.reg(instr.c), &self.program.constants);
                self.set_reg(instr.a, Value::String(left + &right));
            }
            LengthString => {
                let length = self.reg(instr.b).as_str()?.len() as i32;
                self.set_reg(instr.a, Value::Int(length));
            }
            _ => return Err(VmError::runtime("Invalid string operation opcode")),
        }
        Ok(())
    }

    fn handle_array_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        match op {
            NewArray => {
                let size = instr.imm16();
                bounds_check!(size >= 0, "Array size cannot be negative");
                self.set_reg(instr.a, Value::new_array(size as usize));
            }
            GetArray => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let index = self.reg(instr.c).as_int()?;
                let result = match self.reg(instr.b) {
                    // String indexing yields a char at the byte index.
                    Value::String(text) => {
                        bounds_check!(
                            index >= 0 && (index as usize) < text.len(),
                            "String index out of bounds"
                        );
                        Value::Char(text.as_bytes()[index as usize])
                    }
                    other => {
                        let array = other.as_array()?.lock();
                        bounds_check!(
                            index >= 0 && (index as usize) < array.len(),
                            "Array index out of bounds"
                        );
                        array[index as usize].clone()
                    }
                };
                self.set_reg(instr.a, result);
            }
            SetArray => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let index = self.reg(instr.b).as_int()?;
                let value = self.reg(instr.c).clone();
                let array = self.reg(instr.a).as_array()?;
                let mut array = array.lock();
                bounds_check!(
                    index >= 0 && (index as usize) < array.len(),
                    "Array index out of bounds"
                );
                array[index as usize] = value;
            }
            LengthArray => {
                self.check_register(instr.b)?;
                let length = self.reg(instr.b).as_array()?.lock().len() as i32;
                self.set_reg(instr.a, Value::Int(length));
            }
            _ => return Err(VmError::runtime("Invalid array operation opcode")),
        }
        Ok(())
    }

    fn handle_object_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        match op {
            NewObject => {
                let class_index = instr.uimm16() as usize;
                self.check_constant(class_index)?;
                let meta = ClassMeta::from_value(self.constant(class_index))?;
                self.set_reg(
                    instr.a,
                    Value::new_object(class_index as i32, meta.field_count),
                );
            }
            GetField => {
                self.check_register(instr.b)?;
                let field_index = instr.c as usize;
                let object = self.reg(instr.b).as_object()?;
                let data = object.lock();
                bounds_check!(field_index < data.fields.len(), "Field index out of bounds");
                let value = data.fields[field_index].clone();
                drop(data);
                self.set_reg(instr.a, value);
            }
            SetField => {
                self.check_register(instr.c)?;
                let field_index = instr.b as usize;
                let value = self.reg(instr.c).clone();
                let object = self.reg(instr.a).as_object()?;
                let mut data = object.lock();
                bounds_check!(field_index < data.fields.len(), "Field index out of bounds");
                data.fields[field_index] = value;
            }
            _ => return Err(VmError::runtime("Invalid object operation opcode")),
        }
        Ok(())
    }

    fn handle_map_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        match op {
            NewMap => self.set_reg(instr.a, Value::new_map()),
            GetMap => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.c).as_str()?.to_string();
                let map = self.reg(instr.b).as_map()?;
                let value = map.lock().get(&key).cloned().unwrap_or(Value::Null);
                self.set_reg(instr.a, value);
            }
            SetMap => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.b).as_str()?.to_string();
                let value = self.reg(instr.c).clone();
                self.reg(instr.a).as_map()?.lock().insert(key, value);
            }
            HasKeyMap => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.c).as_str()?.to_string();
                let present = self.reg(instr.b).as_map()?.lock().contains_key(&key);
                self.set_reg(instr.a, Value::Bool(present));
            }
            DeleteMap => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.c).as_str()?.to_string();
                let removed = self.reg(instr.b).as_map()?.lock().remove(&key).is_some();
                self.set_reg(instr.a, Value::Bool(removed));
            }
            KeysMap => {
                self.check_register(instr.b)?;
                let keys = match self.reg(instr.b) {
                    Value::IntMap(map) => {
                        map.lock().keys().map(|k| Value::Int(*k)).collect::<Vec<_>>()
                    }
                    other => other
                        .as_map()?
                        .lock()
                        .keys()
                        .map(|k| Value::string(k.clone()))
                        .collect::<Vec<_>>(),
                };
                self.set_reg(instr.a, Value::array_from(keys));
            }
            ValuesMap => {
                self.check_register(instr.b)?;
                let values = match self.reg(instr.b) {
                    Value::IntMap(map) => map.lock().values().cloned().collect::<Vec<_>>(),
                    other => other.as_map()?.lock().values().cloned().collect::<Vec<_>>(),
                };
                self.set_reg(instr.a, Value::array_from(values));
            }
            SizeMap => {
                self.check_register(instr.b)?;
                let size = match self.reg(instr.b) {
                    Value::IntMap(map) => map.lock().len(),
                    other => other.as_map()?.lock().len(),
                };
                self.set_reg(instr.a, Value::Int(size as i32));
            }
            ClearMap => match self.reg(instr.a) {
                Value::IntMap(map) => map.lock().clear(),
                other => other.as_map()?.lock().clear(),
            },
            NewMapInt => self.set_reg(instr.a, Value::new_int_map()),
            GetMapInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.c).as_int()?;
                let map = self.reg(instr.b).as_int_map()?;
                let value = map.lock().get(&key).cloned().unwrap_or(Value::Null);
                self.set_reg(instr.a, value);
            }
            SetMapInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.b).as_int()?;
                let value = self.reg(instr.c).clone();
                self.reg(instr.a).as_int_map()?.lock().insert(key, value);
            }
            HasKeyMapInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.c).as_int()?;
                let present = self.reg(instr.b).as_int_map()?.lock().contains_key(&key);
                self.set_reg(instr.a, Value::Bool(present));
            }
            DeleteMapInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let key = self.reg(instr.c).as_int()?;
                let removed = self
                    .reg(instr.b)
                    .as_int_map()?
                    .lock()
                    .remove(&key)
                    .is_some();
                self.set_reg(instr.a, Value::Bool(removed));
            }
            _ => return Err(VmError::runtime("Invalid map operation opcode")),
        }
        Ok(())
    }

    fn handle_set_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        match op {
            NewSet => self.set_reg(instr.a, Value::new_set()),
            AddSet => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let value = self.reg(instr.c).clone();
                let inserted = self.reg(instr.b).as_set()?.lock().insert(value);
                self.set_reg(instr.a, Value::Bool(inserted));
            }
            HasSet => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let value = self.reg(instr.c).clone();
                let present = self.reg(instr.b).as_set()?.lock().contains(&value);
                self.set_reg(instr.a, Value::Bool(present));
            }
            DeleteSet => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let value = self.reg(instr.c).clone();
                let removed = self.reg(instr.b).as_set()?.lock().remove(&value);
                self.set_reg(instr.a, Value::Bool(removed));
            }
            SizeSet => {
                self.check_register(instr.b)?;
                let size = match self.reg(instr.b) {
                    Value::Set(set) => set.lock().len(),
                    Value::IntSet(set) => set.lock().len(),
                    _ => return Err(VmError::runtime("SIZE_SET called on non-set value")),
                };
                self.set_reg(instr.a, Value::Int(size as i32));
            }
            ClearSet => match self.reg(instr.a) {
                Value::Set(set) => set.lock().clear(),
                Value::IntSet(set) => set.lock().clear(),
                _ => return Err(VmError::runtime("CLEAR_SET called on non-set value")),
            },
            ToArraySet => {
                self.check_register(instr.b)?;
                let items = self
                    .reg(instr.b)
                    .as_set()?
                    .lock()
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>();
                self.set_reg(instr.a, Value::array_from(items));
            }
            NewSetInt => self.set_reg(instr.a, Value::new_int_set()),
            AddSetInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let value = self.reg(instr.c).as_int()?;
                let inserted = self.reg(instr.b).as_int_set()?.lock().insert(value);
                self.set_reg(instr.a, Value::Bool(inserted));
            }
            HasSetInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let value = self.reg(instr.c).as_int()?;
                let present = self.reg(instr.b).as_int_set()?.lock().contains(&value);
                self.set_reg(instr.a, Value::Bool(present));
            }
            DeleteSetInt => {
                self.check_register(instr.b)?;
                self.check_register(instr.c)?;
                let value = self.reg(instr.c).as_int()?;
                let removed = self.reg(instr.b).as_int_set()?.lock().remove(&value);
                self.set_reg(instr.a, Value::Bool(removed));
            }
            _ => return Err(VmError::runtime("Invalid set operation opcode")),
        }
        Ok(())
    }

    fn handle_iterator_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        self.check_register(instr.b)?;
        match op {
            IterInit => {
                let state = IterState::over(self.reg(instr.b))?;
                self.set_reg(instr.a, Value::Iterator(Arc::new(Mutex::new(state))));
            }
            IterNext => {
                let has_next = self.reg(instr.b).as_iterator()?.lock().has_next();
                self.set_reg(instr.a, Value::Bool(has_next));
            }
            IterValue => {
                // Read the current element, then advance.
                let value = {
                    let iter = self.reg(instr.b).as_iterator()?;
                    let mut iter = iter.lock();
                    let value = iter.value()?;
                    iter.advance()?;
                    value
                };
                self.set_reg(instr.a, value);
            }
            IterKey => {
                let key = self.reg(instr.b).as_iterator()?.lock().key()?;
                self.set_reg(instr.a, key);
            }
            _ => return Err(VmError::runtime("Invalid iterator operation opcode")),
        }
        Ok(())
    }

    fn handle_lambda_ops(&mut self, op: Opcode, instr: Instruction) -> VmResult<()> {
        use Opcode::*;
        self.check_register(instr.a)?;
        match op {
            CreateLambda => {
                let metadata_index = instr.uimm16() as usize;
                self.check_constant(metadata_index)?;
                let meta = FunctionMeta::from_value(self.constant(metadata_index))?;
                self.set_reg(
                    instr.a,
                    Value::new_lambda(meta.code_index, meta.parameter_count),
                );
            }
            CaptureValue => {
                self.check_register(instr.b)?;
                // Value snapshot: later writes to the source register do not
                // reach the lambda.
                let value = self.reg(instr.b).clone();
                self.reg(instr.a).as_lambda()?.lock().captured.push(value);
            }
            _ => return Err(VmError::runtime("Invalid lambda operation opcode")),
        }
        Ok(())
    }

    fn debug_checkpoint(&mut self, ip: usize) {
        let Some(control) = self.debug.clone() else {
            return;
        };
        control.publish_location(ip, self.frames.len());

        // An externally requested pause takes effect here, at the
        // instruction boundary.
        if control.is_paused() {
            control.store_snapshot(self.pause_snapshot(ip));
            control.block_while_paused();
        }

        let stop = {
            let state = control.state.lock();
            if state.has_breakpoint_at(ip) {
                Some(StopReason::Breakpoint)
            } else if state.should_break_on_step(ip, self.frames.len()) {
                Some(StopReason::Step)
            } else {
                None
            }
        };
        match stop {
            Some(StopReason::Breakpoint) => {
                control.stop(StopReason::Breakpoint, self.pause_snapshot(ip));
            }
            Some(StopReason::Step) => {
                {
                    let mut state = control.state.lock();
                    if let Some(location) = state.source_for_instruction(ip) {
                        state.set_step_from_line(location.source_line, location.file_index);
                    }
                }
                control.stop(StopReason::Step, self.pause_snapshot(ip));
            }
            None => {}
        }
    }

    fn pause_snapshot(&self, ip: usize) -> PauseSnapshot {
        let frame = self.frame();
        PauseSnapshot {
            instruction: ip,
            call_depth: self.frames.len(),
            function_index: frame.function_index,
            registers: frame.registers.clone(),
        }
    }

    /// Diagnostic dump used when a runtime error terminates the thread:
    /// non-null globals and every frame's non-null registers.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== VM STATE DUMP ===");
        let _ = writeln!(out, " call_stack_size: {}", self.frames.len());
        let _ = writeln!(out, " current_instruction: {}", self.current_instruction);

        let globals = self.shared.globals_snapshot();
        let live: Vec<(usize, &Value)> = globals
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .collect();
        if live.is_empty() {
            let _ = writeln!(out, " globals: <all null>");
        } else {
            let _ = writeln!(out, " globals:");
            for (index, value) in live.iter().take(64) {
                let _ = writeln!(
                    out,
                    "  global[{index}] = {}",
                    disasm::value_preview(value)
                );
            }
            if live.len() > 64 {
                let _ = writeln!(out, "  ... ({} more globals not shown)", live.len() - 64);
            }
        }

        if self.frames.is_empty() {
            let _ = writeln!(out, " call_stack: <empty>");
            return out;
        }
        let _ = writeln!(out, " call_stack:");
        for (depth, frame) in self.frames.iter().enumerate().rev() {
            let _ = writeln!(
                out,
                "  frame[{depth}] ip={} function_index={}",
                frame.ip, frame.function_index
            );
            let live: Vec<(usize, &Value)> = frame
                .registers
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .collect();
            if live.is_empty() {
                let _ = writeln!(out, "    registers: <all null>");
                continue;
            }
            let _ = writeln!(out, "    registers:");
            for (index, value) in live.iter().take(64) {
                let _ = writeln!(out, "      r{index} = {}", disasm::value_preview(value));
            }
            if live.len() > 64 {
                let _ = writeln!(out, "    ... ({} more registers not shown)", live.len() - 64);
            }
        }
        out
    }
}
