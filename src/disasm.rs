//! Instruction and value formatting for trace logs and state dumps.

use rill_core::{Instruction, Opcode, Value};

/// Short single-line rendering of a value for diagnostics.
pub fn value_preview(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{f:.4}"),
        Value::Double(d) => format!("{d:.4}"),
        Value::Char(c) => {
            if c.is_ascii_graphic() || *c == b' ' {
                format!("'{}'", *c as char)
            } else {
                format!("#{c}")
            }
        }
        Value::String(s) => {
            if s.len() <= 32 {
                format!("\"{s}\"")
            } else {
                let head: String = s.chars().take(29).collect();
                format!("\"{head}...\"")
            }
        }
        Value::Object(_) => "[object]".to_string(),
        Value::Array(a) => format!("[array len={}]", a.lock().len()),
        Value::Lambda(_) => "[lambda]".to_string(),
        Value::Map(m) => format!("[map size={}]", m.lock().len()),
        Value::Set(s) => format!("[set size={}]", s.lock().len()),
        Value::IntMap(m) => format!("[intmap size={}]", m.lock().len()),
        Value::IntSet(s) => format!("[intset size={}]", s.lock().len()),
        Value::Iterator(_) => "[iterator]".to_string(),
        Value::Future(_) => "[future]".to_string(),
    }
}

fn constant_preview(index: u16, constants: &[Value]) -> String {
    match constants.get(index as usize) {
        Some(value) => format!("const[{index}]={}", value_preview(value)),
        None => format!("const[{index}]=<out-of-range>"),
    }
}

fn is_three_register_op(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        AddInt
            | SubInt
            | MulInt
            | DivInt
            | ModInt
            | AddFloat
            | SubFloat
            | MulFloat
            | DivFloat
            | AddDouble
            | SubDouble
            | MulDouble
            | DivDouble
            | AndBool
            | OrBool
            | EqInt
            | LtInt
            | EqFloat
            | LtFloat
            | LteFloat
            | EqDouble
            | LtDouble
            | LteDouble
            | EqString
            | LtString
            | EqBool
            | LtBool
            | EqObject
            | EqChar
            | LtChar
            | AddString
            | GetArray
            | SetArray
            | GetMap
            | SetMap
            | HasKeyMap
            | DeleteMap
            | GetMapInt
            | SetMapInt
            | HasKeyMapInt
            | DeleteMapInt
            | AddSet
            | HasSet
            | DeleteSet
            | AddSetInt
            | HasSetInt
            | DeleteSetInt
    )
}

fn is_two_register_op(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        Move | NotBool
            | LengthString
            | LengthArray
            | ValuesMap
            | KeysMap
            | SizeMap
            | SizeSet
            | ToArraySet
            | IterInit
            | IterNext
            | IterValue
            | IterKey
            | IsNull
            | GetClassIdx
            | IntToFloat
            | IntToDouble
            | FloatToInt
            | DoubleToInt
            | FloatToDouble
            | DoubleToFloat
            | IntToString
            | FloatToString
            | DoubleToString
            | BoolToString
            | CharToString
            | TypeOf
            | StringToInt
            | StringToFloat
            | StringToDouble
            | StringToBool
            | StringToChar
            | IntToBool
            | FloatToBool
            | DoubleToBool
            | BoolToInt
            | BoolToFloat
            | BoolToDouble
            | CharToInt
            | IntToChar
            | IntToEnum
            | StringToEnum
            | EnumToString
            | ClassToJson
            | CaptureValue
            | InvokeLambda
            | Await
    )
}

/// Human-readable rendering of one instruction, with decoded immediates and
/// constant previews where they help.
pub fn format_instruction(instr: &Instruction, constants: &[Value]) -> String {
    use Opcode::*;
    let Some(op) = instr.opcode() else {
        return format!(
            "??? (opcode={} a={} b={} c={})",
            instr.opcode, instr.a, instr.b, instr.c
        );
    };
    let mnemonic = op.mnemonic();
    let (a, b, c) = (instr.a, instr.b, instr.c);

    if is_three_register_op(op) {
        return format!("{mnemonic} r{a}, r{b}, r{c}");
    }
    if is_two_register_op(op) {
        return format!("{mnemonic} r{a}, r{b}");
    }
    match op {
        Nop | Halt => mnemonic.to_string(),
        Loadk => format!("{mnemonic} r{a}, {}", constant_preview(instr.uimm16(), constants)),
        LoadkNull => format!("{mnemonic} r{a} = null"),
        LoadkInt16 => format!("{mnemonic} r{a}, imm={}", instr.imm16()),
        LoadkBool => format!("{mnemonic} r{a}, value={}", b != 0),
        LoadkFloat => format!("{mnemonic} r{a}, value={}", instr.imm16() as f32 / 256.0),
        LoadkChar => {
            if b.is_ascii_graphic() {
                format!("{mnemonic} r{a}, value='{}'", b as char)
            } else {
                format!("{mnemonic} r{a}, value='\\x{b:02x}'")
            }
        }
        NewArray => format!("{mnemonic} r{a}, size={}", instr.imm16()),
        NewObject => format!(
            "{mnemonic} r{a}, class={}",
            constant_preview(instr.uimm16(), constants)
        ),
        NewMap | NewSet | NewMapInt | NewSetInt | ClearMap | ClearSet => {
            format!("{mnemonic} r{a}")
        }
        GetField => format!("{mnemonic} r{a}, r{b}.field[{c}]"),
        SetField => format!("{mnemonic} r{a}.field[{b}], r{c}"),
        Jmp => format!("{mnemonic} offset={}", instr.imm16()),
        JmpIfTrue | JmpIfFalse => format!("{mnemonic} r{a}, offset={}", instr.imm16()),
        Return => format!("{mnemonic} r{a}"),
        Call | AsyncCall => format!(
            "{mnemonic} r{a}, target={}",
            constant_preview(instr.uimm16(), constants)
        ),
        ExternCall => format!(
            "{mnemonic} r{a}, name={}",
            constant_preview(instr.uimm16(), constants)
        ),
        CreateLambda => format!("{mnemonic} r{a}, meta={}", instr.uimm16()),
        ClassFromJson => format!("{mnemonic} r{a}, class={}", instr.uimm16()),
        GetGlobal => format!("{mnemonic} r{a}, global[{}]", instr.uimm16()),
        SetGlobal => format!("{mnemonic} global[{}], r{a}", instr.uimm16()),
        _ => format!("{mnemonic} (a={a}, b={b}, c={c})"),
    }
}
