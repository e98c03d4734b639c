//=============================================
// src/vm/tests/extern_tests.rs
//=============================================
// Purpose: Built-in extern functions, the StringBuilder extern class and
//          extern-class tag reconciliation.
//=============================================

use std::sync::Arc;

use rill_core::value::ClassMeta;
use rill_core::{Instruction, Opcode, Value};

use crate::vm::{ProgramImage, Vm};

use super::util::{run_program, run_program_captured};

#[test]
fn substring_clamps_and_slices() {
    let constants = vec![
        Value::string("hello world"),
        Value::string("String::substring"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 6),
        Instruction::op(Opcode::LoadkNull, 3),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::string("world")
    );

    let constants = vec![
        Value::string("abc"),
        Value::string("String::substring"),
    ];
    // Start past the end returns empty.
    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 10),
        Instruction::op(Opcode::LoadkNull, 3),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::string("")
    );
}

#[test]
fn index_of_and_replace() {
    let constants = vec![
        Value::string("one two two"),
        Value::string("two"),
        Value::string("String::indexOf"),
        Value::string("2"),
        Value::string("String::replace"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::Loadk, 2, 1),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 2),
        Instruction::new(Opcode::Move, 4, 0, 0),
        // replace replaces only the first occurrence
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::Loadk, 2, 1),
        Instruction::with_reg_imm16(Opcode::Loadk, 3, 3),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 4),
        Instruction::op(Opcode::Halt, 0),
    ];
    let mut vm = Vm::new();
    let image = Arc::new(ProgramImage {
        code,
        constants,
    });
    let result = vm.run(&image, 0, 0).expect("program runs");
    assert_eq!(result, Value::string("one 2 two"));
}

#[test]
fn split_produces_parts_and_characters() {
    let constants = vec![
        Value::string("a,b,c"),
        Value::string(","),
        Value::string("String::split"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::Loadk, 2, 1),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 2),
        Instruction::new(Opcode::LengthArray, 0, 0, 0),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::Int(3)
    );

    let constants = vec![
        Value::string("abc"),
        Value::string(""),
        Value::string("String::split"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::Loadk, 2, 1),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 2),
        Instruction::new(Opcode::LengthArray, 0, 0, 0),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::Int(3)
    );
}

#[test]
fn case_conversions_are_ascii() {
    let constants = vec![
        Value::string("MiXeD"),
        Value::string("String::toUpperCase"),
        Value::string("String::toLowerCase"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants.clone()).expect("program runs"),
        Value::string("MIXED")
    );

    let code = vec![
        Instruction::with_reg_imm16(Opcode::Loadk, 1, 0),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 2),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::string("mixed")
    );
}

#[test]
fn array_externs_mutate_in_place() {
    let constants = vec![
        Value::string("Array::push"),
        Value::string("Array::pop"),
        Value::string("Array::length"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::NewArray, 1, 0),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 5),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 0),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 6),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 0),
        // pop returns the last element; length is back to 1 afterwards.
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::new(Opcode::Move, 3, 0, 0),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 2),
        Instruction::new(Opcode::AddInt, 0, 0, 3),
        Instruction::op(Opcode::Halt, 0),
    ];
    // popped 6 + remaining length 1
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::Int(7)
    );
}

#[test]
fn string_builder_appends_and_renders() {
    let constants = vec![
        Value::string("StringBuilder::create"),
        Value::string("StringBuilder::append"),
        Value::string("StringBuilder::toString"),
        Value::string("abc"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 0),
        Instruction::new(Opcode::Move, 1, 0, 0),
        Instruction::with_reg_imm16(Opcode::Loadk, 2, 3),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 42),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 2),
        Instruction::op(Opcode::Halt, 0),
    ];
    assert_eq!(
        run_program(code, constants).expect("program runs"),
        Value::string("abc42")
    );
}

#[test]
fn string_builder_rejects_foreign_receivers() {
    let constants = vec![
        Value::string("StringBuilder::toString"),
        ClassMeta {
            name: "Other".to_string(),
            field_count: 0,
            method_count: 0,
            field_names: Vec::new(),
        }
        .into_value(),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::NewObject, 1, 1),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 0),
        Instruction::op(Opcode::Halt, 0),
    ];
    let err = run_program(code, constants).expect_err("must fail");
    assert!(err.to_string().contains("receiver class mismatch"));
}

#[test]
fn println_serialises_objects_as_json() {
    let constants = vec![
        ClassMeta {
            name: "Point".to_string(),
            field_count: 2,
            method_count: 0,
            field_names: vec!["x".to_string(), "y".to_string()],
        }
        .into_value(),
        Value::string("println"),
    ];
    let code = vec![
        Instruction::with_reg_imm16(Opcode::NewObject, 1, 0),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 3),
        Instruction::new(Opcode::SetField, 1, 0, 2),
        Instruction::with_reg_imm16(Opcode::LoadkInt16, 2, 4),
        Instruction::new(Opcode::SetField, 1, 1, 2),
        Instruction::with_reg_imm16(Opcode::ExternCall, 1, 1),
        Instruction::op(Opcode::Halt, 0),
    ];
    let (result, output) = run_program_captured(code, constants);
    result.expect("program runs");
    assert_eq!(output, "{\"x\":3,\"y\":4}\n");
}

#[test]
fn extern_class_tags_reconcile_with_the_constant_pool() {
    let vm = Vm::new();
    let handle = vm.ensure_extern_class("Widget");
    assert!(handle.class_idx() < 0, "fresh extern classes tag negative");

    let constants = vec![ClassMeta {
        name: "Widget".to_string(),
        field_count: 1,
        method_count: 0,
        field_names: vec!["id".to_string()],
    }
    .into_value()];
    let code = vec![Instruction::op(Opcode::Halt, 0)];
    let mut vm = vm;
    let image = Arc::new(ProgramImage { code, constants });
    vm.run(&image, 0, 0).expect("program runs");
    assert_eq!(handle.class_idx(), 0, "tag upgraded to the pool index");
}
