//! The slice of the builtin module the core needs: a handful of foreign
//! functions registered through the same surface any embedder would use.

use std::rc::Rc;

use crate::emit::Emitter;
use crate::symtab::ids;
use crate::types::TypeFlags;
use crate::value::ops::interpolate_value;
use crate::value::{DynamicVal, InstanceVal, ListVal, Value};
use crate::vm::{OpResult, Vm};

/// Register the builtin foreign functions into a fresh emitter's symbol
/// table. Front ends call this once before handing out vars.
pub fn register_builtins(emitter: &mut Emitter) {
    let a = emitter.pool.generic(0);
    let unit = emitter.pool.unit();
    let string = emitter.pool.string();
    let dynamic = emitter.pool.dynamic();

    let print_ty = emitter
        .pool
        .function(TypeFlags::empty(), unit, vec![a.clone()]);
    let to_s_ty = emitter
        .pool
        .function(TypeFlags::empty(), string, vec![a.clone()]);
    let dynamic_ty = emitter.pool.function(TypeFlags::empty(), dynamic, vec![a]);

    let string_arg = emitter.pool.string();
    let value_error = emitter.pool.default_type(ids::VALUEERROR);
    let value_error_ty = emitter
        .pool
        .function(TypeFlags::empty(), value_error, vec![string_arg]);

    emitter.symtab.register_module(
        "builtin",
        "[builtin]",
        &[
            ("print", builtin_print, print_ty),
            ("to_s", builtin_to_s, to_s_ty),
            ("dynamic_new", builtin_dynamic_new, dynamic_ty),
            ("value_error_new", builtin_value_error_new, value_error_ty),
        ],
    );
}

/// Build a catchable ValueError instance: message first, an empty
/// traceback second.
fn builtin_value_error_new(vm: &mut Vm, argc: u16, words: &[u16]) -> OpResult<()> {
    let message = vm.foreign_reg(words, 0);

    let traceback = Value::List(Rc::new(ListVal {
        gc: Default::default(),
        elems: std::cell::RefCell::new(Vec::new()),
    }));
    vm.tag_value(&traceback);

    let value = Value::Instance(Rc::new(InstanceVal {
        gc: Default::default(),
        class_id: ids::VALUEERROR,
        values: std::cell::RefCell::new(vec![message, traceback]),
    }));

    vm.set_foreign_result(words, argc, value);
    Ok(())
}

fn builtin_print(vm: &mut Vm, argc: u16, words: &[u16]) -> OpResult<()> {
    let value = vm.foreign_reg(words, 0);
    println!("{}", interpolate_value(&value));
    vm.set_foreign_result(words, argc, Value::Unit);
    Ok(())
}

fn builtin_to_s(vm: &mut Vm, argc: u16, words: &[u16]) -> OpResult<()> {
    let value = vm.foreign_reg(words, 0);
    let rendered = interpolate_value(&value);
    vm.set_foreign_result(words, argc, Value::String(Rc::new(rendered)));
    Ok(())
}

fn builtin_dynamic_new(vm: &mut Vm, argc: u16, words: &[u16]) -> OpResult<()> {
    let inner = vm.foreign_reg(words, 0);
    let value = Value::Dynamic(Rc::new(DynamicVal {
        gc: Default::default(),
        inner: std::cell::RefCell::new(inner),
    }));

    vm.tag_value(&value);
    vm.set_foreign_result(words, argc, value);
    Ok(())
}
