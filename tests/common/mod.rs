use std::cell::RefCell;

use lily_vm::builtins::register_builtins;
use lily_vm::value::ops::interpolate_value;
use lily_vm::value::Value;
use lily_vm::vm::{OpResult, Vm};
use lily_vm::{Emitter, LilyResult, VmConfig};

thread_local! {
    static OUTPUT: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn capture_print(vm: &mut Vm, argc: u16, words: &[u16]) -> OpResult<()> {
    let value = vm.foreign_reg(words, 0);
    OUTPUT.with(|out| out.borrow_mut().push(interpolate_value(&value)));
    vm.set_foreign_result(words, argc, Value::Unit);
    Ok(())
}

pub fn take_output() -> Vec<String> {
    OUTPUT.with(|out| out.borrow_mut().drain(..).collect())
}

/// A fresh emitter with the builtin module plus an output-capturing print
/// for assertions.
pub fn test_emitter() -> Emitter {
    let mut emitter = Emitter::new("[test]");
    register_builtins(&mut emitter);

    let a = emitter.pool.generic(0);
    let unit = emitter.pool.unit();
    let print_ty = emitter
        .pool
        .function(lily_vm::TypeFlags::empty(), unit, vec![a]);
    emitter
        .symtab
        .register_module("test", "[test]", &[("emit_out", capture_print, print_ty)]);

    take_output();
    emitter
}

#[allow(dead_code)]
pub fn run_program<F>(build: F) -> (Vm, LilyResult<()>)
where
    F: FnOnce(&mut Emitter) -> LilyResult<()>,
{
    run_program_with(VmConfig::default(), build)
}

#[allow(dead_code)]
pub fn run_program_with<F>(config: VmConfig, build: F) -> (Vm, LilyResult<()>)
where
    F: FnOnce(&mut Emitter) -> LilyResult<()>,
{
    let mut emitter = test_emitter();
    build(&mut emitter).expect("program failed to emit");

    let symtab = emitter.finish().expect("program failed to finish");
    let mut vm = Vm::new(symtab, config);
    let result = vm.run_main();
    (vm, result)
}

/// Shorthand for `emit_out(to_s(value))`.
#[allow(dead_code)]
pub fn out_of(emitter: &Emitter, value: lily_vm::Ast, line: u16) -> lily_vm::Ast {
    use lily_vm::Ast;

    let out_var = emitter.symtab.find_var("emit_out").unwrap();
    let to_s_var = emitter.symtab.find_var("to_s").unwrap();
    let rendered = Ast::call(Ast::var(to_s_var, line), vec![value], line);
    Ast::call(Ast::var(out_var, line), vec![rendered], line)
}
