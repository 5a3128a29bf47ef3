use colored::*;

use crate::builtins::register_builtins;
use crate::cli::{CliArgs, CliCommand};
use crate::code::CodeIter;
use crate::emit::{DefineSpec, Emitter};
use crate::expr::{Ast, AstKind, BinaryOp};
use crate::symtab::{ids, Symtab};
use crate::testing;
use crate::types::TypeFlags;
use crate::value::Value;
use crate::vm::{LilyResult, Vm};
use crate::VmConfig;

const DEMO_NAMES: &[&str] = &["arith", "closure", "match", "exception", "cycle"];

pub fn run_cli() -> Result<(), String> {
    let args = CliArgs::parse()?;
    let config = args.to_vm_config();

    testing::run_vm_tests(&config);

    match &args.command {
        CliCommand::Demos => {
            for name in DEMO_NAMES {
                run_demo(name, &config)?;
            }
            Ok(())
        }
        CliCommand::Demo { name } => run_demo(name, &config),
        CliCommand::Dis { name } => dis_demo(name),
    }
}

fn build_demo(name: &str) -> Result<Symtab, String> {
    let mut emitter = Emitter::new(&format!("[demo.{}]", name));
    register_builtins(&mut emitter);

    let result = match name {
        "arith" => build_arith(&mut emitter),
        "closure" => build_closure(&mut emitter),
        "match" => build_match(&mut emitter),
        "exception" => build_exception(&mut emitter),
        "cycle" => build_cycle(&mut emitter),
        other => return Err(format!("No demo named '{}'.", other)),
    };

    result.map_err(|e| e.to_string())?;
    emitter.finish().map_err(|e| e.to_string())
}

fn run_demo(name: &str, config: &VmConfig) -> Result<(), String> {
    println!("{} {}", "demo:".bright_cyan().bold(), name);

    let symtab = build_demo(name)?;
    let mut vm = Vm::new(symtab, config.clone());

    match vm.run_main() {
        Ok(()) => {}
        Err(e) => println!("{}", e.render()),
    }

    if config.gc_stats {
        testing::report_gc_stats(&vm.gc_stats(), config);
    }

    Ok(())
}

fn dis_demo(name: &str) -> Result<(), String> {
    let symtab = build_demo(name)?;

    for value in symtab.readonly.iter() {
        let function = match value {
            Value::Function(f) if f.is_native() => f,
            _ => continue,
        };

        println!(
            "{} {} ({} registers)",
            "function".bright_cyan().bold(),
            function.qualified_name(),
            function.reg_count
        );

        let code = function.code.as_ref().unwrap();
        let mut ci = CodeIter::new(code, 0, code.len());

        while ci.next() {
            let words: Vec<String> = code[ci.offset + 1..ci.offset + ci.round_total]
                .iter()
                .map(|w| w.to_string())
                .collect();
            println!(
                "    {:5} {} {}",
                ci.offset,
                ci.opcode.name().green(),
                words.join(" ")
            );
        }
    }

    Ok(())
}

/* ---------------- demo programs ---------------- */

fn print_of(emitter: &Emitter, value: Ast, line: u16) -> Ast {
    let print_var = emitter.symtab.find_var("print").unwrap();
    let to_s_var = emitter.symtab.find_var("to_s").unwrap();
    let rendered = Ast::call(Ast::var(to_s_var, line), vec![value], line);
    Ast::call(Ast::var(print_var, line), vec![rendered], line)
}

/// var a = 10  var b = 32  print(to_s(a + b))
fn build_arith(emitter: &mut Emitter) -> LilyResult<()> {
    let integer = emitter.pool.integer();

    let a = emitter.declare_var_assigned("a", integer.clone(), &Ast::integer(10, 1))?;
    let b = emitter.declare_var_assigned("b", integer, &Ast::integer(32, 2))?;

    let sum = Ast::binary(BinaryOp::Plus, Ast::var(a, 3), Ast::var(b, 3), 3);
    emitter.eval_expr(&print_of(emitter, sum, 3))
}

/// A counter made of a closure over a mutable local; called twice.
fn build_closure(emitter: &mut Emitter) -> LilyResult<()> {
    let integer = emitter.pool.integer();
    let counter_ty = emitter.pool.function(TypeFlags::empty(), integer.clone(), vec![]);

    let make_counter = emitter.begin_define(DefineSpec {
        name: "make_counter".to_string(),
        params: vec![],
        ret: counter_ty.clone(),
        flags: TypeFlags::empty(),
        generic_count: 0,
        class_id: None,
    })?;

    let n = emitter.declare_var("n", integer.clone());
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Assign,
        Ast::var(n, 2),
        Ast::integer(0, 2),
        2,
    ))?;

    let bump = emitter.begin_define(DefineSpec {
        name: "bump".to_string(),
        params: vec![],
        ret: integer.clone(),
        flags: TypeFlags::empty(),
        generic_count: 0,
        class_id: None,
    })?;
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Assign,
        Ast::var(n, 4),
        Ast::binary(BinaryOp::Plus, Ast::var(n, 4), Ast::integer(1, 4), 4),
        4,
    ))?;
    emitter.emit_return(Some(&Ast::var(n, 5)))?;
    emitter.end_define()?;

    emitter.emit_return(Some(&Ast::var(bump, 6)))?;
    emitter.end_define()?;

    let c = emitter.declare_var_assigned(
        "c",
        counter_ty,
        &Ast::call(Ast::var(make_counter, 8), vec![], 8),
    )?;

    for line in [9, 10] {
        let call = Ast::call(Ast::var(c, line), vec![], line);
        emitter.eval_expr(&print_of(emitter, call, line))?;
    }

    Ok(())
}

/// match over Option[Integer] with decomposition.
fn build_match(emitter: &mut Emitter) -> LilyResult<()> {
    let integer = emitter.pool.integer();
    let option_int = emitter.pool.option_of(integer.clone());

    let source = Ast::new(
        AstKind::Variant { variant_class: ids::SOME, args: vec![Ast::integer(5, 1)] },
        1,
    );
    let opt = emitter.declare_var_assigned("opt", option_int, &source)?;

    let result = emitter.declare_var_assigned("result", integer.clone(), &Ast::integer(0, 2))?;

    emitter.begin_match(&Ast::var(opt, 3))?;

    let v = emitter.declare_var("v", integer);
    emitter.match_case(ids::SOME, &[v])?;
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Assign,
        Ast::var(result, 4),
        Ast::binary(BinaryOp::Multiply, Ast::var(v, 4), Ast::integer(2, 4), 4),
        4,
    ))?;

    emitter.match_case(ids::NONE, &[])?;
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Assign,
        Ast::var(result, 5),
        Ast::integer(0, 5),
        5,
    ))?;

    emitter.leave_block()?;

    emitter.eval_expr(&print_of(emitter, Ast::var(result, 6), 6))
}

/// try { 1 / 0 } except DivisionByZeroError as e { print(e.message) }
fn build_exception(emitter: &mut Emitter) -> LilyResult<()> {
    emitter.begin_try();
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Divide,
        Ast::integer(1, 2),
        Ast::integer(0, 2),
        2,
    ))?;

    let err_ty = emitter.pool.default_type(ids::DIVISIONBYZEROERROR);
    let e = emitter.declare_var("e", err_ty);
    emitter.begin_except(ids::DIVISIONBYZEROERROR, Some(e))?;

    let message = Ast::new(
        AstKind::Property { source: Box::new(Ast::var(e, 4)), index: 0 },
        4,
    );
    let print_var = emitter.symtab.find_var("print").unwrap();
    emitter.eval_expr(&Ast::call(Ast::var(print_var, 4), vec![message], 4))?;

    emitter.leave_block()
}

/// Builds reference cycles in a loop so a low GC threshold shows the
/// collector reclaiming them.
fn build_cycle(emitter: &mut Emitter) -> LilyResult<()> {
    let integer = emitter.pool.integer();
    let dynamic = emitter.pool.dynamic();
    let list_ty = emitter.pool.list_of(dynamic.clone());
    let dynamic_new = emitter.symtab.find_var("dynamic_new").unwrap();

    // var cell = [dynamic_new(0)]; cell[0] = dynamic_new(cell)
    let seed = Ast::call(Ast::var(dynamic_new, 1), vec![Ast::integer(0, 1)], 1);
    let cell = emitter.declare_var_assigned(
        "cell",
        list_ty,
        &Ast::new(AstKind::BuildList(vec![seed]), 1),
    )?;

    let i = emitter.declare_var("i", integer);
    emitter.begin_for_in(i, &Ast::integer(1, 2), &Ast::integer(50, 2), None)?;

    let wrap = Ast::call(Ast::var(dynamic_new, 3), vec![Ast::var(cell, 3)], 3);
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Assign,
        Ast::subscript(Ast::var(cell, 3), Ast::integer(0, 3), 3),
        wrap,
        3,
    ))?;

    // Re-seed the var: the old cycle is now unreachable.
    let reseed = Ast::call(Ast::var(dynamic_new, 4), vec![Ast::integer(0, 4)], 4);
    emitter.eval_expr(&Ast::binary(
        BinaryOp::Assign,
        Ast::var(cell, 4),
        Ast::new(AstKind::BuildList(vec![reseed]), 4),
        4,
    ))?;

    emitter.leave_block()?;

    emitter.eval_expr(&print_of(emitter, Ast::string("cycles dropped", 5), 5))
}
