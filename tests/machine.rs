mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{out_of, run_program, run_program_with, take_output};
use lily_vm::value::ops::eq_value;
use lily_vm::value::{ListVal, Value};
use lily_vm::vm::{OpResult, Vm};
use lily_vm::{ids, Ast, AstKind, BinaryOp, DefineSpec, TypeFlags, VmConfig};

/// Integer arithmetic wraps two's-complement instead of trapping.
#[test]
fn integer_overflow_wraps() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let big = emitter.declare_var_assigned("big", integer, &Ast::integer(i64::MAX, 1))?;
        let bump = Ast::binary(BinaryOp::Plus, Ast::var(big, 2), Ast::integer(1, 2), 2);
        emitter.eval_expr(&out_of(emitter, bump, 2))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec![i64::MIN.to_string()]);
}

#[test]
fn negative_list_index() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let list_ty = emitter.pool.list_of(integer);

        let items = Ast::new(
            AstKind::BuildList(vec![
                Ast::integer(1, 1),
                Ast::integer(2, 1),
                Ast::integer(3, 1),
            ]),
            1,
        );
        let l = emitter.declare_var_assigned("l", list_ty, &items)?;

        let last = Ast::subscript(Ast::var(l, 2), Ast::integer(-1, 2), 2);
        emitter.eval_expr(&out_of(emitter, last, 2))?;
        let first = Ast::subscript(Ast::var(l, 3), Ast::integer(-3, 3), 3);
        emitter.eval_expr(&out_of(emitter, first, 3))?;

        // One past the negative end is out of range.
        let bad = Ast::subscript(Ast::var(l, 4), Ast::integer(-4, 4), 4);
        emitter.eval_expr(&out_of(emitter, bad, 4))
    });

    let err = result.expect_err("index -4 should be out of range");
    assert!(err.to_string().contains("IndexError"), "{}", err);
    assert_eq!(take_output(), vec!["3", "1"]);
}

/// Hash lookup of a missing key raises; assignment to one creates it.
#[test]
fn hash_key_behavior() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let string = emitter.pool.string();
        let hash_ty = emitter.pool.hash_of(string, integer);

        let pairs = Ast::new(
            AstKind::BuildHash(vec![(Ast::string("a", 1), Ast::integer(1, 1))]),
            1,
        );
        let h = emitter.declare_var_assigned("h", hash_ty, &pairs)?;

        // h["b"] = 2 creates the key.
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::subscript(Ast::var(h, 2), Ast::string("b", 2), 2),
            Ast::integer(2, 2),
            2,
        ))?;
        let read_b = Ast::subscript(Ast::var(h, 3), Ast::string("b", 3), 3);
        emitter.eval_expr(&out_of(emitter, read_b, 3))?;

        // h["missing"] raises.
        let read_missing = Ast::subscript(Ast::var(h, 4), Ast::string("missing", 4), 4);
        emitter.eval_expr(&out_of(emitter, read_missing, 4))
    });

    let err = result.expect_err("the missing key should raise");
    let rendered = err.render();
    assert!(rendered.starts_with("KeyError: \"missing\" not found."), "{}", rendered);
    assert_eq!(take_output(), vec!["2"]);
}

/// Runaway recursion trips the frame limit.
#[test]
fn recursion_limit() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();

        let f = emitter.begin_define(DefineSpec {
            name: "f".to_string(),
            params: vec![("x".to_string(), integer.clone())],
            ret: integer.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;

        let x = emitter.symtab.find_var("x").unwrap();
        let deeper = Ast::call(
            Ast::var(f, 2),
            vec![Ast::binary(
                BinaryOp::Plus,
                Ast::var(x, 2),
                Ast::integer(1, 2),
                2,
            )],
            2,
        );
        emitter.emit_return(Some(&deeper))?;
        emitter.end_define()?;

        emitter.eval_expr(&Ast::call(Ast::var(f, 4), vec![Ast::integer(0, 4)], 4))
    });

    let err = result.expect_err("recursion should trip the limit");
    let rendered = err.render();
    assert!(
        rendered.starts_with("RuntimeError: Function call recursion limit reached."),
        "{}",
        rendered
    );
}

/// Comparing a self-referential structure stops at the depth bound.
#[test]
fn equality_depth_bound() {
    let inner = Rc::new(ListVal {
        gc: Default::default(),
        elems: RefCell::new(vec![Value::Unset]),
    });
    inner.elems.borrow_mut()[0] = Value::List(inner.clone());
    let looped = Value::List(inner);

    let err = eq_value(&looped, &looped).expect_err("comparison should hit the bound");
    assert_eq!(err.message, "Infinite loop in comparison.");
    assert_eq!(err.class_id, ids::RUNTIMEERROR);
}

/// dynamic_cast narrows a Dynamic back down, or answers None.
#[test]
fn dynamic_cast_yields_option() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let dynamic = emitter.pool.dynamic();
        let dynamic_new = emitter.symtab.find_var("dynamic_new").unwrap();

        let boxed = Ast::call(Ast::var(dynamic_new, 1), vec![Ast::integer(21, 1)], 1);
        let d = emitter.declare_var_assigned("d", dynamic, &boxed)?;

        // A successful narrow gives Some with the original inside.
        let as_int = Ast::new(
            AstKind::DynamicCast { source: Box::new(Ast::var(d, 2)), class_id: ids::INTEGER },
            2,
        );
        let option_int = emitter.pool.option_of(integer.clone());
        let narrowed = emitter.declare_var_assigned("narrowed", option_int, &as_int)?;

        let result_var = emitter.declare_var_assigned("r", integer.clone(), &Ast::integer(-1, 3))?;
        emitter.begin_match(&Ast::var(narrowed, 4))?;

        let v = emitter.declare_var("v", integer.clone());
        emitter.match_case(ids::SOME, &[v])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(result_var, 5),
            Ast::binary(BinaryOp::Multiply, Ast::var(v, 5), Ast::integer(2, 5), 5),
            5,
        ))?;
        emitter.match_case(ids::NONE, &[])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(result_var, 6),
            Ast::integer(0, 6),
            6,
        ))?;
        emitter.leave_block()?;
        emitter.eval_expr(&out_of(emitter, Ast::var(result_var, 7), 7))?;

        // The wrong class answers None.
        let as_string = Ast::new(
            AstKind::DynamicCast { source: Box::new(Ast::var(d, 8)), class_id: ids::STRING },
            8,
        );
        let option_str = {
            let string = emitter.pool.string();
            emitter.pool.option_of(string)
        };
        let missed = emitter.declare_var_assigned("missed", option_str, &as_string)?;

        let hit = emitter.declare_var_assigned("hit", integer.clone(), &Ast::integer(-1, 9))?;
        emitter.begin_match(&Ast::var(missed, 10))?;
        let s = {
            let string = emitter.pool.string();
            emitter.declare_var("s", string)
        };
        emitter.match_case(ids::SOME, &[s])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(hit, 11),
            Ast::integer(1, 11),
            11,
        ))?;
        emitter.match_case(ids::NONE, &[])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(hit, 12),
            Ast::integer(0, 12),
            12,
        ))?;
        emitter.leave_block()?;
        emitter.eval_expr(&out_of(emitter, Ast::var(hit, 13), 13))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["42", "0"]);
}

/// Interpolation joins values of mixed kinds into one String.
#[test]
fn interpolation_joins() {
    let (_vm, result) = run_program(|emitter| {
        let joined = Ast::new(
            AstKind::Interpolation(vec![
                Ast::string("x = ", 1),
                Ast::integer(4, 1),
                Ast::string(", y = ", 1),
                Ast::double(2.5, 1),
            ]),
            1,
        );
        let out_var = emitter.symtab.find_var("emit_out").unwrap();
        emitter.eval_expr(&Ast::call(Ast::var(out_var, 1), vec![joined], 1))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["x = 4, y = 2.5"]);
}

/// An integer for loop over a global var stays synced with the global
/// before and after every step.
#[test]
fn for_loop_syncs_global_var() {
    let (vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let i = emitter.declare_var_assigned("i", integer.clone(), &Ast::integer(0, 1))?;
        let total = emitter.declare_var_assigned("total", integer, &Ast::integer(0, 1))?;

        emitter.begin_for_in(i, &Ast::integer(1, 2), &Ast::integer(4, 2), None)?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(total, 3),
            Ast::binary(BinaryOp::Plus, Ast::var(total, 3), Ast::var(i, 3), 3),
            3,
        ))?;
        emitter.leave_block()?;

        emitter.eval_expr(&out_of(emitter, Ast::var(total, 4), 4))?;
        emitter.eval_expr(&out_of(emitter, Ast::var(i, 5), 5))
    });

    result.expect("program failed");
    // 1+2+3+4, and the global saw the last loop value.
    assert_eq!(take_output(), vec!["10", "4"]);
    drop(vm);
}

#[test]
fn explicit_zero_step_raises() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let i = emitter.declare_var("i", integer);
        emitter.begin_for_in(
            i,
            &Ast::integer(1, 1),
            &Ast::integer(4, 1),
            Some(&Ast::integer(0, 1)),
        )?;
        emitter.leave_block()
    });

    let err = result.expect_err("zero step should raise");
    let rendered = err.render();
    assert!(
        rendered.starts_with("ValueError: for loop step cannot be 0."),
        "{}",
        rendered
    );
}

/// The embedder can run a named function directly after main.
#[test]
fn call_named_function() {
    let (mut vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();

        emitter.begin_define(DefineSpec {
            name: "double_it".to_string(),
            params: vec![("x".to_string(), integer.clone())],
            ret: integer,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;

        let x = emitter.symtab.find_var("x").unwrap();
        let doubled = Ast::binary(BinaryOp::Multiply, Ast::var(x, 2), Ast::integer(2, 2), 2);
        emitter.emit_return(Some(&doubled))?;
        emitter.end_define()?;
        Ok(())
    });

    result.expect("program failed");

    let value = vm
        .call_name("double_it", vec![Value::Integer(21)])
        .expect("call failed");
    assert!(matches!(value, Value::Integer(42)));
}

fn call_twice(vm: &mut Vm, argc: u16, words: &[u16]) -> OpResult<()> {
    let function = match vm.foreign_reg(words, 0) {
        Value::Function(f) => f,
        _ => panic!("call_twice wants a function"),
    };

    let first = vm.foreign_call(&function, &[])?.as_integer();
    let second = vm.foreign_call(&function, &[])?.as_integer();

    vm.set_foreign_result(words, argc, Value::Integer(first + second));
    Ok(())
}

/// A foreign function re-enters the VM through the documented path; the
/// frame stack and register window survive both round trips.
#[test]
fn foreign_reentry() {
    let mut emitter = common::test_emitter();

    let integer = emitter.pool.integer();
    let counter_ty = emitter
        .pool
        .function(TypeFlags::empty(), integer.clone(), vec![]);
    let twice_ty = emitter
        .pool
        .function(TypeFlags::empty(), integer.clone(), vec![counter_ty.clone()]);
    emitter
        .symtab
        .register_module("ffi", "[ffi]", &[("call_twice", call_twice, twice_ty)]);

    // A counter so each re-entry observes the shared cell advancing.
    let make_counter = emitter
        .begin_define(DefineSpec {
            name: "make_counter".to_string(),
            params: vec![],
            ret: counter_ty.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })
        .unwrap();

    let n = emitter.declare_var("n", integer.clone());
    emitter
        .eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(n, 2),
            Ast::integer(0, 2),
            2,
        ))
        .unwrap();

    emitter
        .begin_define(DefineSpec {
            name: "bump".to_string(),
            params: vec![],
            ret: integer.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })
        .unwrap();
    emitter
        .eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(n, 3),
            Ast::binary(BinaryOp::Plus, Ast::var(n, 3), Ast::integer(1, 3), 3),
            3,
        ))
        .unwrap();
    let bump = emitter.symtab.find_var("bump").unwrap();
    emitter.emit_return(Some(&Ast::var(n, 4))).unwrap();
    emitter.end_define().unwrap();

    emitter.emit_return(Some(&Ast::var(bump, 5))).unwrap();
    emitter.end_define().unwrap();

    let counter = emitter
        .declare_var_assigned(
            "counter",
            counter_ty,
            &Ast::call(Ast::var(make_counter, 7), vec![], 7),
        )
        .unwrap();

    let twice_var = emitter.symtab.find_var("call_twice").unwrap();
    let call = Ast::call(Ast::var(twice_var, 8), vec![Ast::var(counter, 8)], 8);
    emitter.eval_expr(&out_of(&emitter, call, 8)).unwrap();

    let symtab = emitter.finish().unwrap();
    let mut vm = Vm::new(symtab, VmConfig::default());
    vm.run_main().expect("program failed");

    // The two re-entries saw 1 and 2.
    assert_eq!(take_output(), vec!["3"]);
}

/// A tiny GC threshold forces collections mid-run; the program's results
/// are unaffected and the live-entry books stay balanced.
#[test]
fn gc_pressure_mid_run() {
    let config = VmConfig { gc_threshold: 8, ..VmConfig::default() };

    let (vm, result) = run_program_with(config, |emitter| {
        let integer = emitter.pool.integer();
        let dynamic = emitter.pool.dynamic();
        let list_ty = emitter.pool.list_of(dynamic);
        let dynamic_new = emitter.symtab.find_var("dynamic_new").unwrap();

        let seed = Ast::call(Ast::var(dynamic_new, 1), vec![Ast::integer(0, 1)], 1);
        let cell = emitter.declare_var_assigned(
            "cell",
            list_ty,
            &Ast::new(AstKind::BuildList(vec![seed]), 1),
        )?;

        let i = emitter.declare_var("i", integer.clone());
        emitter.begin_for_in(i, &Ast::integer(1, 2), &Ast::integer(40, 2), None)?;

        // Tie a cycle, then drop it by re-seeding the var.
        let wrap = Ast::call(Ast::var(dynamic_new, 3), vec![Ast::var(cell, 3)], 3);
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::subscript(Ast::var(cell, 3), Ast::integer(0, 3), 3),
            wrap,
            3,
        ))?;
        let reseed = Ast::call(Ast::var(dynamic_new, 4), vec![Ast::integer(0, 4)], 4);
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(cell, 4),
            Ast::new(AstKind::BuildList(vec![reseed]), 4),
            4,
        ))?;

        emitter.leave_block()?;

        emitter.eval_expr(&out_of(emitter, Ast::var(i, 5), 5))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["40"]);

    let stats = vm.gc_stats();
    assert!(stats.collections_performed > 0, "no GC pass ran");
    assert_eq!(
        stats.total_allocated - stats.total_freed,
        vm.gc_live_count()
    );
}

/// The import callback is consulted for modules the state does not know.
#[test]
fn import_callback() {
    let (mut vm, result) = run_program(|emitter| {
        emitter.eval_expr(&out_of(emitter, Ast::integer(1, 1), 1))
    });
    result.expect("program failed");
    take_output();

    assert!(vm.import_module("builtin"));
    assert!(!vm.import_module("postgres"));

    vm.set_import_callback(Box::new(|symtab, name| {
        if name == "postgres" {
            symtab.add_module("postgres", "[postgres]");
            true
        } else {
            false
        }
    }));

    assert!(vm.import_module("postgres"));
    // Registered now, so the hook is no longer needed for it.
    assert!(vm.import_module("postgres"));
    assert!(!vm.import_module("sqlite"));
}

/// The builtin streams ignore close; ordinary files give up their handle.
#[test]
fn builtin_files_never_close() {
    use lily_vm::value::FileVal;

    let stdout = FileVal::stdout();
    stdout.close();
    assert!(stdout.inner.borrow().is_some());
    assert!(stdout.write_ok);
    assert!(stdout.is_builtin);
}
