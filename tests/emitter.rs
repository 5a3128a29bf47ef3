mod common;

use common::{out_of, run_program, take_output, test_emitter};
use lily_vm::symtab::VarKind;
use lily_vm::{ids, Ast, AstKind, BinaryOp, CallArg, CodeIter, DefineSpec, Opcode, TypeFlags, Value};

/// Collect every native function the emitter produced.
fn native_functions(symtab: &lily_vm::Symtab) -> Vec<std::rc::Rc<lily_vm::value::FunctionVal>> {
    symtab
        .readonly
        .iter()
        .filter_map(|v| match v {
            Value::Function(f) if f.is_native() => Some(f.clone()),
            _ => None,
        })
        .collect()
}

/// The code iterator visits every word of every function exactly once,
/// and every jump lands on an instruction boundary.
#[test]
fn iterator_covers_all_code() {
    let mut emitter = test_emitter();

    let integer = emitter.pool.integer();
    let total = emitter
        .declare_var_assigned("total", integer.clone(), &Ast::integer(0, 1))
        .unwrap();
    let i = emitter.declare_var("i", integer);

    emitter
        .begin_for_in(i, &Ast::integer(1, 2), &Ast::integer(10, 2), None)
        .unwrap();

    let cond = Ast::binary(
        BinaryOp::Eq,
        Ast::binary(BinaryOp::Modulo, Ast::var(i, 3), Ast::integer(2, 3), 3),
        Ast::integer(0, 3),
        3,
    );
    emitter.begin_if(&cond).unwrap();
    emitter
        .eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(total, 4),
            Ast::binary(BinaryOp::Plus, Ast::var(total, 4), Ast::var(i, 4), 4),
            4,
        ))
        .unwrap();
    emitter.branch_if(None).unwrap();
    emitter.emit_continue().unwrap();
    emitter.leave_block().unwrap();

    emitter.leave_block().unwrap();

    let symtab = emitter.finish().unwrap();

    for function in native_functions(&symtab) {
        let code = function.code.as_ref().unwrap();

        let mut starts = Vec::new();
        let mut covered = 0usize;
        let mut ci = CodeIter::new(code, 0, code.len());
        while ci.next() {
            starts.push(ci.offset);
            covered += ci.round_total;
        }

        assert_eq!(covered, code.len(), "iterator skipped words in {}", function.name);

        // Walk again checking jump targets.
        let mut ci = CodeIter::new(code, 0, code.len());
        while ci.next() {
            let jump_start = ci.jump_start();
            for j in 0..ci.jumps {
                let slot = jump_start + j;
                if code[slot] == 0 {
                    continue;
                }
                let dest = (slot as isize + code[slot] as i16 as isize) as usize;
                assert!(
                    starts.contains(&dest),
                    "jump at {} in {} targets {} which is not an instruction",
                    slot,
                    function.name,
                    dest
                );
            }
        }
    }
}

/// if/elif/else branch patching: exactly one branch runs.
#[test]
fn if_else_branches() {
    for (input, expected) in [(1i64, "one"), (2, "two"), (9, "other")] {
        let (_vm, result) = run_program(|emitter| {
            let integer = emitter.pool.integer();
            let x = emitter.declare_var_assigned("x", integer, &Ast::integer(input, 1))?;

            let eq_one = Ast::binary(BinaryOp::Eq, Ast::var(x, 2), Ast::integer(1, 2), 2);
            emitter.begin_if(&eq_one)?;
            emitter.eval_expr(&out_of(emitter, Ast::string("one", 3), 3))?;

            let eq_two = Ast::binary(BinaryOp::Eq, Ast::var(x, 4), Ast::integer(2, 4), 4);
            emitter.branch_if(Some(&eq_two))?;
            emitter.eval_expr(&out_of(emitter, Ast::string("two", 5), 5))?;

            emitter.branch_if(None)?;
            emitter.eval_expr(&out_of(emitter, Ast::string("other", 6), 6))?;

            emitter.leave_block()
        });

        result.expect("program failed");
        assert_eq!(take_output(), vec![expected]);
    }
}

/// while with break and continue; breaks unwind through a try first.
#[test]
fn loops_with_break_and_continue() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let i = emitter.declare_var_assigned("i", integer.clone(), &Ast::integer(0, 1))?;
        let hits = emitter.declare_var_assigned("hits", integer, &Ast::integer(0, 1))?;

        let cond = Ast::binary(BinaryOp::Lt, Ast::var(i, 2), Ast::integer(100, 2), 2);
        emitter.begin_while(&cond)?;

        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(i, 3),
            Ast::binary(BinaryOp::Plus, Ast::var(i, 3), Ast::integer(1, 3), 3),
            3,
        ))?;

        // Skip odd numbers.
        let odd = Ast::binary(
            BinaryOp::Eq,
            Ast::binary(BinaryOp::Modulo, Ast::var(i, 4), Ast::integer(2, 4), 4),
            Ast::integer(1, 4),
            4,
        );
        emitter.begin_if(&odd)?;
        emitter.emit_continue()?;
        emitter.leave_block()?;

        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(hits, 5),
            Ast::binary(BinaryOp::Plus, Ast::var(hits, 5), Ast::integer(1, 5), 5),
            5,
        ))?;

        // A break inside a try has to pop the catch entry on the way out.
        emitter.begin_try();
        let at_limit = Ast::binary(BinaryOp::GtEq, Ast::var(i, 6), Ast::integer(10, 6), 6);
        emitter.begin_if(&at_limit)?;
        emitter.emit_break()?;
        emitter.leave_block()?;
        let err_ty = emitter.pool.default_type(ids::EXCEPTION);
        let e = emitter.declare_var("e", err_ty);
        emitter.begin_except(ids::EXCEPTION, Some(e))?;
        emitter.leave_block()?;

        emitter.leave_block()?;

        emitter.eval_expr(&out_of(emitter, Ast::var(hits, 8), 8))?;
        // A raise after the loop proves the catch chain is balanced.
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Divide,
            Ast::integer(1, 9),
            Ast::integer(0, 9),
            9,
        ))
    });

    // The loop output arrives, then the unbalanced-check raise escapes.
    let err = result.expect_err("the trailing division should escape");
    assert!(err.to_string().contains("DivisionByZeroError"), "{}", err);
    assert_eq!(take_output(), vec!["5"]);
}

/// do-while runs its body before the test.
#[test]
fn do_while_runs_once() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let n = emitter.declare_var_assigned("n", integer, &Ast::integer(100, 1))?;

        emitter.begin_do_while();
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(n, 2),
            Ast::binary(BinaryOp::Plus, Ast::var(n, 2), Ast::integer(1, 2), 2),
            2,
        ))?;
        let cond = Ast::binary(BinaryOp::Lt, Ast::var(n, 3), Ast::integer(0, 3), 3);
        emitter.end_do_while(&cond)?;

        emitter.eval_expr(&out_of(emitter, Ast::var(n, 4), 4))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["101"]);
}

/// Optional arguments: the dispatch header fills only what the caller
/// left unset.
#[test]
fn optarg_dispatch() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let opt_int = emitter.pool.optarg_of(integer.clone());

        let f = emitter.begin_define(DefineSpec {
            name: "f".to_string(),
            params: vec![
                ("a".to_string(), integer.clone()),
                ("b".to_string(), opt_int.clone()),
                ("c".to_string(), opt_int),
            ],
            ret: integer.clone(),
            flags: TypeFlags::HAS_OPTARGS,
            generic_count: 0,
            class_id: None,
        })?;

        emitter.eval_optarg(1, &Ast::integer(10, 1))?;
        emitter.eval_optarg(2, &Ast::integer(100, 1))?;

        let a = emitter.symtab.find_var("a").unwrap();
        let b = emitter.symtab.find_var("b").unwrap();
        let c = emitter.symtab.find_var("c").unwrap();
        let sum = Ast::binary(
            BinaryOp::Plus,
            Ast::binary(BinaryOp::Plus, Ast::var(a, 2), Ast::var(b, 2), 2),
            Ast::var(c, 2),
            2,
        );
        emitter.emit_return(Some(&sum))?;
        emitter.end_define()?;

        for (args, line) in [
            (vec![Ast::integer(1, 3)], 3),
            (vec![Ast::integer(1, 4), Ast::integer(2, 4)], 4),
            (vec![Ast::integer(1, 5), Ast::integer(2, 5), Ast::integer(3, 5)], 5),
        ] {
            let call = Ast::call(Ast::var(f, line), args, line);
            emitter.eval_expr(&out_of(emitter, call, line))?;
        }

        Ok(())
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["111", "103", "6"]);
}

/// Keyword arguments re-link into declaration order; holes are padded
/// with the unset sentinel so the dispatch still counts right.
#[test]
fn keyword_arguments_reorder() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let opt_int = emitter.pool.optarg_of(integer.clone());

        let f = emitter.begin_define(DefineSpec {
            name: "f".to_string(),
            params: vec![
                ("a".to_string(), integer.clone()),
                ("b".to_string(), opt_int.clone()),
                ("c".to_string(), opt_int),
            ],
            ret: integer.clone(),
            flags: TypeFlags::HAS_OPTARGS,
            generic_count: 0,
            class_id: None,
        })?;

        emitter.eval_optarg(1, &Ast::integer(10, 1))?;
        emitter.eval_optarg(2, &Ast::integer(100, 1))?;

        let a = emitter.symtab.find_var("a").unwrap();
        let b = emitter.symtab.find_var("b").unwrap();
        let c = emitter.symtab.find_var("c").unwrap();
        let sum = Ast::binary(
            BinaryOp::Plus,
            Ast::binary(
                BinaryOp::Plus,
                Ast::binary(
                    BinaryOp::Multiply,
                    Ast::var(a, 2),
                    Ast::integer(10000, 2),
                    2,
                ),
                Ast::binary(BinaryOp::Multiply, Ast::var(b, 2), Ast::integer(100, 2), 2),
                2,
            ),
            Ast::var(c, 2),
            2,
        );
        emitter.emit_return(Some(&sum))?;
        emitter.end_define()?;

        // f(1, c: 7): b stays defaulted even though c was given.
        let call = Ast::call_keyed(
            Ast::var(f, 3),
            vec![
                CallArg { keyword_pos: None, expr: Ast::integer(1, 3) },
                CallArg { keyword_pos: Some(2), expr: Ast::integer(7, 3) },
            ],
            3,
        );
        emitter.eval_expr(&out_of(emitter, call, 3))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["11007"]);
}

/// Varargs collect the tail into a list.
#[test]
fn vararg_tail_builds_list() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let list_int = emitter.pool.list_of(integer.clone());

        let f = emitter.begin_define(DefineSpec {
            name: "f".to_string(),
            params: vec![
                ("first".to_string(), integer.clone()),
                ("rest".to_string(), list_int),
            ],
            ret: integer.clone(),
            flags: TypeFlags::IS_VARARGS,
            generic_count: 0,
            class_id: None,
        })?;

        let first = emitter.symtab.find_var("first").unwrap();
        let rest = emitter.symtab.find_var("rest").unwrap();

        // first + rest[0] + rest[1]
        let sum = Ast::binary(
            BinaryOp::Plus,
            Ast::binary(
                BinaryOp::Plus,
                Ast::var(first, 2),
                Ast::subscript(Ast::var(rest, 2), Ast::integer(0, 2), 2),
                2,
            ),
            Ast::subscript(Ast::var(rest, 2), Ast::integer(1, 2), 2),
            2,
        );
        emitter.emit_return(Some(&sum))?;
        emitter.end_define()?;

        let call = Ast::call(
            Ast::var(f, 3),
            vec![Ast::integer(1, 3), Ast::integer(20, 3), Ast::integer(300, 3)],
            3,
        );
        emitter.eval_expr(&out_of(emitter, call, 3))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["321"]);
}

/// A closure containing a loop: the transform inserts cell reloads and
/// the loop's backward jump still lands right.
#[test]
fn closure_transform_preserves_loops() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let inner_ty = emitter
            .pool
            .function(TypeFlags::empty(), integer.clone(), vec![]);

        let outer = emitter.begin_define(DefineSpec {
            name: "outer".to_string(),
            params: vec![],
            ret: inner_ty.clone(),
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

        let inner = emitter.begin_define(DefineSpec {
            name: "inner".to_string(),
            params: vec![],
            ret: integer,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;

        let cond = Ast::binary(BinaryOp::Lt, Ast::var(n, 4), Ast::integer(3, 4), 4);
        emitter.begin_while(&cond)?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(n, 5),
            Ast::binary(BinaryOp::Plus, Ast::var(n, 5), Ast::integer(1, 5), 5),
            5,
        ))?;
        emitter.leave_block()?;
        emitter.emit_return(Some(&Ast::var(n, 6)))?;
        emitter.end_define()?;

        emitter.emit_return(Some(&Ast::var(inner, 7)))?;
        emitter.end_define()?;

        let make = Ast::call(Ast::var(outer, 9), vec![], 9);
        let counter = emitter.declare_var_assigned("counter", inner_ty, &make)?;
        let call = Ast::call(Ast::var(counter, 10), vec![], 10);
        emitter.eval_expr(&out_of(emitter, call, 10))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["3"]);
}

/// The transformed inner function reads the cell through closure_get and
/// writes it back through closure_set; ignoring those, the instruction
/// stream matches an untransformed twin.
#[test]
fn closure_transform_instruction_shape() {
    let mut emitter = test_emitter();

    let integer = emitter.pool.integer();
    let inner_ty = emitter
        .pool
        .function(TypeFlags::empty(), integer.clone(), vec![]);

    let _outer = emitter
        .begin_define(DefineSpec {
            name: "outer".to_string(),
            params: vec![],
            ret: inner_ty,
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

    let inner = emitter
        .begin_define(DefineSpec {
            name: "inner".to_string(),
            params: vec![],
            ret: integer,
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
    emitter.emit_return(Some(&Ast::var(n, 4))).unwrap();
    emitter.end_define().unwrap();

    emitter.emit_return(Some(&Ast::var(inner, 5))).unwrap();
    emitter.end_define().unwrap();

    let symtab = emitter.finish().unwrap();

    let inner_fn = native_functions(&symtab)
        .into_iter()
        .find(|f| f.name == "inner")
        .expect("inner function missing");

    let code = inner_fn.code.as_ref().unwrap();
    let mut opcodes = Vec::new();
    let mut closure_ops = 0;

    let mut ci = CodeIter::new(code, 0, code.len());
    while ci.next() {
        match ci.opcode {
            Opcode::ClosureGet | Opcode::ClosureSet => closure_ops += 1,
            other => opcodes.push(other),
        }
    }

    // Reads of the captured var reload the cell; the write stores back.
    // With the cell traffic removed, the body is just the arithmetic.
    assert!(closure_ops >= 2, "expected cell traffic, got {}", closure_ops);
    assert_eq!(
        opcodes,
        vec![Opcode::LoadInteger, Opcode::IntAdd, Opcode::ReturnValue]
    );
}

/// Nested function references are routed through closure_function.
#[test]
fn nested_defines_need_closure() {
    let mut emitter = test_emitter();

    let integer = emitter.pool.integer();
    let inner_ty = emitter
        .pool
        .function(TypeFlags::empty(), integer.clone(), vec![]);

    emitter
        .begin_define(DefineSpec {
            name: "outer".to_string(),
            params: vec![],
            ret: inner_ty,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })
        .unwrap();

    let inner = emitter
        .begin_define(DefineSpec {
            name: "inner".to_string(),
            params: vec![],
            ret: integer,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })
        .unwrap();
    emitter.emit_return(Some(&Ast::integer(1, 2))).unwrap();
    emitter.end_define().unwrap();

    assert!(emitter.symtab.var(inner).needs_closure);
    match emitter.symtab.var(inner).kind {
        VarKind::ReadonlyFunc { foreign, .. } => assert!(!foreign),
        _ => panic!("inner is not a readonly function"),
    }

    emitter.emit_return(Some(&Ast::var(inner, 3))).unwrap();
    emitter.end_define().unwrap();
    emitter.finish().unwrap();
}

/// Subscripting a tuple with a non-literal index is refused at emit time.
#[test]
fn tuple_subscript_needs_literal() {
    let mut emitter = test_emitter();

    let integer = emitter.pool.integer();
    let string = emitter.pool.string();
    let tuple_ty = emitter.pool.tuple_of(vec![integer.clone(), string]);

    let t = emitter
        .declare_var_assigned(
            "t",
            tuple_ty,
            &Ast::new(
                AstKind::BuildTuple(vec![Ast::integer(1, 1), Ast::string("x", 1)]),
                1,
            ),
        )
        .unwrap();

    let idx = emitter.declare_var_assigned("i", integer, &Ast::integer(0, 2)).unwrap();
    let err = emitter
        .eval_expr(&Ast::subscript(Ast::var(t, 3), Ast::var(idx, 3), 3))
        .unwrap_err();

    assert!(err.to_string().contains("literal"), "{}", err);
}

/// A function whose tail might not return is rejected.
#[test]
fn missing_return_is_rejected() {
    let mut emitter = test_emitter();

    let integer = emitter.pool.integer();
    emitter
        .begin_define(DefineSpec {
            name: "f".to_string(),
            params: vec![],
            ret: integer,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })
        .unwrap();

    let err = emitter.end_define().unwrap_err();
    assert!(err.to_string().contains("Missing return"), "{}", err);
}

/// The backing function's own loop mutates a closed-over local: the
/// transform has to insert cell traffic inside the loop and re-aim the
/// backward jump around it.
#[test]
fn closure_transform_backing_loop() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();

        let outer = emitter.begin_define(DefineSpec {
            name: "outer".to_string(),
            params: vec![],
            ret: integer.clone(),
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

        let inner = emitter.begin_define(DefineSpec {
            name: "inner".to_string(),
            params: vec![],
            ret: integer.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;
        emitter.emit_return(Some(&Ast::var(n, 4)))?;
        emitter.end_define()?;

        // The loop below runs in the backing function, so every read and
        // write of n here goes through inserted cell traffic.
        let cond = Ast::binary(BinaryOp::Lt, Ast::var(n, 5), Ast::integer(3, 5), 5);
        emitter.begin_while(&cond)?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(n, 6),
            Ast::binary(BinaryOp::Plus, Ast::var(n, 6), Ast::integer(1, 6), 6),
            6,
        ))?;
        emitter.leave_block()?;

        let inner_result = Ast::call(Ast::var(inner, 7), vec![], 7);
        emitter.emit_return(Some(&inner_result))?;
        emitter.end_define()?;

        let call = Ast::call(Ast::var(outer, 9), vec![], 9);
        emitter.eval_expr(&out_of(emitter, call, 9))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["3"]);
}
