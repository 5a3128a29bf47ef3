mod common;

use common::{out_of, run_program, take_output};
use lily_vm::{ids, Ast, AstKind, BinaryOp, DefineSpec, TypeFlags};

/// var a = 10  var b = 32  print(to_s(a + b))
#[test]
fn arithmetic_and_assignment() {
    let (vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let a = emitter.declare_var_assigned("a", integer.clone(), &Ast::integer(10, 1))?;
        let b = emitter.declare_var_assigned("b", integer, &Ast::integer(32, 2))?;

        let sum = Ast::binary(BinaryOp::Plus, Ast::var(a, 3), Ast::var(b, 3), 3);
        emitter.eval_expr(&out_of(emitter, sum, 3))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["42"]);

    // Everything allocated was either never tagged or is still reachable;
    // the books have to agree.
    let stats = vm.gc_stats();
    assert_eq!(
        stats.total_allocated - stats.total_freed,
        vm.gc_live_count()
    );
}

/// try { 1 / 0 } except DivisionByZeroError as e { print(e.message) }
#[test]
fn caught_division_by_zero() {
    let (_vm, result) = run_program(|emitter| {
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
        let out_var = emitter.symtab.find_var("emit_out").unwrap();
        emitter.eval_expr(&Ast::call(Ast::var(out_var, 4), vec![message], 4))?;

        emitter.leave_block()
    });

    result.expect("the exception should have been caught");
    assert_eq!(take_output(), vec!["Attempt to divide by zero."]);
}

/// define f() { raise ValueError("x") }  f()
#[test]
fn uncaught_exception_traceback() {
    let (_vm, result) = run_program(|emitter| {
        let unit = emitter.pool.unit();
        let f = emitter.begin_define(DefineSpec {
            name: "f".to_string(),
            params: vec![],
            ret: unit,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;

        let ctor = emitter.symtab.find_var("value_error_new").unwrap();
        let raise_value = Ast::call(Ast::var(ctor, 1), vec![Ast::string("x", 1)], 1);
        emitter.emit_raise(&raise_value)?;
        emitter.end_define()?;

        emitter.eval_expr(&Ast::call(Ast::var(f, 1), vec![], 1))
    });

    let err = result.expect_err("the raise should escape");
    let rendered = err.render();

    assert!(rendered.starts_with("ValueError: x\n"), "got: {}", rendered);
    assert!(rendered.contains("Traceback:\n"), "got: {}", rendered);
    assert!(rendered.contains("from [test]:1: in f\n"), "got: {}", rendered);
    assert!(rendered.contains("from [test]:1: in __main__\n"), "got: {}", rendered);

    // f's frame comes before __main__'s.
    let f_at = rendered.find("in f").unwrap();
    let main_at = rendered.find("in __main__").unwrap();
    assert!(f_at < main_at);
}

/// A closure counter: each call sees and mutates the same captured local.
#[test]
fn closure_mutation() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let counter_ty = emitter
            .pool
            .function(TypeFlags::empty(), integer.clone(), vec![]);

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
            ret: integer,
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
            emitter.eval_expr(&out_of(emitter, call, line))?;
        }

        Ok(())
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["1", "2"]);
}

/// Sibling closures share the same cells.
#[test]
fn sibling_closures_share_cells() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let unit = emitter.pool.unit();
        let bump_ty = emitter
            .pool
            .function(TypeFlags::empty(), unit.clone(), vec![]);
        let read_ty = emitter
            .pool
            .function(TypeFlags::empty(), integer.clone(), vec![]);

        let outer_ret = emitter.pool.tuple_of(vec![bump_ty.clone(), read_ty.clone()]);

        let outer = emitter.begin_define(DefineSpec {
            name: "outer".to_string(),
            params: vec![],
            ret: outer_ret.clone(),
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
            ret: unit,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(n, 3),
            Ast::binary(BinaryOp::Plus, Ast::var(n, 3), Ast::integer(7, 3), 3),
            3,
        ))?;
        emitter.end_define()?;

        let read = emitter.begin_define(DefineSpec {
            name: "read".to_string(),
            params: vec![],
            ret: integer.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;
        emitter.emit_return(Some(&Ast::var(n, 5)))?;
        emitter.end_define()?;

        let pair = Ast::new(
            AstKind::BuildTuple(vec![Ast::var(bump, 6), Ast::var(read, 6)]),
            6,
        );
        emitter.emit_return(Some(&pair))?;
        emitter.end_define()?;

        let fns = emitter.declare_var_assigned(
            "fns",
            outer_ret,
            &Ast::call(Ast::var(outer, 8), vec![], 8),
        )?;

        // fns[0]()  fns[0]()  emit_out(to_s(fns[1]()))
        for line in [9, 10] {
            let bump_ref = Ast::subscript(Ast::var(fns, line), Ast::integer(0, line), line);
            emitter.eval_expr(&Ast::call(bump_ref, vec![], line))?;
        }
        let read_ref = Ast::subscript(Ast::var(fns, 11), Ast::integer(1, 11), 11);
        let read_call = Ast::call(read_ref, vec![], 11);
        emitter.eval_expr(&out_of(emitter, read_call, 11))?;

        Ok(())
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["14"]);
}

/// Two containers that point at each other become collectable once the
/// program drops them.
#[test]
fn cycle_collection() {
    let (mut vm, result) = run_program(|emitter| {
        let dynamic = emitter.pool.dynamic();
        let list_ty = emitter.pool.list_of(dynamic);
        let dynamic_new = emitter.symtab.find_var("dynamic_new").unwrap();

        let seed_a = Ast::call(Ast::var(dynamic_new, 1), vec![Ast::integer(0, 1)], 1);
        let a = emitter.declare_var_assigned(
            "a",
            list_ty.clone(),
            &Ast::new(AstKind::BuildList(vec![seed_a]), 1),
        )?;

        let seed_b = Ast::call(Ast::var(dynamic_new, 2), vec![Ast::integer(0, 2)], 2);
        let b = emitter.declare_var_assigned(
            "b",
            list_ty,
            &Ast::new(AstKind::BuildList(vec![seed_b]), 2),
        )?;

        // a[0] = dynamic_new(b)  b[0] = dynamic_new(a)
        let wrap_b = Ast::call(Ast::var(dynamic_new, 3), vec![Ast::var(b, 3)], 3);
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::subscript(Ast::var(a, 3), Ast::integer(0, 3), 3),
            wrap_b,
            3,
        ))?;
        let wrap_a = Ast::call(Ast::var(dynamic_new, 4), vec![Ast::var(a, 4)], 4);
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::subscript(Ast::var(b, 4), Ast::integer(0, 4), 4),
            wrap_a,
            4,
        ))?;

        // Drop the only outside references to the cycle.
        let fresh_a = Ast::call(Ast::var(dynamic_new, 5), vec![Ast::integer(0, 5)], 5);
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(a, 5),
            Ast::new(AstKind::BuildList(vec![fresh_a]), 5),
            5,
        ))?;
        let fresh_b = Ast::call(Ast::var(dynamic_new, 6), vec![Ast::integer(0, 6)], 6);
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(b, 6),
            Ast::new(AstKind::BuildList(vec![fresh_b]), 6),
            6,
        ))?;

        Ok(())
    });

    result.expect("program failed");

    let before = vm.gc_live_count();
    let collected = vm.collect_garbage();

    // The two old lists and the two dynamics linking them are gone.
    assert!(collected >= 2, "collected {}", collected);
    assert_eq!(vm.gc_live_count(), before - collected);

    // A second pass finds nothing new to free.
    assert_eq!(vm.collect_garbage(), 0);
}

/// match over Option[Integer]: Some(5) doubles, None zeroes.
#[test]
fn match_dispatch() {
    let (vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let option_int = emitter.pool.option_of(integer.clone());

        let source = Ast::new(
            AstKind::Variant { variant_class: ids::SOME, args: vec![Ast::integer(5, 1)] },
            1,
        );
        let opt = emitter.declare_var_assigned("opt", option_int, &source)?;
        let result_var =
            emitter.declare_var_assigned("result", integer.clone(), &Ast::integer(-1, 2))?;

        emitter.begin_match(&Ast::var(opt, 3))?;

        let v = emitter.declare_var("v", integer);
        emitter.match_case(ids::SOME, &[v])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(result_var, 4),
            Ast::binary(BinaryOp::Multiply, Ast::var(v, 4), Ast::integer(2, 4), 4),
            4,
        ))?;

        emitter.match_case(ids::NONE, &[])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(result_var, 5),
            Ast::integer(0, 5),
            5,
        ))?;

        emitter.leave_block()?;
        emitter.eval_expr(&out_of(emitter, Ast::var(result_var, 6), 6))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["10"]);
    drop(vm);
}

/// A match that skips a variant is rejected at emit time.
#[test]
fn match_must_be_exhaustive() {
    let mut emitter = common::test_emitter();

    let integer = emitter.pool.integer();
    let option_int = emitter.pool.option_of(integer);

    let source = Ast::new(
        AstKind::Variant { variant_class: ids::SOME, args: vec![Ast::integer(1, 1)] },
        1,
    );
    let opt = emitter
        .declare_var_assigned("opt", option_int, &source)
        .unwrap();

    emitter.begin_match(&Ast::var(opt, 2)).unwrap();
    emitter.match_case(ids::NONE, &[]).unwrap();

    let err = emitter.leave_block().unwrap_err();
    assert!(err.to_string().contains("not exhaustive"), "{}", err);
}

/// Classes: properties, constructor chaining. The subclass constructor
/// builds the instance once; the super new() reuses it.
#[test]
fn class_constructor_chaining() {
    use lily_vm::symtab::ClassFlags;

    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();

        // class Point(x0: Integer) { var x = x0 }
        let (point_id, _point_ctor) = emitter.begin_class(
            "Point",
            None,
            vec![("x".to_string(), integer.clone())],
            ClassFlags::empty(),
            vec![("x0".to_string(), integer.clone())],
        )?;
        let x0 = emitter.symtab.find_var("x0").unwrap();
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::new(
                AstKind::Property { source: Box::new(Ast::new(AstKind::SelfVar, 2)), index: 0 },
                2,
            ),
            Ast::var(x0, 2),
            2,
        ))?;
        emitter.end_class()?;

        // class Point3(x0: Integer, z0: Integer) > Point(x0) { var z = z0 }
        let (_p3_id, p3_ctor) = emitter.begin_class(
            "Point3",
            Some(point_id),
            vec![("z".to_string(), integer.clone())],
            ClassFlags::empty(),
            vec![
                ("x0".to_string(), integer.clone()),
                ("z0".to_string(), integer.clone()),
            ],
        )?;
        let x0 = emitter.symtab.find_var("x0").unwrap();
        let z0 = emitter.symtab.find_var("z0").unwrap();

        emitter.eval_expr(&Ast::new(
            AstKind::SuperCall { parent_class: point_id, args: vec![Ast::var(x0, 4)] },
            4,
        ))?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::new(
                AstKind::Property { source: Box::new(Ast::new(AstKind::SelfVar, 5)), index: 1 },
                5,
            ),
            Ast::var(z0, 5),
            5,
        ))?;
        emitter.end_class()?;

        // var p = Point3.new(3, 9)  emit_out(to_s(p.x + p.z))
        let p3_ty = emitter.pool.default_type(_p3_id);
        let p = emitter.declare_var_assigned(
            "p",
            p3_ty,
            &Ast::call(
                Ast::var(p3_ctor, 7),
                vec![Ast::integer(3, 7), Ast::integer(9, 7)],
                7,
            ),
        )?;

        let read_x = Ast::new(
            AstKind::Property { source: Box::new(Ast::var(p, 8)), index: 0 },
            8,
        );
        let read_z = Ast::new(
            AstKind::Property { source: Box::new(Ast::var(p, 8)), index: 1 },
            8,
        );
        let sum = Ast::binary(BinaryOp::Plus, read_x, read_z, 8);
        emitter.eval_expr(&out_of(emitter, sum, 8))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["12"]);
}

/// A lambda closes over its enclosing local the same way a nested define
/// does.
#[test]
fn lambda_closure() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();
        let adder_ty = emitter
            .pool
            .function(TypeFlags::empty(), integer.clone(), vec![integer.clone()]);

        let make_adder = emitter.begin_define(DefineSpec {
            name: "make_adder".to_string(),
            params: vec![("base".to_string(), integer.clone())],
            ret: adder_ty.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        })?;

        let base = emitter.symtab.find_var("base").unwrap();

        let lambda = emitter.begin_lambda(
            vec![("x".to_string(), integer.clone())],
            integer.clone(),
        )?;
        let x = emitter.symtab.find_var("x").unwrap();
        let sum = Ast::binary(BinaryOp::Plus, Ast::var(base, 2), Ast::var(x, 2), 2);
        emitter.emit_return(Some(&sum))?;
        emitter.end_define()?;

        emitter.emit_return(Some(&Ast::var(lambda, 3)))?;
        emitter.end_define()?;

        let add5 = emitter.declare_var_assigned(
            "add5",
            adder_ty,
            &Ast::call(Ast::var(make_adder, 5), vec![Ast::integer(5, 5)], 5),
        )?;

        let call = Ast::call(Ast::var(add5, 6), vec![Ast::integer(37, 6)], 6);
        emitter.eval_expr(&out_of(emitter, call, 6))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["42"]);
}

/// A user enum with a multi-value variant: dispatch picks the case by
/// variant id and decompose spreads the fields.
#[test]
fn user_enum_match() {
    let (_vm, result) = run_program(|emitter| {
        let integer = emitter.pool.integer();

        let shape = emitter.declare_enum(
            "Shape",
            0,
            vec![
                ("Circle".to_string(), vec![integer.clone()]),
                ("Rect".to_string(), vec![integer.clone(), integer.clone()]),
                ("Dot".to_string(), vec![]),
            ],
        );
        let shape_cls = emitter.symtab.class(shape).clone();
        let circle = shape_cls.variants[0];
        let rect = shape_cls.variants[1];
        let dot = shape_cls.variants[2];

        let shape_ty = emitter.pool.default_type(shape);
        let value = Ast::new(
            AstKind::Variant {
                variant_class: rect,
                args: vec![Ast::integer(6, 1), Ast::integer(7, 1)],
            },
            1,
        );
        let s = emitter.declare_var_assigned("s", shape_ty, &value)?;
        let area = emitter.declare_var_assigned("area", integer.clone(), &Ast::integer(0, 2))?;

        emitter.begin_match(&Ast::var(s, 3))?;

        let r = emitter.declare_var("r", integer.clone());
        emitter.match_case(circle, &[r])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(area, 4),
            Ast::var(r, 4),
            4,
        ))?;

        let w = emitter.declare_var("w", integer.clone());
        let h = emitter.declare_var("h", integer);
        emitter.match_case(rect, &[w, h])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(area, 5),
            Ast::binary(BinaryOp::Multiply, Ast::var(w, 5), Ast::var(h, 5), 5),
            5,
        ))?;

        emitter.match_case(dot, &[])?;
        emitter.eval_expr(&Ast::binary(
            BinaryOp::Assign,
            Ast::var(area, 6),
            Ast::integer(0, 6),
            6,
        ))?;

        emitter.leave_block()?;
        emitter.eval_expr(&out_of(emitter, Ast::var(area, 7), 7))
    });

    result.expect("program failed");
    assert_eq!(take_output(), vec!["42"]);
}
