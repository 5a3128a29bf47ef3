use std::rc::Rc;

use lily_vm::symtab::{ids, Symtab};
use lily_vm::types::{type_eq, TypeFlags, TypePool, TypeSystem};

fn setup() -> (TypePool, TypeSystem, Symtab) {
    (TypePool::new(), TypeSystem::new(), Symtab::new())
}

#[test]
fn construction_dedupes() {
    let (mut pool, _, _) = setup();

    let integer = pool.integer();
    let list_a = pool.list_of(integer.clone());
    let list_b = pool.list_of(integer.clone());
    assert!(Rc::ptr_eq(&list_a, &list_b));

    let string_ty = pool.string();
    let hash_a = pool.hash_of(string_ty.clone(), list_a.clone());
    let hash_b = pool.hash_of(string_ty, list_b);
    assert!(Rc::ptr_eq(&hash_a, &hash_b));

    // Different flags are different types.
    let f_plain = pool.function(TypeFlags::empty(), integer.clone(), vec![list_a.clone()]);
    let f_va = pool.function(TypeFlags::IS_VARARGS, integer, vec![list_a]);
    assert!(!Rc::ptr_eq(&f_plain, &f_va));
}

#[test]
fn unresolved_flag_bubbles() {
    let (mut pool, _, _) = setup();

    let a = pool.generic(0);
    assert!(a.flags.contains(TypeFlags::IS_UNRESOLVED));

    let list_a = pool.list_of(a);
    assert!(list_a.flags.contains(TypeFlags::IS_UNRESOLVED));

    let string_ty = pool.string();
    let deep = pool.hash_of(string_ty, list_a);
    assert!(deep.flags.contains(TypeFlags::IS_UNRESOLVED));

    let integer_ty = pool.integer();
    let plain = pool.list_of(integer_ty);
    assert!(!plain.flags.contains(TypeFlags::IS_UNRESOLVED));
}

#[test]
fn check_solves_generics() {
    let (mut pool, mut ts, symtab) = setup();

    ts.generics_seen(1);
    let save = ts.raise_ceiling();

    let a = pool.generic(0);
    let list_a = pool.list_of(a.clone());
    let integer_ty = pool.integer();
    let list_int = pool.list_of(integer_ty);

    assert!(ts.check(&mut pool, &symtab, &list_a, &list_int));

    // The binding shows up in resolve.
    let resolved = ts.resolve(&mut pool, &a);
    let integer_ty = pool.integer();
    assert!(type_eq(&resolved, &integer_ty));

    // A conflicting solve fails.
    let string_ty = pool.string();
    let list_str = pool.list_of(string_ty);
    assert!(!ts.check(&mut pool, &symtab, &list_a, &list_str));

    ts.lower_ceiling(save);
}

#[test]
fn resolve_is_idempotent() {
    let (mut pool, mut ts, symtab) = setup();

    ts.generics_seen(2);
    let save = ts.raise_ceiling();

    let a = pool.generic(0);
    let b = pool.generic(1);
    let list_a = pool.list_of(a);
    let integer_ty = pool.integer();
    let list_int = pool.list_of(integer_ty);
    assert!(ts.check(&mut pool, &symtab, &list_a, &list_int));

    // B was never solved; it defaults to Dynamic and stays there.
    let list_a_generic = list_a_of(&mut pool);
    let pair = pool.tuple_of(vec![list_a_generic, b]);
    let once = ts.resolve(&mut pool, &pair);
    let twice = ts.resolve(&mut pool, &once);
    assert!(Rc::ptr_eq(&once, &twice));

    let again = ts.resolve(&mut pool, &pair);
    assert!(Rc::ptr_eq(&once, &again));

    ts.lower_ceiling(save);
}

fn list_a_of(pool: &mut TypePool) -> lily_vm::TypeRef {
    let a = pool.generic(0);
    pool.list_of(a)
}

#[test]
fn unify_is_symmetric() {
    let (mut pool, mut ts, symtab) = setup();

    let question = pool.question();
    let option_q = pool.option_of(question);
    let integer_ty = pool.integer();
    let option_int = pool.option_of(integer_ty);

    let ab = ts.unify(&mut pool, &symtab, &option_q, &option_int).unwrap();
    let ba = ts.unify(&mut pool, &symtab, &option_int, &option_q).unwrap();
    assert!(Rc::ptr_eq(&ab, &ba));
    assert!(Rc::ptr_eq(&ab, &option_int));

    // Mismatched classes do not meet.
    let integer_ty = pool.integer();
    let list_int = pool.list_of(integer_ty);
    assert!(ts.unify(&mut pool, &symtab, &list_int, &option_int).is_none());

    // Simple same-type unify is the type itself.
    let int = pool.integer();
    let same = ts.unify(&mut pool, &symtab, &int, &int).unwrap();
    assert!(Rc::ptr_eq(&same, &int));
}

#[test]
fn subtype_chain() {
    let (mut pool, mut ts, symtab) = setup();

    let exception = pool.default_type(ids::EXCEPTION);
    let value_error = pool.default_type(ids::VALUEERROR);

    assert!(ts.type_greater_eq(&mut pool, &symtab, &exception, &value_error));
    assert!(!ts.type_greater_eq(&mut pool, &symtab, &value_error, &exception));

    // Containers are invariant in their subtypes.
    let list_exc = pool.list_of(exception);
    let list_ve = pool.list_of(value_error);
    assert!(!ts.type_greater_eq(&mut pool, &symtab, &list_exc, &list_ve));
}

#[test]
fn function_variance() {
    let (mut pool, mut ts, symtab) = setup();

    let unit = pool.unit();
    let exception = pool.default_type(ids::EXCEPTION);
    let value_error = pool.default_type(ids::VALUEERROR);

    // Parameters are contravariant: a handler of Exception serves where a
    // handler of ValueError is wanted.
    let want = pool.function(TypeFlags::empty(), unit.clone(), vec![value_error.clone()]);
    let have = pool.function(TypeFlags::empty(), unit.clone(), vec![exception.clone()]);
    assert!(ts.type_greater_eq(&mut pool, &symtab, &want, &have));
    assert!(!ts.type_greater_eq(&mut pool, &symtab, &have, &want));

    // Returns are covariant.
    let want_ret = pool.function(TypeFlags::empty(), exception, vec![]);
    let have_ret = pool.function(TypeFlags::empty(), value_error, vec![]);
    assert!(ts.type_greater_eq(&mut pool, &symtab, &want_ret, &have_ret));
    assert!(!ts.type_greater_eq(&mut pool, &symtab, &have_ret, &want_ret));

    // Width compatibility: extra optargs on the provider are fine.
    let integer = pool.integer();
    let opt_int = pool.optarg_of(integer.clone());
    let want_narrow = pool.function(TypeFlags::empty(), unit.clone(), vec![integer.clone()]);
    let have_wide = pool.function(
        TypeFlags::HAS_OPTARGS,
        unit,
        vec![integer, opt_int],
    );
    assert!(ts.type_greater_eq(&mut pool, &symtab, &want_narrow, &have_wide));
}

#[test]
fn question_accepts_everything() {
    let (mut pool, mut ts, symtab) = setup();

    let question = pool.question();
    let integer_ty = pool.integer();
    let list_int = pool.list_of(integer_ty);

    assert!(ts.check(&mut pool, &symtab, &question, &list_int));
    assert!(ts.check(&mut pool, &symtab, &list_int, &question));
}

#[test]
fn resolve_by_second_reads_first_subtypes() {
    let (mut pool, mut ts, _) = setup();

    // Resolving `A` against `Option[String]` yields String.
    let a = pool.generic(0);
    let string_ty = pool.string();
    let option_str = pool.option_of(string_ty);
    let resolved = ts.resolve_by_second(&mut pool, &option_str, &a);
    assert!(type_eq(&resolved, &pool.string()));
}
