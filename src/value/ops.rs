use std::rc::Rc;

use crate::symtab::ids;
use crate::value::sip::siphash24;
use crate::value::{HashElem, HashVal, Value};
use crate::vm::{OpResult, Raise};

/// Comparing self-referential structures has to stop somewhere.
const MAX_EQ_DEPTH: u32 = 100;

fn eq_loop_error() -> Box<Raise> {
    Box::new(Raise {
        class_id: ids::RUNTIMEERROR,
        message: "Infinite loop in comparison.".to_string(),
        raised_value: None,
    })
}

fn subvalue_eq(depth: u32, left: &[Value], right: &[Value]) -> OpResult<bool> {
    if left.len() != right.len() {
        return Ok(false);
    }

    for (l, r) in left.iter().zip(right.iter()) {
        if !eq_value_raw(depth + 1, l, r)? {
            return Ok(false);
        }
    }

    Ok(true)
}

fn eq_value_raw(depth: u32, left: &Value, right: &Value) -> OpResult<bool> {
    if depth == MAX_EQ_DEPTH {
        return Err(eq_loop_error());
    }

    match (left, right) {
        (Value::Unit, Value::Unit) => Ok(true),
        (Value::Boolean(a), Value::Boolean(b)) => Ok(a == b),
        (Value::Integer(a), Value::Integer(b)) => Ok(a == b),
        (Value::Double(a), Value::Double(b)) => Ok(a == b),
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::ByteString(a), Value::ByteString(b)) => Ok(a == b),
        (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
            subvalue_eq(depth, &a.elems.borrow(), &b.elems.borrow())
        }
        (Value::Dynamic(a), Value::Dynamic(b)) => {
            eq_value_raw(depth + 1, &a.inner.borrow(), &b.inner.borrow())
        }
        (Value::Variant(a), Value::Variant(b)) => {
            if a.enum_id != b.enum_id || a.variant_id != b.variant_id {
                Ok(false)
            } else {
                subvalue_eq(depth, &a.values.borrow(), &b.values.borrow())
            }
        }
        (Value::Hash(a), Value::Hash(b)) => hash_eq(depth, a, b),
        // Instances, functions, and files compare by identity.
        (Value::Instance(a), Value::Instance(b)) => Ok(Rc::ptr_eq(a, b)),
        (Value::Function(a), Value::Function(b)) => Ok(Rc::ptr_eq(a, b)),
        (Value::File(a), Value::File(b)) => Ok(Rc::ptr_eq(a, b)),
        _ => Ok(false),
    }
}

/// Hash equality is unordered: every element on the left must have a
/// matching key (by stored hash, then key equality) with an equal value on
/// the right.
fn hash_eq(depth: u32, left: &Rc<HashVal>, right: &Rc<HashVal>) -> OpResult<bool> {
    let left_elems = left.elems.borrow();
    let right_elems = right.elems.borrow();

    if left_elems.len() != right_elems.len() {
        return Ok(false);
    }

    for l in left_elems.iter() {
        let mut found = false;
        for r in right_elems.iter() {
            if l.key_hash != r.key_hash {
                continue;
            }
            if eq_value_raw(depth + 1, &l.key, &r.key)?
                && eq_value_raw(depth + 1, &l.value, &r.value)?
            {
                found = true;
                break;
            }
        }

        if !found {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Determine if two values are equivalent. Raises RuntimeError when the
/// walk exceeds the depth bound.
pub fn eq_value(left: &Value, right: &Value) -> OpResult<bool> {
    eq_value_raw(0, left, right)
}

/// Compute the keyed hash for a hash key. Only classes with the hash-key
/// flag reach this; the emitter rejects everything else.
pub fn calculate_hash(sipkey: &[u8; 16], key: &Value) -> u64 {
    match key {
        Value::Integer(i) => *i as u64,
        Value::String(s) => siphash24(s.as_bytes(), sipkey),
        Value::Double(d) => siphash24(&d.to_le_bytes(), sipkey),
        _ => 0,
    }
}

/// Find a key's element index within a hash, using the stored hash first
/// and full key equality second.
pub fn hash_find(hash: &HashVal, key_hash: u64, key: &Value) -> OpResult<Option<usize>> {
    let elems = hash.elems.borrow();
    for (i, elem) in elems.iter().enumerate() {
        if elem.key_hash == key_hash && eq_value(&elem.key, key)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Set a key within a hash. Assignment to a missing key creates it.
pub fn hash_set(hash: &HashVal, key_hash: u64, key: Value, value: Value) -> OpResult<()> {
    let spot = hash_find(hash, key_hash, &key)?;
    let mut elems = hash.elems.borrow_mut();
    match spot {
        Some(i) => elems[i].value = value,
        None => elems.push(HashElem { key_hash, key, value }),
    }
    Ok(())
}

/// Render a value the way interpolation and print show it. Strings are
/// bare (no quoting) at the top level.
pub fn interpolate_value(value: &Value) -> String {
    value.to_string()
}
