pub mod system;

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;

use crate::symtab::ids;

pub use system::TypeSystem;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u16 {
        const IS_VARARGS    = 0x0001;
        const HAS_OPTARGS   = 0x0002;
        /// Contains a generic somewhere inside.
        const IS_UNRESOLVED = 0x0004;
        /// Contains the `?` placeholder somewhere inside.
        const IS_INCOMPLETE = 0x0008;
        /// Contains the internal catch-all used by a few builtins.
        const HAS_SCOOP     = 0x0010;
    }
}

/// Flags that bubble up from subtypes when a type is built.
const BUBBLE_FLAGS: TypeFlags = TypeFlags::IS_UNRESOLVED
    .union(TypeFlags::IS_INCOMPLETE)
    .union(TypeFlags::HAS_SCOOP);

/// An immutable, interned type. Two structurally identical types are the
/// same `Rc`, so equality everywhere else in the core is pointer equality.
#[derive(Debug)]
pub struct Type {
    pub cls: u16,
    pub generic_pos: u16,
    pub flags: TypeFlags,
    /// For functions, subtypes[0] is the return type and the rest are
    /// parameters.
    pub subtypes: Vec<TypeRef>,
}

pub type TypeRef = Rc<Type>;

pub fn type_eq(a: &TypeRef, b: &TypeRef) -> bool {
    Rc::ptr_eq(a, b)
}

/// Owner of every interned type. Construction always goes through `make`,
/// which dedupes against the per-class list.
pub struct TypePool {
    by_class: HashMap<u16, Vec<TypeRef>>,
    generics: Vec<TypeRef>,
    defaults: HashMap<u16, TypeRef>,
}

impl TypePool {
    pub fn new() -> Self {
        let mut pool = TypePool {
            by_class: HashMap::new(),
            generics: Vec::new(),
            defaults: HashMap::new(),
        };

        // Seed the default type of every simple builtin so lookups by
        // class id never allocate.
        for id in [
            ids::INTEGER,
            ids::DOUBLE,
            ids::STRING,
            ids::BOOLEAN,
            ids::BYTESTRING,
            ids::DYNAMIC,
            ids::FILE,
            ids::UNIT,
            ids::QUESTION,
            ids::SCOOP,
            ids::EXCEPTION,
            ids::IOERROR,
            ids::KEYERROR,
            ids::VALUEERROR,
            ids::RUNTIMEERROR,
            ids::INDEXERROR,
            ids::DIVISIONBYZEROERROR,
            ids::FORMATERROR,
            ids::BADTYPECASTERROR,
            ids::RECURSIONERROR,
        ] {
            pool.default_type(id);
        }

        pool
    }

    /// The bare (subtype-free) type of a class.
    pub fn default_type(&mut self, cls: u16) -> TypeRef {
        if let Some(t) = self.defaults.get(&cls) {
            return t.clone();
        }

        let mut flags = TypeFlags::empty();
        if cls == ids::QUESTION {
            flags |= TypeFlags::IS_INCOMPLETE;
        } else if cls == ids::SCOOP {
            flags |= TypeFlags::HAS_SCOOP;
        }

        let t = Rc::new(Type { cls, generic_pos: 0, flags, subtypes: Vec::new() });
        self.defaults.insert(cls, t.clone());
        t
    }

    /// The interned generic at position 'pos' (A = 0, B = 1, ...).
    pub fn generic(&mut self, pos: u16) -> TypeRef {
        while self.generics.len() <= pos as usize {
            let next = self.generics.len() as u16;
            self.generics.push(Rc::new(Type {
                cls: ids::GENERIC,
                generic_pos: next,
                flags: TypeFlags::IS_UNRESOLVED,
                subtypes: Vec::new(),
            }));
        }
        self.generics[pos as usize].clone()
    }

    /// Build (or find) the type of 'cls' with the given subtypes. The
    /// bubble flags of the subtypes are folded in before the dedupe check.
    pub fn make(&mut self, flags: TypeFlags, cls: u16, subtypes: Vec<TypeRef>) -> TypeRef {
        if subtypes.is_empty() && flags.is_empty() {
            return self.default_type(cls);
        }

        // Bubble flags are always recomputed from the subtypes actually
        // given, so a resolved copy of an unresolved type interns clean.
        let mut all_flags = flags - BUBBLE_FLAGS;
        for sub in &subtypes {
            all_flags |= sub.flags & BUBBLE_FLAGS;
        }

        let entries = self.by_class.entry(cls).or_default();
        for existing in entries.iter() {
            if existing.flags == all_flags
                && existing.subtypes.len() == subtypes.len()
                && existing
                    .subtypes
                    .iter()
                    .zip(subtypes.iter())
                    .all(|(a, b)| Rc::ptr_eq(a, b))
            {
                return existing.clone();
            }
        }

        let t = Rc::new(Type { cls, generic_pos: 0, flags: all_flags, subtypes });
        entries.push(t.clone());
        t
    }

    pub fn question(&mut self) -> TypeRef {
        self.default_type(ids::QUESTION)
    }

    pub fn dynamic(&mut self) -> TypeRef {
        self.default_type(ids::DYNAMIC)
    }

    pub fn unit(&mut self) -> TypeRef {
        self.default_type(ids::UNIT)
    }

    pub fn integer(&mut self) -> TypeRef {
        self.default_type(ids::INTEGER)
    }

    pub fn double(&mut self) -> TypeRef {
        self.default_type(ids::DOUBLE)
    }

    pub fn string(&mut self) -> TypeRef {
        self.default_type(ids::STRING)
    }

    pub fn boolean(&mut self) -> TypeRef {
        self.default_type(ids::BOOLEAN)
    }

    pub fn list_of(&mut self, inner: TypeRef) -> TypeRef {
        self.make(TypeFlags::empty(), ids::LIST, vec![inner])
    }

    pub fn hash_of(&mut self, key: TypeRef, value: TypeRef) -> TypeRef {
        self.make(TypeFlags::empty(), ids::HASH, vec![key, value])
    }

    pub fn tuple_of(&mut self, inner: Vec<TypeRef>) -> TypeRef {
        self.make(TypeFlags::empty(), ids::TUPLE, inner)
    }

    pub fn optarg_of(&mut self, inner: TypeRef) -> TypeRef {
        self.make(TypeFlags::empty(), ids::OPTARG, vec![inner])
    }

    pub fn option_of(&mut self, inner: TypeRef) -> TypeRef {
        self.make(TypeFlags::empty(), ids::OPTION, vec![inner])
    }

    pub fn dynamic_value_type(&mut self) -> TypeRef {
        self.default_type(ids::DYNAMIC)
    }

    /// A function type. `ret` first, parameters after, matching the
    /// subtype layout used everywhere else.
    pub fn function(&mut self, flags: TypeFlags, ret: TypeRef, params: Vec<TypeRef>) -> TypeRef {
        let mut subtypes = Vec::with_capacity(params.len() + 1);
        subtypes.push(ret);
        subtypes.extend(params);
        self.make(flags, ids::FUNCTION, subtypes)
    }
}

impl Default for TypePool {
    fn default() -> Self {
        TypePool::new()
    }
}
