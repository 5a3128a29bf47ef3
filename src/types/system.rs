use crate::symtab::{ids, Symtab};
use crate::types::{type_eq, TypeFlags, TypePool, TypeRef};

// Matching behavior tweaks. The default is to solve generics against the
// right side.
const T_DONT_SOLVE: u8 = 0x1;
const T_COVARIANT: u8 = 0x2;
const T_CONTRAVARIANT: u8 = 0x4;
const T_UNIFY: u8 = 0x10;

/// Working state for type-directed emit operations: a stack of the current
/// generic bindings. Slot `pos + i` holds the binding of generic `i` for
/// the call being analyzed, or nothing if unbound. The ceiling is a
/// high-water mark preserved across nested inference frames.
pub struct TypeSystem {
    types: Vec<Option<TypeRef>>,
    pos: usize,
    ceiling: usize,
    max_seen: usize,
}

/// Saved position for a scoped solve (used when a generic function is
/// passed as an argument and its generics must not leak into the caller's
/// frame).
pub struct ScopeSave {
    pos: usize,
    ceiling: usize,
}

impl TypeSystem {
    pub fn new() -> Self {
        TypeSystem { types: Vec::new(), pos: 0, ceiling: 0, max_seen: 0 }
    }

    /// Record that a function with 'amount' generics was seen, so ceiling
    /// raises reserve enough slots.
    pub fn generics_seen(&mut self, amount: usize) {
        if amount > self.max_seen {
            self.max_seen = amount;
        }
    }

    /// Open a fresh inference frame above the current one. Returns the old
    /// ceiling for the matching lower call.
    pub fn raise_ceiling(&mut self) -> usize {
        let old_ceiling = self.ceiling;
        self.pos += self.ceiling;
        self.ceiling = self.max_seen;

        let need = self.pos + self.ceiling;
        if self.types.len() < need {
            self.types.resize(need, None);
        }

        for slot in self.types[self.pos..need].iter_mut() {
            *slot = None;
        }

        old_ceiling
    }

    pub fn lower_ceiling(&mut self, old_ceiling: usize) {
        self.pos -= old_ceiling;
        self.ceiling = old_ceiling;
    }

    pub fn scope_save(&mut self) -> ScopeSave {
        let save = ScopeSave { pos: self.pos, ceiling: self.ceiling };
        self.raise_ceiling();
        save
    }

    pub fn scope_restore(&mut self, save: ScopeSave) {
        self.pos = save.pos;
        self.ceiling = save.ceiling;
    }

    fn binding(&self, generic_pos: u16) -> Option<TypeRef> {
        self.types.get(self.pos + generic_pos as usize).cloned().flatten()
    }

    fn bind(&mut self, generic_pos: u16, ty: TypeRef) {
        let slot = self.pos + generic_pos as usize;
        if self.types.len() <= slot {
            self.types.resize(slot + 1, None);
        }
        self.types[slot] = Some(ty);
    }

    /// Structural match of 'right' against 'left', solving unbound generics
    /// on the left as they are seen.
    pub fn check(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
    ) -> bool {
        self.check_raw(pool, symtab, left, right, 0, &mut Vec::new())
    }

    /// The subtype relation: 'left' accepts 'right'. No solving.
    pub fn type_greater_eq(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
    ) -> bool {
        self.check_raw(pool, symtab, left, right, T_DONT_SOLVE | T_COVARIANT, &mut Vec::new())
    }

    /// Build the greatest lower bound of the two types, or None if they do
    /// not meet. The result is interned.
    pub fn unify(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
    ) -> Option<TypeRef> {
        let mut out = Vec::new();
        let ok = self.check_raw(
            pool,
            symtab,
            left,
            right,
            T_DONT_SOLVE | T_COVARIANT | T_UNIFY,
            &mut out,
        );

        if ok {
            out.pop()
        } else {
            None
        }
    }

    fn check_raw(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
        flags: u8,
        out: &mut Vec<TypeRef>,
    ) -> bool {
        if left.cls == ids::QUESTION {
            if flags & T_UNIFY != 0 {
                out.push(right.clone());
            }
            return true;
        }

        // The scoop catch-all a few builtins declare accepts any type.
        if left.cls == ids::SCOOP {
            if flags & T_UNIFY != 0 {
                out.push(right.clone());
            }
            return true;
        }

        if right.cls == ids::QUESTION {
            if flags & T_UNIFY != 0 {
                out.push(left.clone());
            }
            return true;
        }

        if left.cls == ids::GENERIC {
            return self.check_generic(pool, symtab, left, right, flags, out);
        }

        if left.cls == ids::FUNCTION && right.cls == ids::FUNCTION {
            return self.check_function(pool, symtab, left, right, flags, out);
        }

        self.check_misc(pool, symtab, left, right, flags, out)
    }

    fn check_generic(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
        flags: u8,
        out: &mut Vec<TypeRef>,
    ) -> bool {
        if flags & T_DONT_SOLVE != 0 {
            let ok = type_eq(left, right);
            if ok && flags & T_UNIFY != 0 {
                out.push(left.clone());
            }
            return ok;
        }

        match self.binding(left.generic_pos) {
            None => {
                self.bind(left.generic_pos, right.clone());
                true
            }
            Some(cmp) if cmp.cls == ids::QUESTION => {
                self.bind(left.generic_pos, right.clone());
                true
            }
            Some(cmp) if type_eq(&cmp, right) => true,
            Some(cmp) if cmp.flags.contains(TypeFlags::IS_INCOMPLETE) => {
                // A partial solution; see if the new type can merge in.
                match self.unify(pool, symtab, &cmp, right) {
                    Some(merged) => {
                        self.bind(left.generic_pos, merged);
                        true
                    }
                    None => false,
                }
            }
            Some(cmp) => {
                self.check_raw(pool, symtab, &cmp, right, flags | T_DONT_SOLVE, out)
            }
        }
    }

    fn check_function(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
        flags: u8,
        out: &mut Vec<TypeRef>,
    ) -> bool {
        let flags = flags & (T_DONT_SOLVE | T_UNIFY);
        let out_start = out.len();

        // Returns are covariant, and [0] always exists.
        if !self.check_raw(
            pool,
            symtab,
            &left.subtypes[0],
            &right.subtypes[0],
            flags | T_COVARIANT,
            out,
        ) {
            return false;
        }

        // Width compatibility: the right side may provide extra optargs.
        if left.subtypes.len() > right.subtypes.len() {
            return false;
        }

        for i in 1..left.subtypes.len() {
            let left_param = &left.subtypes[i];
            let mut right_param = right.subtypes[i].clone();

            // If the right parameter is optional but the left is not, peel
            // one level off the right.
            if right_param.cls == ids::OPTARG && left_param.cls != ids::OPTARG {
                right_param = right_param.subtypes[0].clone();
            }

            if !self.check_raw(pool, symtab, left_param, &right_param, flags | T_CONTRAVARIANT, out)
            {
                return false;
            }
        }

        if flags & T_UNIFY != 0 {
            self.simple_unify(pool, left, right, left.subtypes.len(), out_start, out);
        }

        true
    }

    fn check_misc(
        &mut self,
        pool: &mut TypePool,
        symtab: &Symtab,
        left: &TypeRef,
        right: &TypeRef,
        flags: u8,
        out: &mut Vec<TypeRef>,
    ) -> bool {
        let out_start = out.len();

        let class_ok = if flags & T_COVARIANT != 0 {
            symtab.class_greater_eq(left.cls, right.cls)
        } else if flags & T_CONTRAVARIANT != 0 {
            // Contravariance is covariance with the sides swapped.
            symtab.class_greater_eq(right.cls, left.cls)
        } else {
            left.cls == right.cls
        };

        if !class_ok {
            return false;
        }

        // The caller's variance extends up to this class, not into it.
        // Subtypes match invariantly (except functions, handled above).
        let inner_flags = flags & (T_DONT_SOLVE | T_UNIFY);
        let num_subtypes = left.subtypes.len();

        if num_subtypes != 0 {
            if num_subtypes != right.subtypes.len() {
                return false;
            }

            for (l, r) in left.subtypes.iter().zip(right.subtypes.iter()) {
                if !self.check_raw(pool, symtab, &l.clone(), &r.clone(), inner_flags, out) {
                    return false;
                }
            }
        }

        if flags & T_UNIFY != 0 {
            self.simple_unify(pool, left, right, num_subtypes, out_start, out);
        }

        true
    }

    /// Fold the collected subtype results into one unified type. The class
    /// chosen is the less derived of the two sides.
    fn simple_unify(
        &mut self,
        pool: &mut TypePool,
        left: &TypeRef,
        right: &TypeRef,
        num_subtypes: usize,
        out_start: usize,
        out: &mut Vec<TypeRef>,
    ) {
        let cls = if left.cls < right.cls { left.cls } else { right.cls };

        if num_subtypes != 0 {
            let flags = left.flags & right.flags & TypeFlags::IS_VARARGS;
            let subtypes = out.split_off(out_start);
            let result = pool.make(flags, cls, subtypes);
            out.push(result);
        } else {
            let result = pool.default_type(cls);
            out.push(result);
        }
    }

    /// Substitute the working stack's bindings into 'ty'. Generics that
    /// were never filled default to Dynamic, and the default is written
    /// back so a repeated resolve gives the same answer.
    pub fn resolve(&mut self, pool: &mut TypePool, ty: &TypeRef) -> TypeRef {
        let dynamic = pool.dynamic();
        self.resolve_with(pool, ty, &dynamic)
    }

    pub fn resolve_with(&mut self, pool: &mut TypePool, ty: &TypeRef, fallback: &TypeRef) -> TypeRef {
        if !ty.subtypes.is_empty() {
            let subtypes = ty
                .subtypes
                .iter()
                .map(|sub| self.resolve_with(pool, &sub.clone(), fallback))
                .collect();
            return pool.make(ty.flags, ty.cls, subtypes);
        }

        if ty.cls == ids::GENERIC {
            return match self.binding(ty.generic_pos) {
                Some(t) if t.cls != ids::QUESTION => t,
                _ => {
                    self.bind(ty.generic_pos, fallback.clone());
                    fallback.clone()
                }
            };
        }

        ty.clone()
    }

    /// Resolve 'second' using the subtypes of 'first' as the generic
    /// bindings. Used to solve property types against a known self type.
    pub fn resolve_by_second(
        &mut self,
        pool: &mut TypePool,
        first: &TypeRef,
        second: &TypeRef,
    ) -> TypeRef {
        let save_pos = self.pos;
        let stack_start = self.pos + self.ceiling + 1;

        let need = stack_start + first.subtypes.len();
        if self.types.len() < need {
            self.types.resize(need, None);
        }

        for (i, sub) in first.subtypes.iter().enumerate() {
            self.types[stack_start + i] = Some(sub.clone());
        }

        self.pos = stack_start;
        let result = self.resolve(pool, second);
        self.pos = save_pos;

        result
    }

}

impl Default for TypeSystem {
    fn default() -> Self {
        TypeSystem::new()
    }
}
