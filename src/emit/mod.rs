pub mod closure;
pub mod expr;

use std::rc::Rc;

use crate::code::{CodeBuffer, Opcode};
use crate::symtab::{ids, Symtab, Var, VarId, VarKind};
use crate::types::{TypeFlags, TypePool, TypeRef, TypeSystem};
use crate::value::{FunctionVal, Value};
use crate::vm::{LilyError, LilyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Main,
    If,
    IfElse,
    While,
    DoWhile,
    ForIn,
    Try,
    TryExcept,
    TryExceptAll,
    Match,
    Define,
    Lambda,
    ClassCtor,
}

impl BlockKind {
    fn is_function(self) -> bool {
        matches!(
            self,
            BlockKind::Main | BlockKind::Define | BlockKind::Lambda | BlockKind::ClassCtor
        )
    }

    fn is_loop(self) -> bool {
        matches!(self, BlockKind::While | BlockKind::DoWhile | BlockKind::ForIn)
    }
}

/// One storage: a register the emitter can hand out for an expression
/// result. Storages are reused across expressions, never within one.
#[derive(Debug, Clone)]
struct Storage {
    ty: TypeRef,
    reg: u16,
    expr_num: u32,
}

/// Extra state carried by blocks that have a function made on their
/// behalf (__main__, define, lambda, class constructor).
struct FuncBlock {
    var: VarId,
    ro_spot: u16,
    next_reg_spot: u16,
    storage_start: usize,
    make_closure: bool,
    ret_type: TypeRef,
    self_reg: Option<u16>,
    class_id: Option<u16>,
    param_count: u16,
    /// Jump table slots of the optarg dispatch header, if any.
    optarg_jumps: Vec<u16>,
    next_optarg: usize,
    /// Lazily made register that is never written, used to pad keyword
    /// call holes with an unset value.
    unset_reg: Option<u16>,
    prev_function: usize,
}

struct Block {
    kind: BlockKind,
    patch_start: u16,
    code_start: u16,
    last_exit: i32,
    always_exits: bool,
    match_case_start: usize,
    match_reg: u16,
    match_enum: u16,
    match_jump_pos: u16,
    match_open_case: bool,
    func: Option<FuncBlock>,
}

impl Block {
    fn new(kind: BlockKind, patch_start: u16, code_start: u16) -> Block {
        Block {
            kind,
            patch_start,
            code_start,
            last_exit: -1,
            always_exits: true,
            match_case_start: 0,
            match_reg: 0,
            match_enum: 0,
            match_jump_pos: 0,
            match_open_case: false,
            func: None,
        }
    }
}

/// A declared function's shape, handed over by the front end.
pub struct DefineSpec {
    pub name: String,
    /// Parameter name and type pairs. Optional parameters carry the optarg
    /// wrapper type.
    pub params: Vec<(String, TypeRef)>,
    pub ret: TypeRef,
    pub flags: TypeFlags,
    pub generic_count: u16,
    pub class_id: Option<u16>,
}

/// The emitter: converts typed expression trees and block structure into
/// the VM's instruction stream. Owns the symbol table, type pool, and type
/// system while a program is being built.
pub struct Emitter {
    pub code: CodeBuffer,
    pub(crate) patches: CodeBuffer,
    pub(crate) closure_aux: CodeBuffer,
    /// (register, function depth) pairs of everything closed over, in
    /// insertion order. The pair index is the closure spot.
    pub(crate) closure_spots: Vec<(u16, u16)>,
    pub(crate) transform_table: Vec<u16>,
    blocks: Vec<Block>,
    storages: Vec<Storage>,
    match_cases: Vec<u16>,
    pub symtab: Symtab,
    pub ts: TypeSystem,
    pub pool: TypePool,
    pub(crate) function_depth: u16,
    class_block_depth: u16,
    pub line: u16,
    pub(crate) expr_num: u32,
    module_path: String,
}

impl Emitter {
    pub fn new(module_path: &str) -> Self {
        let mut symtab = Symtab::new();
        let pool = TypePool::new();

        let main_spot = symtab.reserve_function_spot();
        let main_var = symtab.add_var(Var {
            name: "__main__".to_string(),
            ty: pool_placeholder(),
            kind: VarKind::ReadonlyFunc { spot: main_spot, foreign: false },
            needs_closure: false,
        });

        let mut main_block = Block::new(BlockKind::Main, 0, 0);
        main_block.func = Some(FuncBlock {
            var: main_var,
            ro_spot: main_spot,
            next_reg_spot: 0,
            storage_start: 0,
            make_closure: false,
            ret_type: pool_placeholder(),
            self_reg: None,
            class_id: None,
            param_count: 0,
            optarg_jumps: Vec::new(),
            next_optarg: 0,
            unset_reg: None,
            prev_function: 0,
        });

        let mut emitter = Emitter {
            code: CodeBuffer::new(),
            patches: CodeBuffer::new(),
            closure_aux: CodeBuffer::new(),
            closure_spots: Vec::new(),
            transform_table: Vec::new(),
            blocks: vec![main_block],
            storages: Vec::new(),
            match_cases: Vec::new(),
            symtab,
            ts: TypeSystem::new(),
            pool,
            function_depth: 1,
            class_block_depth: 0,
            line: 1,
            expr_num: 0,
            module_path: module_path.to_string(),
        };

        let unit = emitter.pool.unit();
        emitter.function_block_mut().ret_type = unit;

        // Some carries one value of the enum's generic.
        let some_arg = emitter.pool.generic(0);
        emitter.symtab.classes[ids::SOME as usize].variant_args = vec![some_arg];
        emitter.symtab.classes[ids::OPTION as usize].generic_count = 1;

        // Exception's two properties: the message, then the traceback as
        // List[Tuple[String, String, Integer]].
        let string = emitter.pool.string();
        let integer = emitter.pool.integer();
        let trace_tuple =
            emitter.pool.tuple_of(vec![string.clone(), string.clone(), integer]);
        let traceback = emitter.pool.list_of(trace_tuple);

        emitter.symtab.classes[ids::EXCEPTION as usize].properties = vec![
            crate::symtab::Property { name: "message".to_string(), ty: string, index: 0 },
            crate::symtab::Property {
                name: "traceback".to_string(),
                ty: traceback,
                index: 1,
            },
        ];

        emitter
    }

    /// Declare a user enum. Each variant is a name plus its argument
    /// types (possibly generic); an empty argument list makes an empty
    /// variant with one canonical value.
    pub fn declare_enum(
        &mut self,
        name: &str,
        generic_count: u16,
        variants: Vec<(String, Vec<TypeRef>)>,
    ) -> u16 {
        use crate::symtab::{Class, ClassFlags};

        let enum_id = self.symtab.classes.len() as u16;
        self.symtab.classes.push(Class {
            id: enum_id,
            name: name.to_string(),
            flags: ClassFlags::IS_ENUM | ClassFlags::GC_SPECULATIVE,
            parent: None,
            generic_count,
            properties: Vec::new(),
            variants: Vec::new(),
            variant_id: 0,
            variant_args: Vec::new(),
            module: 0,
        });

        let mut variant_ids = Vec::new();
        for (i, (variant_name, args)) in variants.into_iter().enumerate() {
            let id = self.symtab.classes.len() as u16;
            let mut flags = ClassFlags::IS_VARIANT;
            if args.is_empty() {
                flags |= ClassFlags::EMPTY_VARIANT;
            } else {
                flags |= ClassFlags::GC_SPECULATIVE;
            }

            self.symtab.classes.push(Class {
                id,
                name: variant_name,
                flags,
                parent: Some(enum_id),
                generic_count: 0,
                properties: Vec::new(),
                variants: Vec::new(),
                variant_id: i as u16,
                variant_args: args,
                module: 0,
            });
            variant_ids.push(id);
        }

        self.symtab.classes[enum_id as usize].variants = variant_ids;
        enum_id
    }

    pub(crate) fn error(&self, message: impl Into<String>) -> LilyError {
        LilyError::Syntax { message: message.into(), line: self.line }
    }

    fn block(&self) -> &Block {
        self.blocks.last().unwrap()
    }

    fn block_mut(&mut self) -> &mut Block {
        self.blocks.last_mut().unwrap()
    }

    fn function_block_index(&self) -> usize {
        self.blocks.iter().rposition(|b| b.kind.is_function()).unwrap()
    }

    fn function_block(&self) -> &FuncBlock {
        let i = self.function_block_index();
        self.blocks[i].func.as_ref().unwrap()
    }

    fn function_block_mut(&mut self) -> &mut FuncBlock {
        let i = self.function_block_index();
        self.blocks[i].func.as_mut().unwrap()
    }

    pub(crate) fn mark_make_closure(&mut self) {
        self.function_block_mut().make_closure = true;
    }

    pub(crate) fn class_block_depth(&self) -> u16 {
        self.class_block_depth
    }

    pub(crate) fn current_param_count(&self) -> u16 {
        self.function_block().param_count
    }

    pub(crate) fn function_class_id(&self) -> Option<u16> {
        self.function_block().class_id
    }

    pub(crate) fn block_kind_of_function(&self) -> BlockKind {
        self.blocks[self.function_block_index()].kind
    }

    pub(crate) fn prev_function_kind(&self) -> BlockKind {
        let prev = self.function_block().prev_function;
        self.blocks[prev].kind
    }

    /// Whether the enclosing function is the one that owns the backing
    /// closure: the nearest outer function is __main__ or a class
    /// constructor, making this function the closure's root.
    pub(crate) fn prev_function_is_backing(&self) -> bool {
        matches!(self.prev_function_kind(), BlockKind::Main | BlockKind::ClassCtor)
    }

    pub(crate) fn next_reg_spot(&self) -> u16 {
        self.function_block().next_reg_spot
    }

    pub(crate) fn self_reg(&self) -> Option<u16> {
        self.function_block().self_reg
    }

    pub(crate) fn alloc_reg(&mut self) -> u16 {
        let fb = self.function_block_mut();
        let reg = fb.next_reg_spot;
        fb.next_reg_spot += 1;
        reg
    }

    /// Get a register to hold a result of 'ty'. Storages are shared across
    /// expressions but never reused within one.
    pub(crate) fn get_storage(&mut self, ty: &TypeRef) -> u16 {
        let start = self.function_block().storage_start;
        let expr_num = self.expr_num;

        for storage in self.storages[start..].iter_mut() {
            if Rc::ptr_eq(&storage.ty, ty) && storage.expr_num != expr_num {
                storage.expr_num = expr_num;
                return storage.reg;
            }
        }

        let reg = self.alloc_reg();
        self.storages.push(Storage { ty: ty.clone(), reg, expr_num });
        reg
    }

    pub(crate) fn unset_reg(&mut self) -> u16 {
        if let Some(reg) = self.function_block().unset_reg {
            return reg;
        }
        let reg = self.alloc_reg();
        self.function_block_mut().unset_reg = Some(reg);
        reg
    }

    /* ---------------- vars ---------------- */

    /// Declare a var in the current scope. Vars in __main__ are globals.
    pub fn declare_var(&mut self, name: &str, ty: TypeRef) -> VarId {
        let depth = self.function_depth;
        let reg = self.alloc_reg();

        let kind = if self.function_block_index() == 0 {
            VarKind::Global { spot: reg }
        } else {
            VarKind::Local { reg, depth }
        };

        self.symtab.add_var(Var {
            name: name.to_string(),
            ty,
            kind,
            needs_closure: false,
        })
    }

    /// Declare a var and assign the given expression to it, the way
    /// `var x = expr` lowers.
    pub fn declare_var_assigned(
        &mut self,
        name: &str,
        ty: TypeRef,
        init: &crate::expr::Ast,
    ) -> LilyResult<VarId> {
        let var = self.declare_var(name, ty.clone());
        self.expr_num += 1;

        let out = self.eval_tree(init, Some(&ty))?;
        if !self.ts.type_greater_eq(&mut self.pool, &self.symtab, &ty, &out.ty) {
            return Err(self.error(format!(
                "Cannot assign type '{}' to type '{}'.",
                self.type_name(&out.ty),
                self.type_name(&ty)
            )));
        }

        match self.symtab.var(var).kind.clone() {
            VarKind::Global { spot } => {
                self.code.write_4(Opcode::GlobalSet.into(), spot, out.reg, self.line);
            }
            VarKind::Local { reg, .. } => {
                self.code.write_4(Opcode::Assign.into(), out.reg, reg, self.line);
            }
            VarKind::ReadonlyFunc { .. } => unreachable!(),
        }

        Ok(var)
    }

    /// The global register spot of a main-level var, for embedders that
    /// read results back after a run.
    pub fn global_spot(&self, var: VarId) -> Option<u16> {
        match self.symtab.var(var).kind {
            VarKind::Global { spot } => Some(spot),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self, ty: &TypeRef) -> String {
        let mut out = self.symtab.class_name(ty.cls).to_string();
        if !ty.subtypes.is_empty() {
            let inner: Vec<String> =
                ty.subtypes.iter().map(|t| self.type_name(t)).collect();
            out.push_str(&format!("[{}]", inner.join(", ")));
        }
        out
    }

    /* ---------------- patches and jumps ---------------- */

    /// Write a forward jump word as a placeholder and remember its slot.
    pub(crate) fn write_patch_slot(&mut self) {
        self.code.write(0);
        let slot = self.code.pos() - 1;
        self.patches.write(slot);
    }

    /// Patch a single recorded slot so it lands on the current position.
    /// Jump operands are distances relative to the operand's own word.
    pub(crate) fn patch_here(&mut self, slot: u16) {
        if slot != 0 {
            let target = self.code.pos();
            self.code.set_at(slot, target.wrapping_sub(slot));
        }
    }

    /// Rewrite every patch recorded since 'to' to point at the current
    /// position. A stored 0 means the patch was optimized out.
    fn write_patches_since(&mut self, to: u16) {
        while self.patches.pos() > to {
            let patch = self.patches.pop();
            self.patch_here(patch);
        }
    }

    fn inject_patch_into_block(&mut self, block_index: usize, patch: u16) {
        if block_index + 1 == self.blocks.len() {
            self.patches.write(patch);
        } else {
            let at = self.blocks[block_index + 1].patch_start;
            self.patches.inject(at, patch);
            for block in self.blocks[block_index + 1..].iter_mut() {
                block.patch_start += 1;
            }
        }
    }

    /// Write the conditional jump after a condition: jump when the tested
    /// register's truth equals 'jump_on'.
    pub(crate) fn emit_jump_if(&mut self, jump_on: u16, reg: u16) {
        self.code.write_3(Opcode::JumpIf.into(), jump_on, reg);
        self.write_patch_slot();
    }

    fn find_deepest_loop(&self) -> Option<usize> {
        for (i, block) in self.blocks.iter().enumerate().rev() {
            if block.kind.is_loop() {
                return Some(i);
            }
            if block.kind.is_function() {
                return None;
            }
        }
        None
    }

    /// Write one catch_pop for every try block between here and
    /// 'stop_index', so early exits cannot skip exception-state unwinding.
    fn write_pop_try_blocks_up_to(&mut self, stop_index: usize) {
        let count = self.blocks[stop_index + 1..]
            .iter()
            .filter(|b| {
                matches!(b.kind, BlockKind::Try | BlockKind::TryExcept | BlockKind::TryExceptAll)
            })
            .count();

        for _ in 0..count {
            self.code.write(Opcode::CatchPop.into());
        }
    }

    /* ---------------- simple blocks ---------------- */

    fn enter_block(&mut self, kind: BlockKind) {
        let block = Block::new(kind, self.patches.pos(), self.code.pos());
        self.blocks.push(block);
    }

    pub fn begin_if(&mut self, condition: &crate::expr::Ast) -> LilyResult<()> {
        self.enter_block(BlockKind::If);
        let reg = self.eval_condition(condition)?;
        self.emit_jump_if(0, reg);
        Ok(())
    }

    /// Move to the next branch of an if (elif when a condition follows,
    /// else otherwise).
    pub fn branch_if(&mut self, condition: Option<&crate::expr::Ast>) -> LilyResult<()> {
        {
            let pos = self.code.pos() as i32;
            let block = self.block_mut();
            if block.last_exit != pos {
                block.always_exits = false;
            }
            if condition.is_none() {
                block.kind = BlockKind::IfElse;
            }
        }

        // The last branch's condition jump comes here; the branch body
        // exits forward to the block end.
        let cond_patch = self.patches.pop();
        self.code.write(Opcode::Jump.into());
        self.write_patch_slot();
        self.patch_here(cond_patch);

        if let Some(cond) = condition {
            let reg = self.eval_condition(cond)?;
            self.emit_jump_if(0, reg);
        }

        Ok(())
    }

    pub fn begin_while(&mut self, condition: &crate::expr::Ast) -> LilyResult<()> {
        self.enter_block(BlockKind::While);
        let reg = self.eval_condition(condition)?;
        self.emit_jump_if(0, reg);
        Ok(())
    }

    pub fn begin_do_while(&mut self) {
        self.enter_block(BlockKind::DoWhile);
    }

    /// Close a do-while with its trailing condition: jump back while true.
    pub fn end_do_while(&mut self, condition: &crate::expr::Ast) -> LilyResult<()> {
        let reg = self.eval_condition(condition)?;
        let code_start = self.block().code_start;
        self.code.write_3(Opcode::JumpIf.into(), 1, reg);
        let slot = self.code.pos();
        self.code.write(code_start.wrapping_sub(slot));
        self.leave_block()
    }

    pub fn emit_break(&mut self) -> LilyResult<()> {
        let loop_index = self
            .find_deepest_loop()
            .ok_or_else(|| self.error("'break' used outside of a loop."))?;

        self.write_pop_try_blocks_up_to(loop_index);

        self.code.write_2(Opcode::Jump.into(), 0);
        let patch = self.code.pos() - 1;
        self.inject_patch_into_block(loop_index, patch);
        Ok(())
    }

    pub fn emit_continue(&mut self) -> LilyResult<()> {
        let loop_index = self
            .find_deepest_loop()
            .ok_or_else(|| self.error("'continue' used outside of a loop."))?;

        self.write_pop_try_blocks_up_to(loop_index);

        let target = self.blocks[loop_index].code_start;
        self.code.write(Opcode::Jump.into());
        let slot = self.code.pos();
        self.code.write(target.wrapping_sub(slot));
        Ok(())
    }

    /// Integer for loop: evaluates the range, writes setup and the step
    /// opcode, and leaves the block open for the body.
    pub fn begin_for_in(
        &mut self,
        loop_var: VarId,
        start: &crate::expr::Ast,
        stop: &crate::expr::Ast,
        step: Option<&crate::expr::Ast>,
    ) -> LilyResult<()> {
        let integer = self.pool.integer();
        self.expr_num += 1;

        let start_out = self.eval_tree(start, Some(&integer))?;
        let stop_out = self.eval_tree(stop, Some(&integer))?;

        for out in [&start_out, &stop_out] {
            if out.ty.cls != ids::INTEGER {
                return Err(self.error("for loop bounds must be Integer."));
            }
        }

        // The loop counter registers live past this statement, so they are
        // plain registers rather than storages.
        let counter_reg = self.alloc_reg();
        let stop_reg = self.alloc_reg();
        let step_reg = self.alloc_reg();

        self.code.write_4(Opcode::Assign.into(), start_out.reg, counter_reg, self.line);
        self.code.write_4(Opcode::Assign.into(), stop_out.reg, stop_reg, self.line);

        let derive_step = match step {
            Some(step_ast) => {
                let step_out = self.eval_tree(step_ast, Some(&integer))?;
                if step_out.ty.cls != ids::INTEGER {
                    return Err(self.error("for loop step must be Integer."));
                }
                self.code.write_4(Opcode::Assign.into(), step_out.reg, step_reg, self.line);
                0
            }
            None => 1,
        };

        // o_for_integer expects a local target. A global loop var gets a
        // local stand-in, synced before and after the step.
        let (target_reg, sync_spot) = match self.symtab.var(loop_var).kind {
            VarKind::Global { spot } => (self.alloc_reg(), Some(spot)),
            VarKind::Local { reg, .. } => (reg, None),
            VarKind::ReadonlyFunc { .. } => {
                return Err(self.error("for loop var cannot be a function."))
            }
        };

        self.code.write_6(
            Opcode::ForSetup.into(),
            derive_step,
            counter_reg,
            stop_reg,
            step_reg,
            target_reg,
        );
        self.code.write(self.line);

        if let Some(spot) = sync_spot {
            self.code.write_4(Opcode::GlobalSet.into(), spot, target_reg, self.line);
        }

        self.enter_block(BlockKind::ForIn);
        // The loop re-enters at the step opcode, not the setup.
        self.block_mut().code_start = self.code.pos();

        self.code.write_5(
            Opcode::ForInteger.into(),
            counter_reg,
            stop_reg,
            step_reg,
            target_reg,
        );
        self.write_patch_slot();
        self.code.write(self.line);

        if let Some(spot) = sync_spot {
            self.code.write_4(Opcode::GlobalSet.into(), spot, target_reg, self.line);
        }

        Ok(())
    }

    /* ---------------- try / except / raise ---------------- */

    pub fn begin_try(&mut self) {
        self.enter_block(BlockKind::Try);
        self.code.write(Opcode::CatchPush.into());
        self.write_patch_slot();
        self.code.write(self.line);
    }

    /// Start an except branch. 'class_id' must be Exception or one of its
    /// subclasses. When a var is given, the caught exception instance is
    /// stored into it.
    pub fn begin_except(&mut self, class_id: u16, store: Option<VarId>) -> LilyResult<()> {
        if !self.symtab.class_greater_eq(ids::EXCEPTION, class_id) {
            return Err(self.error(format!(
                "'{}' is not a valid exception class.",
                self.symtab.class_name(class_id)
            )));
        }

        let first = self.block().kind == BlockKind::Try;
        {
            let pos = self.code.pos() as i32;
            let block = self.block_mut();
            if block.last_exit != pos {
                block.always_exits = false;
            }
            block.kind = if class_id == ids::EXCEPTION {
                BlockKind::TryExceptAll
            } else {
                BlockKind::TryExcept
            };
        }

        if first {
            // The try body completed: drop the catch entry, then skip the
            // except chain.
            self.code.write(Opcode::CatchPop.into());
        }
        self.code.write(Opcode::Jump.into());
        self.write_patch_slot();

        // Route the previous branch's pending jump (catch_push header or
        // the prior except's next-branch slot) to this branch.
        let pending = self.patches.pos() - 2;
        let prev_patch = self.patches.get(pending);
        // Remove it from the stack while keeping the body exit on top.
        let exit_patch = self.patches.pop();
        self.patches.pop();
        self.patches.write(exit_patch);
        self.patch_here(prev_patch);

        self.code.write_2(Opcode::ExceptionCatch.into(), class_id);
        self.write_patch_slot();
        self.code.write(self.line);

        if let Some(var) = store {
            let reg = self
                .frame_reg_of(var)
                .ok_or_else(|| self.error("exception storage must be a var."))?;
            self.code.write_3(Opcode::ExceptionStore.into(), reg, self.line);
        }

        Ok(())
    }

    /// The register a var occupies within the current frame. Globals count
    /// in __main__, where the frame window is the global window.
    fn frame_reg_of(&self, var: VarId) -> Option<u16> {
        match self.symtab.var(var).kind {
            VarKind::Local { reg, depth } if depth == self.function_depth => Some(reg),
            VarKind::Global { spot } if self.function_block_index() == 0 => Some(spot),
            _ => None,
        }
    }

    pub fn emit_raise(&mut self, value: &crate::expr::Ast) -> LilyResult<()> {
        self.expr_num += 1;
        let out = self.eval_tree(value, None)?;

        if !self.symtab.class_greater_eq(ids::EXCEPTION, out.ty.cls) {
            return Err(self.error("'raise' expression is not an exception."));
        }

        self.code.write_3(Opcode::ExceptionRaise.into(), out.reg, self.line);
        let pos = self.code.pos() as i32;
        self.block_mut().last_exit = pos;
        Ok(())
    }

    /* ---------------- match ---------------- */

    /// Evaluate the match source and write the dispatch skeleton. The
    /// jump table is filled in as cases arrive.
    pub fn begin_match(&mut self, source: &crate::expr::Ast) -> LilyResult<()> {
        self.expr_num += 1;
        let out = self.eval_tree(source, None)?;

        let cls = self.symtab.class(out.ty.cls).clone();
        if !cls.flags.contains(crate::symtab::ClassFlags::IS_ENUM) {
            return Err(self.error("Match expression is not an enum."));
        }

        let count = cls.variants.len() as u16;
        self.enter_block(BlockKind::Match);

        self.code.write_4(Opcode::MatchDispatch.into(), out.reg, cls.id, count);
        let jump_pos = self.code.pos();
        for _ in 0..count {
            self.code.write(0);
        }
        self.code.write(self.line);

        let case_start = self.match_cases.len();
        let block = self.block_mut();
        block.match_reg = out.reg;
        block.match_enum = cls.id;
        block.match_jump_pos = jump_pos;
        block.match_case_start = case_start;
        Ok(())
    }

    /// Start one case of the match. Decomposed fields land in the given
    /// vars, in variant declaration order.
    pub fn match_case(&mut self, variant_class: u16, decompose: &[VarId]) -> LilyResult<()> {
        let cls = self.symtab.class(variant_class).clone();
        let case_start = self.block().match_case_start;

        if self.match_cases[case_start..].contains(&variant_class) {
            return Err(self.error(format!("Already have a case for variant {}.", cls.name)));
        }

        if cls.parent != Some(self.block().match_enum) {
            return Err(self.error(format!(
                "Variant {} does not belong to the matched enum.",
                cls.name
            )));
        }

        // Close the previous case with an exit jump.
        if self.block().match_open_case {
            let pos = self.code.pos() as i32;
            if self.block().last_exit != pos {
                self.block_mut().always_exits = false;
            }
            self.code.write(Opcode::Jump.into());
            self.write_patch_slot();
        }

        self.match_cases.push(variant_class);

        // Point the dispatch jump for this variant here.
        let slot = self.block().match_jump_pos + cls.variant_id;
        let target = self.code.pos();
        self.code.set_at(slot, target.wrapping_sub(slot));
        self.block_mut().match_open_case = true;

        if !decompose.is_empty() {
            let match_reg = self.block().match_reg;
            self.code.write_3(
                Opcode::VariantDecompose.into(),
                match_reg,
                decompose.len() as u16,
            );
            for var in decompose {
                let reg = self
                    .frame_reg_of(*var)
                    .ok_or_else(|| self.error("match decomposition target must be a var."))?;
                self.code.write(reg);
            }
            self.code.write(self.line);
        }

        Ok(())
    }

    fn check_match_exhaustive(&self) -> LilyResult<()> {
        let block = self.block();
        let seen = &self.match_cases[block.match_case_start..];
        let cls = self.symtab.class(block.match_enum);

        for variant in &cls.variants {
            if !seen.contains(variant) {
                return Err(self.error(format!(
                    "Match is not exhaustive: variant {} is missing.",
                    self.symtab.class_name(*variant)
                )));
            }
        }
        Ok(())
    }

    /* ---------------- leaving blocks ---------------- */

    pub fn leave_block(&mut self) -> LilyResult<()> {
        if self.blocks.len() == 1 {
            return Err(self.error("'}' outside of a block."));
        }

        let kind = self.block().kind;

        match kind {
            BlockKind::While | BlockKind::ForIn => {
                let target = self.block().code_start;
                self.code.write(Opcode::Jump.into());
                let slot = self.code.pos();
                self.code.write(target.wrapping_sub(slot));
            }
            BlockKind::Match => {
                self.check_match_exhaustive()?;
                self.match_cases.truncate(self.block().match_case_start);
            }
            BlockKind::Try | BlockKind::TryExcept | BlockKind::TryExceptAll => {
                // The last except branch's next-jump stays 0 to tell the
                // unwinder the chain is done.
                let patch = self.patches.pop();
                if patch != 0 {
                    self.code.set_at(patch, 0);
                }
            }
            _ => {}
        }

        // A block whose every branch exited lets the parent know.
        let pos = self.code.pos() as i32;
        let block = self.blocks.last().unwrap();
        let all_exits = matches!(
            kind,
            BlockKind::IfElse | BlockKind::Match | BlockKind::TryExceptAll
        ) && block.always_exits
            && block.last_exit == pos;

        let patch_start = block.patch_start;
        self.write_patches_since(patch_start);
        self.blocks.pop();

        if all_exits {
            self.block_mut().last_exit = pos;
        }

        Ok(())
    }

    /* ---------------- defines, lambdas, classes ---------------- */

    /// Enter a function definition. Parameters become the first locals.
    /// Returns the var for the function itself.
    pub fn begin_define(&mut self, spec: DefineSpec) -> LilyResult<VarId> {
        let param_types: Vec<TypeRef> = spec.params.iter().map(|(_, t)| t.clone()).collect();
        let func_type = self.pool.function(spec.flags, spec.ret.clone(), param_types);

        // A define inside another function must be reached through
        // closure_function so it sees fresh cells on every call.
        let nested = self.function_block_index() != 0;

        let ro_spot = self.symtab.reserve_function_spot();
        let var = self.symtab.add_var(Var {
            name: spec.name.clone(),
            ty: func_type,
            kind: VarKind::ReadonlyFunc { spot: ro_spot, foreign: false },
            needs_closure: nested,
        });

        self.ts.generics_seen(spec.generic_count as usize);
        self.enter_call_block(BlockKind::Define, var, ro_spot, &spec)?;
        Ok(var)
    }

    /// Enter a lambda. Identical to a define except for naming and that it
    /// is always nested.
    pub fn begin_lambda(&mut self, params: Vec<(String, TypeRef)>, ret: TypeRef) -> LilyResult<VarId> {
        let spec = DefineSpec {
            name: "(lambda)".to_string(),
            params,
            ret,
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: None,
        };

        let param_types: Vec<TypeRef> = spec.params.iter().map(|(_, t)| t.clone()).collect();
        let func_type = self.pool.function(TypeFlags::empty(), spec.ret.clone(), param_types);

        let ro_spot = self.symtab.reserve_function_spot();
        let var = self.symtab.add_var(Var {
            name: spec.name.clone(),
            ty: func_type,
            kind: VarKind::ReadonlyFunc { spot: ro_spot, foreign: false },
            needs_closure: self.function_block_index() != 0,
        });

        self.enter_call_block(BlockKind::Lambda, var, ro_spot, &spec)?;
        Ok(var)
    }

    fn enter_call_block(
        &mut self,
        kind: BlockKind,
        var: VarId,
        ro_spot: u16,
        spec: &DefineSpec,
    ) -> LilyResult<()> {
        self.function_depth += 1;
        let prev_function = self.function_block_index();
        let storage_start = self.storages.len();

        let mut block = Block::new(kind, self.patches.pos(), self.code.pos());
        block.func = Some(FuncBlock {
            var,
            ro_spot,
            next_reg_spot: 0,
            storage_start,
            make_closure: false,
            ret_type: spec.ret.clone(),
            self_reg: None,
            class_id: spec.class_id,
            param_count: spec.params.len() as u16,
            optarg_jumps: Vec::new(),
            next_optarg: 0,
            unset_reg: None,
            prev_function,
        });
        self.blocks.push(block);

        let depth = self.function_depth;
        for (name, ty) in &spec.params {
            let reg = self.alloc_reg();
            self.symtab.add_var(Var {
                name: name.clone(),
                ty: ty.clone(),
                kind: VarKind::Local { reg, depth },
                needs_closure: false,
            });
        }

        if spec.flags.contains(TypeFlags::HAS_OPTARGS) {
            self.write_optarg_header(spec)?;
        }

        Ok(())
    }

    /// The optarg header: a jump table keyed on how many of the optional
    /// parameter registers were actually set by the caller. Target i
    /// starts the default-initialization code of optarg i; the last target
    /// skips all of it.
    fn write_optarg_header(&mut self, spec: &DefineSpec) -> LilyResult<()> {
        let first_optarg = spec
            .params
            .iter()
            .position(|(_, t)| t.cls == ids::OPTARG)
            .ok_or_else(|| self.error("function flagged with optargs has none."))?;

        let optarg_count = spec.params.len() - first_optarg;

        self.code.write_3(
            Opcode::OptargDispatch.into(),
            first_optarg as u16,
            (optarg_count + 1) as u16,
        );

        let mut jumps = Vec::with_capacity(optarg_count + 1);
        for _ in 0..=optarg_count {
            jumps.push(self.code.pos());
            self.code.write(0);
        }

        self.function_block_mut().optarg_jumps = jumps;
        Ok(())
    }

    /// Emit the default-initialization of the next optional parameter.
    /// Must be called once per optarg, in order. Each init is guarded with
    /// jump_if_set so a keyword call that skipped an earlier optarg does
    /// not cascade over values it did provide.
    pub fn eval_optarg(&mut self, param_reg: u16, default: &crate::expr::Ast) -> LilyResult<()> {
        let (slot, is_last) = {
            let fb = self.function_block();
            let i = fb.next_optarg;
            (fb.optarg_jumps[i], i + 1 == fb.optarg_jumps.len() - 1)
        };

        let target = self.code.pos();
        self.code.set_at(slot, target.wrapping_sub(slot));

        self.code.write_2(Opcode::JumpIfSet.into(), param_reg);
        self.code.write(0);
        let guard_slot = self.code.pos() - 1;

        self.expr_num += 1;
        let out = self.eval_tree(default, None)?;
        self.code.write_4(Opcode::Assign.into(), out.reg, param_reg, self.line);

        self.patch_here(guard_slot);

        let fb = self.function_block_mut();
        fb.next_optarg += 1;

        if is_last {
            let all_set_slot = *fb.optarg_jumps.last().unwrap();
            let target = self.code.pos();
            self.code.set_at(all_set_slot, target.wrapping_sub(all_set_slot));
        }

        Ok(())
    }

    pub fn emit_return(&mut self, value: Option<&crate::expr::Ast>) -> LilyResult<()> {
        let function_index = self.function_block_index();

        match value {
            Some(ast) => {
                let ret_type = self.function_block().ret_type.clone();
                if ret_type.cls == ids::UNIT {
                    return Err(self.error("Function does not return a value."));
                }

                self.expr_num += 1;
                let out = self.eval_tree(ast, Some(&ret_type))?;

                let ok = if ret_type.flags.contains(TypeFlags::IS_UNRESOLVED) {
                    self.ts.check(&mut self.pool, &self.symtab, &ret_type, &out.ty)
                } else {
                    self.ts.type_greater_eq(&mut self.pool, &self.symtab, &ret_type, &out.ty)
                };
                if !ok {
                    return Err(self.error(format!(
                        "return expected type '{}' but got type '{}'.",
                        self.type_name(&ret_type),
                        self.type_name(&out.ty)
                    )));
                }

                // A raise during the return expression still needs the
                // enclosing catch entries, so the pops come after it.
                self.write_pop_try_blocks_up_to(function_index);
                self.code.write_3(Opcode::ReturnValue.into(), out.reg, self.line);
            }
            None => {
                self.write_pop_try_blocks_up_to(function_index);
                self.code.write_2(Opcode::ReturnUnit.into(), self.line);
            }
        }

        let pos = self.code.pos() as i32;
        self.block_mut().last_exit = pos;
        Ok(())
    }

    /// Close the current define/lambda: verify the return path, run the
    /// closure transform if needed, and freeze the code into a function
    /// value in the readonly table.
    pub fn end_define(&mut self) -> LilyResult<()> {
        let block_index = self.blocks.len() - 1;
        if !self.block().kind.is_function() || block_index == 0 {
            return Err(self.error("'}' outside of a function."));
        }

        let is_ctor = self.block().kind == BlockKind::ClassCtor;
        let fb_ret = self.function_block().ret_type.clone();
        let last_exit = self.block().last_exit;

        if is_ctor {
            let self_reg = self.function_block().self_reg.unwrap();
            self.code.write_3(Opcode::ReturnValue.into(), self_reg, self.line);
        } else if last_exit != self.code.pos() as i32 {
            if fb_ret.cls == ids::UNIT {
                self.code.write_2(Opcode::ReturnUnit.into(), self.line);
            } else {
                return Err(self.error("Missing return statement at end of function."));
            }
        }

        let make_closure = self.function_block().make_closure;
        let code_start = self.block().code_start;
        let code_stop = self.code.pos();

        let (code, upvalue_count) = if make_closure {
            let count = self.perform_closure_transform(code_start, code_stop)?;
            (self.closure_aux.as_slice().to_vec(), count)
        } else {
            (self.code.extract(code_start, code_stop), 0)
        };

        let (var_id, ro_spot, reg_count, storage_start, prev_function, class_id) = {
            let fb = self.blocks[block_index].func.as_ref().unwrap();
            (fb.var, fb.ro_spot, fb.next_reg_spot, fb.storage_start, fb.prev_function, fb.class_id)
        };

        let name = self.symtab.var(var_id).name.clone();
        let class_name = class_id.map(|id| self.symtab.class_name(id).to_string());

        let function = FunctionVal {
            gc: Default::default(),
            name,
            class_name,
            module_path: self.module_path.clone(),
            foreign: None,
            code: Some(Rc::new(code)),
            reg_count,
            upvalue_count,
            closure: Default::default(),
        };

        self.symtab.set_readonly(ro_spot, Value::Function(Rc::new(function)));

        // Rewind the shared code buffer and close the block.
        self.code.set_pos(code_start);
        let patch_start = self.block().patch_start;
        self.write_patches_since(patch_start);

        self.storages.truncate(storage_start);

        if make_closure && prev_function != 0 {
            // The enclosing function has to carry closure data too.
            self.blocks[prev_function].func.as_mut().unwrap().make_closure = true;
        }

        if is_ctor {
            self.class_block_depth = 0;
        }

        self.blocks.pop();
        self.function_depth -= 1;
        Ok(())
    }

    /// Define a user class: registers the class and enters its
    /// constructor. Properties are initialized from the constructor's
    /// parameters by the front end (shorthand ctor) or by property
    /// assignments.
    pub fn begin_class(
        &mut self,
        name: &str,
        parent: Option<u16>,
        properties: Vec<(String, TypeRef)>,
        flags: crate::symtab::ClassFlags,
        ctor_params: Vec<(String, TypeRef)>,
    ) -> LilyResult<(u16, VarId)> {
        use crate::symtab::{Class, Property};

        let id = self.symtab.classes.len() as u16;
        let base_index = parent.map(|p| self.symtab.total_prop_count(p)).unwrap_or(0);

        self.symtab.classes.push(Class {
            id,
            name: name.to_string(),
            flags,
            parent,
            generic_count: 0,
            properties: properties
                .iter()
                .enumerate()
                .map(|(i, (prop_name, ty))| Property {
                    name: prop_name.clone(),
                    ty: ty.clone(),
                    index: base_index + i as u16,
                })
                .collect(),
            variants: Vec::new(),
            variant_id: 0,
            variant_args: Vec::new(),
            module: 0,
        });

        let self_type = self.pool.default_type(id);
        let spec = DefineSpec {
            name: "new".to_string(),
            params: ctor_params,
            ret: self_type.clone(),
            flags: TypeFlags::empty(),
            generic_count: 0,
            class_id: Some(id),
        };

        let param_types: Vec<TypeRef> = spec.params.iter().map(|(_, t)| t.clone()).collect();
        let func_type = self.pool.function(TypeFlags::empty(), self_type, param_types);

        let ro_spot = self.symtab.reserve_function_spot();
        let var = self.symtab.add_var(Var {
            name: format!("{}.new", name),
            ty: func_type,
            kind: VarKind::ReadonlyFunc { spot: ro_spot, foreign: false },
            needs_closure: false,
        });

        self.enter_call_block(BlockKind::ClassCtor, var, ro_spot, &spec)?;
        self.class_block_depth = self.function_depth;

        // The constructor header: allocate self, tagged when the class can
        // be part of a cycle.
        let self_reg = self.alloc_reg();
        self.function_block_mut().self_reg = Some(self_reg);

        let opcode = if flags.contains(crate::symtab::ClassFlags::GC_TAGGED) {
            Opcode::InstanceNewTagged
        } else if flags.contains(crate::symtab::ClassFlags::GC_SPECULATIVE) {
            Opcode::InstanceNewSpeculative
        } else {
            Opcode::InstanceNew
        };
        self.code.write_4(opcode.into(), id, self_reg, self.line);

        Ok((id, var))
    }

    /// End the class constructor block.
    pub fn end_class(&mut self) -> LilyResult<()> {
        self.end_define()
    }

    /* ---------------- statements ---------------- */

    /// Evaluate a full expression as a statement.
    pub fn eval_expr(&mut self, ast: &crate::expr::Ast) -> LilyResult<()> {
        self.expr_num += 1;
        self.eval_tree(ast, None)?;
        Ok(())
    }

    fn eval_condition(&mut self, ast: &crate::expr::Ast) -> LilyResult<u16> {
        self.expr_num += 1;
        let out = self.eval_tree(ast, None)?;

        match out.ty.cls {
            ids::BOOLEAN | ids::INTEGER => Ok(out.reg),
            _ => Err(self.error(format!(
                "Condition expression is not truthy (type '{}').",
                self.type_name(&out.ty)
            ))),
        }
    }

    /// Finish __main__: write the exit opcode, freeze its code, and hand
    /// the completed symbol table over for execution.
    pub fn finish(mut self) -> LilyResult<Symtab> {
        if self.blocks.len() != 1 {
            return Err(self.error("Unterminated block at end of program."));
        }

        self.code.write(Opcode::VmExit.into());

        let fb = self.blocks[0].func.as_ref().unwrap();
        let global_count = fb.next_reg_spot;
        let ro_spot = fb.ro_spot;

        let function = Rc::new(FunctionVal {
            gc: Default::default(),
            name: "__main__".to_string(),
            class_name: None,
            module_path: self.module_path.clone(),
            foreign: None,
            code: Some(Rc::new(self.code.as_slice().to_vec())),
            reg_count: global_count,
            upvalue_count: 0,
            closure: Default::default(),
        });

        self.symtab.set_readonly(ro_spot, Value::Function(function.clone()));
        self.symtab.main_function = Some(function);
        self.symtab.global_count = global_count;

        Ok(self.symtab)
    }
}

/// Placeholder for fields initialized before the pool exists.
fn pool_placeholder() -> TypeRef {
    use crate::types::{Type, TypeFlags};
    Rc::new(Type {
        cls: ids::UNIT,
        generic_pos: 0,
        flags: TypeFlags::empty(),
        subtypes: Vec::new(),
    })
}
