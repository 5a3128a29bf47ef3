use std::collections::HashMap;
use std::rc::Rc;

use crate::code::Opcode;
use crate::gc::{Gc, GcObject, GcStats};
use crate::symtab::{ids, Symtab, VarKind};
use crate::value::ops::{calculate_hash, eq_value, hash_find, hash_set, interpolate_value};
use crate::value::{
    ClosureData, FunctionVal, HashVal, InstanceVal, ListVal, Value, VariantVal,
};
use crate::vm::{ErrorKind, LilyError, LilyResult, OpResult, Raise, TraceEntry};
use crate::VmConfig;

/// One activation. Native frames carry code; foreign frames exist only so
/// tracebacks can name the foreign call.
struct CallFrame {
    function: Rc<FunctionVal>,
    code: Option<Rc<Vec<u16>>>,
    code_pos: usize,
    /// Base of this frame's registers within the flat file.
    reg_base: usize,
    regs_used: u16,
    /// Absolute register that receives this frame's return value.
    return_spot: usize,
    upvalues: Option<Rc<ClosureData>>,
    line_num: u16,
    /// Constructor chaining: the instance being built, shared up the
    /// frame chain so a super new() reuses it.
    build_value: Option<Rc<InstanceVal>>,
}

/// A pushed try. The unwinder walks these newest-first.
#[derive(Clone)]
struct CatchEntry {
    frame_index: usize,
    /// Position of the first exception_catch of the chain.
    code_pos: usize,
    reg_base: usize,
}

type ImportHook = Box<dyn FnMut(&mut Symtab, &str) -> bool>;

/// The virtual machine. Owns the register file, frames, catch chain, GC,
/// readonly table, and the symbol table the emitter produced.
pub struct Vm {
    config: VmConfig,
    pub symtab: Symtab,
    readonly: Vec<Value>,
    regs: Vec<Value>,
    /// Offset of the current frame's base in 'regs'.
    vm_regs: usize,
    num_registers: usize,
    frames: Vec<CallFrame>,
    catch_chain: Vec<CatchEntry>,
    gc: Gc,
    sipkey: [u8; 16],
    empty_variants: HashMap<u16, Value>,
    import_hook: Option<ImportHook>,
    /// Spoofed code used to bounce out of re-entrant dispatch.
    exit_code: Rc<Vec<u16>>,
    instruction_count: usize,
}

impl Vm {
    pub fn new(symtab: Symtab, config: VmConfig) -> Self {
        let readonly = symtab.readonly.clone();
        let gc = Gc::new(config.gc_threshold, config.gc_debug);

        Vm {
            config,
            symtab,
            readonly,
            regs: Vec::new(),
            vm_regs: 0,
            num_registers: 0,
            frames: Vec::new(),
            catch_chain: Vec::new(),
            gc,
            sipkey: *b"lily RNG sipkey!",
            empty_variants: HashMap::new(),
            import_hook: None,
            exit_code: Rc::new(vec![Opcode::VmExit.into()]),
            instruction_count: 0,
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    pub fn gc_live_count(&self) -> usize {
        self.gc.live_count()
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    /// Read a global register after a run, for embedders and tests.
    pub fn global(&self, spot: u16) -> Value {
        self.regs.get(spot as usize).cloned().unwrap_or(Value::Unset)
    }

    pub fn set_import_callback(&mut self, hook: ImportHook) {
        self.import_hook = Some(hook);
    }

    /// Ask for a module by name; falls back to the import callback for
    /// anything not already registered.
    pub fn import_module(&mut self, name: &str) -> bool {
        if self.symtab.modules.iter().any(|m| m.name == name) {
            return true;
        }
        if let Some(hook) = self.import_hook.as_mut() {
            return hook(&mut self.symtab, name);
        }
        false
    }

    /// Force a collection now, regardless of the threshold.
    pub fn collect_garbage(&mut self) -> usize {
        let used = self.num_registers;
        self.gc.collect(&mut self.regs, used)
    }

    fn grow_registers(&mut self, need: usize) {
        if self.regs.len() < need {
            let mut size = self.regs.len().max(8);
            while size < need {
                size *= 2;
            }
            self.regs.resize(size, Value::Unset);
        }
    }

    fn add_gc_item(&mut self, value: &Value) {
        if self.gc.needs_collection() {
            let used = self.num_registers;
            self.gc.collect(&mut self.regs, used);
        }
        if let Some(obj) = GcObject::from_value(value) {
            self.gc.register(obj);
        }
    }

    /* ---------------- embedding surface ---------------- */

    /// Run __main__ to completion.
    pub fn run_main(&mut self) -> LilyResult<()> {
        let main_function = self
            .symtab
            .main_function
            .clone()
            .expect("symtab has no __main__");

        self.readonly = self.symtab.readonly.clone();

        let reg_count = main_function.reg_count as usize;
        self.grow_registers(reg_count.max(1));
        self.num_registers = reg_count;
        self.vm_regs = 0;

        self.frames.clear();
        self.catch_chain.clear();
        self.frames.push(CallFrame {
            code: main_function.code.clone(),
            function: main_function,
            code_pos: 0,
            reg_base: 0,
            regs_used: reg_count as u16,
            return_spot: 0,
            upvalues: None,
            line_num: 0,
            build_value: None,
        });

        self.run_dispatch()
    }

    /// Find a named global function and call it with the given arguments.
    pub fn call_name(&mut self, name: &str, args: Vec<Value>) -> LilyResult<Value> {
        let var_id = self
            .symtab
            .find_var(name)
            .ok_or_else(|| LilyError::Syntax {
                message: format!("No function named '{}'.", name),
                line: 0,
            })?;

        let spot = match self.symtab.var(var_id).kind {
            VarKind::ReadonlyFunc { spot, .. } => spot,
            _ => {
                return Err(LilyError::Syntax {
                    message: format!("'{}' is not a function.", name),
                    line: 0,
                })
            }
        };

        let function = match &self.readonly[spot as usize] {
            Value::Function(f) => f.clone(),
            _ => {
                return Err(LilyError::Syntax {
                    message: format!("'{}' has no value yet.", name),
                    line: 0,
                })
            }
        };

        match self.foreign_call(&function, &args) {
            Ok(value) => Ok(value),
            Err(raise) => Err(self.uncaught(*raise)),
        }
    }

    /// Re-enter the VM from foreign code: push a bounce frame whose code
    /// exits the dispatch loop, run the callee above it, and hand back the
    /// returned value. The register window is restored on the way out.
    pub fn foreign_call(
        &mut self,
        function: &Rc<FunctionVal>,
        args: &[Value],
    ) -> OpResult<Value> {
        if function.code.is_none() {
            return self.foreign_call_foreign(function, args);
        }

        let save_vm_regs = self.vm_regs;
        let save_registers = self.num_registers;

        // The bounce frame owns one register: the callee's return spot.
        let bounce_base = self.num_registers;
        self.grow_registers(bounce_base + 1);
        self.regs[bounce_base] = Value::Unset;
        self.num_registers += 1;

        let bounce_fn = Rc::new(FunctionVal {
            gc: Default::default(),
            name: "(vm entry)".to_string(),
            class_name: None,
            module_path: "[C]".to_string(),
            foreign: None,
            code: Some(self.exit_code.clone()),
            reg_count: 1,
            upvalue_count: 0,
            closure: Default::default(),
        });

        self.frames.push(CallFrame {
            function: bounce_fn,
            code: Some(self.exit_code.clone()),
            code_pos: 0,
            reg_base: bounce_base,
            regs_used: 1,
            return_spot: bounce_base,
            upvalues: None,
            line_num: 0,
            build_value: None,
        });

        let callee_base = self.num_registers;
        let need = callee_base + function.reg_count as usize;
        self.grow_registers(need);

        for (i, arg) in args.iter().enumerate() {
            self.regs[callee_base + i] = arg.clone();
        }
        for i in args.len()..function.reg_count as usize {
            self.regs[callee_base + i] = Value::Unset;
        }

        self.num_registers = need;
        self.vm_regs = callee_base;

        self.frames.push(CallFrame {
            code: function.code.clone(),
            upvalues: function.closure.borrow().clone(),
            function: function.clone(),
            code_pos: 0,
            reg_base: callee_base,
            regs_used: function.reg_count,
            return_spot: bounce_base,
            line_num: 0,
            build_value: None,
        });

        let result = self.execute();

        match result {
            Ok(()) => {
                let value = self.regs[bounce_base].clone();
                self.frames.pop();
                self.vm_regs = save_vm_regs;
                self.num_registers = save_registers;
                Ok(value)
            }
            Err(raise) => Err(raise),
        }
    }

    /// Calling a foreign function from outside dispatch: stage the
    /// arguments in fresh registers and hand over an argument window.
    fn foreign_call_foreign(
        &mut self,
        function: &Rc<FunctionVal>,
        args: &[Value],
    ) -> OpResult<Value> {
        let func = function.foreign.expect("foreign function without fn");

        let save_vm_regs = self.vm_regs;
        let save_registers = self.num_registers;

        let arg_base = self.num_registers;
        self.grow_registers(arg_base + args.len() + 1);

        for (i, arg) in args.iter().enumerate() {
            self.regs[arg_base + i] = arg.clone();
        }
        self.regs[arg_base + args.len()] = Value::Unset;

        self.num_registers = arg_base + args.len() + 1;
        self.vm_regs = arg_base;

        self.frames.push(CallFrame {
            function: function.clone(),
            code: None,
            code_pos: 0,
            reg_base: arg_base,
            regs_used: 0,
            return_spot: arg_base + args.len(),
            upvalues: None,
            line_num: 0,
            build_value: None,
        });

        let words: Vec<u16> = (0..=args.len() as u16).collect();
        let result = func(self, args.len() as u16, &words);

        self.frames.pop();
        let value = self.regs[arg_base + args.len()].clone();
        self.vm_regs = save_vm_regs;
        self.num_registers = save_registers;

        result.map(|()| value)
    }

    /// Read an argument register during a foreign call. 'words' is the
    /// argument slice the dispatch loop handed over.
    pub fn foreign_reg(&self, words: &[u16], index: usize) -> Value {
        self.regs[self.vm_regs + words[index] as usize].clone()
    }

    /// Write the result register of a foreign call.
    pub fn set_foreign_result(&mut self, words: &[u16], argc: u16, value: Value) {
        let spot = self.vm_regs + words[argc as usize] as usize;
        self.regs[spot] = value;
    }

    /// Signal an error from foreign code.
    pub fn raise_error(&self, kind: ErrorKind, message: impl Into<String>) -> Box<Raise> {
        Box::new(Raise {
            class_id: kind.class_id(),
            message: message.into(),
            raised_value: None,
        })
    }

    /// Register a new GC-visible payload created by foreign code.
    pub fn tag_value(&mut self, value: &Value) {
        self.add_gc_item(value);
    }

    /* ---------------- the dispatch driver ---------------- */

    fn run_dispatch(&mut self) -> LilyResult<()> {
        loop {
            match self.execute() {
                Ok(()) => return Ok(()),
                Err(raise) => {
                    if !self.try_catch(&raise) {
                        return Err(self.uncaught(*raise));
                    }
                }
            }
        }
    }

    fn uncaught(&mut self, raise: Raise) -> LilyError {
        let traceback = self.build_trace_entries();
        LilyError::Uncaught {
            class_id: raise.class_id,
            class_name: self.symtab.class_name(raise.class_id).to_string(),
            message: raise.message,
            traceback,
        }
    }

    /// Traceback entries, newest frame first.
    fn build_trace_entries(&self) -> Vec<TraceEntry> {
        self.frames
            .iter()
            .rev()
            .filter(|f| f.function.name != "(vm entry)")
            .map(|f| TraceEntry {
                path: f.function.module_path.clone(),
                name: f.function.qualified_name(),
                line: f.line_num,
            })
            .collect()
    }

    /// The traceback as a runtime list value:
    /// List[Tuple[String, String, Integer]].
    /// Nothing here is registered with the GC: strings and integers cannot
    /// form cycles, and a pass running mid-build would see these values as
    /// unreachable while only this function holds them.
    fn build_traceback_value(&mut self) -> Value {
        let elems: Vec<Value> = self
            .build_trace_entries()
            .into_iter()
            .map(|entry| {
                Value::Tuple(Rc::new(ListVal {
                    gc: Default::default(),
                    elems: std::cell::RefCell::new(vec![
                        Value::String(Rc::new(entry.path)),
                        Value::String(Rc::new(entry.name)),
                        Value::Integer(entry.line as i64),
                    ]),
                }))
            })
            .collect();

        Value::List(Rc::new(ListVal {
            gc: Default::default(),
            elems: std::cell::RefCell::new(elems),
        }))
    }

    /// Build the exception instance stored into an except var: the raised
    /// instance when the user raised one, or a fresh {message, traceback}
    /// instance for internal errors.
    fn make_exception_value(&mut self, raise: &Raise) -> Value {
        if let Some(value) = &raise.raised_value {
            return value.clone();
        }

        let traceback = self.build_traceback_value();
        let instance = Value::Instance(Rc::new(InstanceVal {
            gc: Default::default(),
            class_id: raise.class_id,
            values: std::cell::RefCell::new(vec![
                Value::String(Rc::new(raise.message.clone())),
                traceback,
            ]),
        }));
        instance
    }

    /// Walk the catch chain for a handler of the raised class. On a match,
    /// frames above the handler are dropped and control is repositioned at
    /// the except branch; the next execute() resumes there.
    fn try_catch(&mut self, raise: &Raise) -> bool {
        while let Some(entry) = self.catch_chain.last().cloned() {
            let code = match &self.frames[entry.frame_index].code {
                Some(code) => code.clone(),
                None => {
                    self.catch_chain.pop();
                    continue;
                }
            };

            let mut pos = entry.code_pos;
            loop {
                // Each branch: [exception_catch, class, next, line].
                let catch_class = code[pos + 1];
                let next_word = code[pos + 2];

                if catch_class == raise.class_id
                    || self.symtab.class_greater_eq(catch_class, raise.class_id)
                {
                    let mut resume = pos + 4;

                    if code.get(resume) == Some(&Opcode::ExceptionStore.into()) {
                        let store_reg = code[resume + 1] as usize;
                        let value = self.make_exception_value(raise);
                        self.regs[entry.reg_base + store_reg] = value;
                        resume += 3;
                    }

                    let regs_used = self.frames[entry.frame_index].regs_used;
                    self.frames.truncate(entry.frame_index + 1);
                    self.frames[entry.frame_index].code_pos = resume;
                    self.vm_regs = entry.reg_base;
                    self.num_registers = entry.reg_base + regs_used as usize;

                    // A try handles one exception; this entry is spent.
                    self.catch_chain.pop();
                    return true;
                }

                if next_word == 0 {
                    break;
                }
                let slot = pos + 2;
                pos = slot.wrapping_add(next_word as i16 as isize as usize);
            }

            self.catch_chain.pop();
        }

        false
    }

    /* ---------------- raise helpers ---------------- */

    fn raise(&mut self, kind: ErrorKind, message: String, line: u16) -> Box<Raise> {
        if let Some(frame) = self.frames.last_mut() {
            frame.line_num = line;
        }
        Box::new(Raise {
            class_id: kind.class_id(),
            message,
            raised_value: None,
        })
    }

    fn index_error(&mut self, index: i64, line: u16) -> Box<Raise> {
        self.raise(
            ErrorKind::IndexError,
            format!("Subscript index {} is out of range.", index),
            line,
        )
    }

    fn key_error(&mut self, key: &Value, line: u16) -> Box<Raise> {
        let shown = match key {
            Value::String(s) => format!("\"{}\"", s),
            other => other.to_string(),
        };
        self.raise(ErrorKind::KeyError, format!("{} not found.", shown), line)
    }
}

/* The dispatch loop. One frame-level loop re-reads the current frame's
   code after calls, returns, and catch resumes; the inner loop steps
   through instructions. No opcode both suspends and mutates registers:
   every handler runs to completion before the next is fetched. */
impl Vm {
    fn execute(&mut self) -> OpResult<()> {
        'frame: loop {
            let (code, mut pos, base) = {
                let frame = self.frames.last().expect("dispatch with no frame");
                let code = frame
                    .code
                    .clone()
                    .expect("dispatch entered a foreign frame");
                (code, frame.code_pos, frame.reg_base)
            };
            self.vm_regs = base;

            loop {
                self.instruction_count += 1;

                let op = match Opcode::try_from(code[pos]) {
                    Ok(op) => op,
                    Err(_) => {
                        return Err(self.raise(
                            ErrorKind::RuntimeError,
                            format!("Unknown opcode {}.", code[pos]),
                            0,
                        ))
                    }
                };

                if self.config.trace {
                    use colored::Colorize;
                    eprintln!("{}", format!("trace: {:5} {}", pos, op.name()).dimmed());
                }

                match op {
                    Opcode::FastAssign | Opcode::Assign => {
                        let value = self.regs[base + code[pos + 1] as usize].clone();
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::IntAdd
                    | Opcode::IntMinus
                    | Opcode::IntModulo
                    | Opcode::IntMul
                    | Opcode::IntDiv
                    | Opcode::IntLeftShift
                    | Opcode::IntRightShift
                    | Opcode::IntBitAnd
                    | Opcode::IntBitOr
                    | Opcode::IntBitXor => {
                        let line = code[pos + 4];
                        let lhs = self.regs[base + code[pos + 1] as usize].as_integer();
                        let rhs = self.regs[base + code[pos + 2] as usize].as_integer();

                        let result = match op {
                            Opcode::IntAdd => lhs.wrapping_add(rhs),
                            Opcode::IntMinus => lhs.wrapping_sub(rhs),
                            Opcode::IntMul => lhs.wrapping_mul(rhs),
                            Opcode::IntDiv => {
                                if rhs == 0 {
                                    return Err(self.raise(
                                        ErrorKind::DivisionByZeroError,
                                        "Attempt to divide by zero.".to_string(),
                                        line,
                                    ));
                                }
                                lhs.wrapping_div(rhs)
                            }
                            Opcode::IntModulo => {
                                if rhs == 0 {
                                    return Err(self.raise(
                                        ErrorKind::DivisionByZeroError,
                                        "Attempt to divide by zero.".to_string(),
                                        line,
                                    ));
                                }
                                lhs.wrapping_rem(rhs)
                            }
                            Opcode::IntLeftShift => lhs.wrapping_shl(rhs as u32),
                            Opcode::IntRightShift => lhs.wrapping_shr(rhs as u32),
                            Opcode::IntBitAnd => lhs & rhs,
                            Opcode::IntBitOr => lhs | rhs,
                            _ => lhs ^ rhs,
                        };

                        self.regs[base + code[pos + 3] as usize] = Value::Integer(result);
                        pos += 5;
                    }

                    Opcode::NumberAdd
                    | Opcode::NumberMinus
                    | Opcode::NumberMul
                    | Opcode::NumberDiv => {
                        let line = code[pos + 4];
                        let lhs = self.number_of(base, code[pos + 1], line)?;
                        let rhs = self.number_of(base, code[pos + 2], line)?;

                        let result = match op {
                            Opcode::NumberAdd => lhs + rhs,
                            Opcode::NumberMinus => lhs - rhs,
                            Opcode::NumberMul => lhs * rhs,
                            _ => {
                                if rhs == 0.0 {
                                    return Err(self.raise(
                                        ErrorKind::DivisionByZeroError,
                                        "Attempt to divide by zero.".to_string(),
                                        line,
                                    ));
                                }
                                lhs / rhs
                            }
                        };

                        self.regs[base + code[pos + 3] as usize] = Value::Double(result);
                        pos += 5;
                    }

                    Opcode::CompareEq | Opcode::CompareNotEq => {
                        let lhs = self.regs[base + code[pos + 1] as usize].clone();
                        let rhs = self.regs[base + code[pos + 2] as usize].clone();
                        let eq = eq_value(&lhs, &rhs)?;
                        let result = if op == Opcode::CompareEq { eq } else { !eq };
                        self.regs[base + code[pos + 3] as usize] = Value::Boolean(result);
                        pos += 5;
                    }

                    Opcode::CompareGreater | Opcode::CompareGreaterEq => {
                        let line = code[pos + 4];
                        let lhs = self.regs[base + code[pos + 1] as usize].clone();
                        let rhs = self.regs[base + code[pos + 2] as usize].clone();
                        let ordering = self.order_values(&lhs, &rhs, line)?;

                        let result = if op == Opcode::CompareGreater {
                            ordering == std::cmp::Ordering::Greater
                        } else {
                            ordering != std::cmp::Ordering::Less
                        };
                        self.regs[base + code[pos + 3] as usize] = Value::Boolean(result);
                        pos += 5;
                    }

                    Opcode::UnaryNot => {
                        let value = self.regs[base + code[pos + 1] as usize].as_boolean();
                        self.regs[base + code[pos + 2] as usize] = Value::Boolean(!value);
                        pos += 4;
                    }

                    Opcode::UnaryMinus => {
                        let value = match &self.regs[base + code[pos + 1] as usize] {
                            Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                            Value::Double(d) => Value::Double(-d),
                            _ => Value::Integer(0),
                        };
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::UnaryBitNot => {
                        let value = self.regs[base + code[pos + 1] as usize].as_integer();
                        self.regs[base + code[pos + 2] as usize] = Value::Integer(!value);
                        pos += 4;
                    }

                    Opcode::Jump => {
                        let slot = pos + 1;
                        pos = jump_from(slot, code[slot]);
                    }

                    Opcode::JumpIf => {
                        let want = code[pos + 1] == 1;
                        let truth = self.regs[base + code[pos + 2] as usize].as_boolean();
                        if truth == want {
                            let slot = pos + 3;
                            pos = jump_from(slot, code[slot]);
                        } else {
                            pos += 4;
                        }
                    }

                    Opcode::JumpIfSet => {
                        if !self.regs[base + code[pos + 1] as usize].is_unset() {
                            let slot = pos + 2;
                            pos = jump_from(slot, code[slot]);
                        } else {
                            pos += 3;
                        }
                    }

                    Opcode::JumpIfNotClass => {
                        let class_id = code[pos + 1];
                        let value = &self.regs[base + code[pos + 2] as usize];
                        if value.class_id() != class_id {
                            let slot = pos + 3;
                            pos = jump_from(slot, code[slot]);
                        } else {
                            pos += 4;
                        }
                    }

                    Opcode::ForSetup => {
                        let line = code[pos + 6];
                        let derive = code[pos + 1] == 1;
                        let start = self.regs[base + code[pos + 2] as usize].as_integer();
                        let stop = self.regs[base + code[pos + 3] as usize].as_integer();

                        let step = if derive {
                            let step = if start <= stop { 1 } else { -1 };
                            self.regs[base + code[pos + 4] as usize] = Value::Integer(step);
                            step
                        } else {
                            let step = self.regs[base + code[pos + 4] as usize].as_integer();
                            if step == 0 {
                                return Err(self.raise(
                                    ErrorKind::ValueError,
                                    "for loop step cannot be 0.".to_string(),
                                    line,
                                ));
                            }
                            step
                        };

                        // Pre-decrement the counter so the first step of
                        // the loop lands exactly on the start value.
                        self.regs[base + code[pos + 2] as usize] =
                            Value::Integer(start.wrapping_sub(step));
                        self.regs[base + code[pos + 5] as usize] = Value::Integer(start);
                        pos += 7;
                    }

                    Opcode::ForInteger => {
                        let counter = self.regs[base + code[pos + 1] as usize].as_integer();
                        let stop = self.regs[base + code[pos + 2] as usize].as_integer();
                        let step = self.regs[base + code[pos + 3] as usize].as_integer();

                        let next = counter.wrapping_add(step);
                        let in_range = if step > 0 { next <= stop } else { next >= stop };

                        if in_range {
                            self.regs[base + code[pos + 1] as usize] = Value::Integer(next);
                            self.regs[base + code[pos + 4] as usize] = Value::Integer(next);
                            pos += 7;
                        } else {
                            let slot = pos + 5;
                            pos = jump_from(slot, code[slot]);
                        }
                    }

                    Opcode::CallForeign | Opcode::CallNative | Opcode::CallRegister => {
                        let argc = code[pos + 2] as usize;
                        let line = code[pos + 4 + argc];
                        let resume = pos + argc + 5;

                        let callee = match op {
                            Opcode::CallRegister => {
                                let value =
                                    self.regs[base + code[pos + 1] as usize].clone();
                                match value {
                                    Value::Function(f) => f,
                                    _ => {
                                        return Err(self.raise(
                                            ErrorKind::RuntimeError,
                                            "Value is not a function.".to_string(),
                                            line,
                                        ))
                                    }
                                }
                            }
                            _ => match &self.readonly[code[pos + 1] as usize] {
                                Value::Function(f) => f.clone(),
                                _ => {
                                    return Err(self.raise(
                                        ErrorKind::RuntimeError,
                                        "Call target is not a function.".to_string(),
                                        line,
                                    ))
                                }
                            },
                        };

                        {
                            let frame = self.frames.last_mut().unwrap();
                            frame.line_num = line;
                            frame.code_pos = resume;
                        }

                        if let Some(callee_code) = callee.code.clone() {
                            if self.frames.len() >= self.config.recursion_limit {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "Function call recursion limit reached.".to_string(),
                                    line,
                                ));
                            }

                            let callee_base = self.num_registers;
                            let need = callee_base + callee.reg_count as usize;
                            self.grow_registers(need);

                            for i in 0..argc {
                                let value =
                                    self.regs[base + code[pos + 3 + i] as usize].clone();
                                self.regs[callee_base + i] = value;
                            }
                            for i in argc..callee.reg_count as usize {
                                self.regs[callee_base + i] = Value::Unset;
                            }

                            self.num_registers = need;
                            let return_spot = base + code[pos + 3 + argc] as usize;
                            let upvalues = callee.closure.borrow().clone();

                            self.frames.push(CallFrame {
                                code: Some(callee_code),
                                upvalues,
                                regs_used: callee.reg_count,
                                function: callee,
                                code_pos: 0,
                                reg_base: callee_base,
                                return_spot,
                                line_num: 0,
                                build_value: None,
                            });

                            continue 'frame;
                        } else {
                            let func = callee.foreign.expect("foreign function without fn");

                            self.frames.push(CallFrame {
                                function: callee,
                                code: None,
                                code_pos: 0,
                                reg_base: base,
                                regs_used: 0,
                                return_spot: base + code[pos + 3 + argc] as usize,
                                upvalues: None,
                                line_num: line,
                                build_value: None,
                            });

                            let words: Vec<u16> =
                                code[pos + 3..pos + 3 + argc + 1].to_vec();
                            func(self, argc as u16, &words)?;

                            self.frames.pop();
                            continue 'frame;
                        }
                    }

                    Opcode::ReturnValue | Opcode::ReturnUnit => {
                        let value = if op == Opcode::ReturnValue {
                            self.regs[base + code[pos + 1] as usize].clone()
                        } else {
                            Value::Unit
                        };

                        let finished = self.frames.pop().unwrap();
                        self.num_registers = finished.reg_base;
                        self.regs[finished.return_spot] = value;

                        continue 'frame;
                    }

                    Opcode::BuildList | Opcode::BuildTuple => {
                        let count = code[pos + 1] as usize;
                        let elems: Vec<Value> = (0..count)
                            .map(|i| self.regs[base + code[pos + 2 + i] as usize].clone())
                            .collect();

                        let payload = Rc::new(ListVal {
                            gc: Default::default(),
                            elems: std::cell::RefCell::new(elems),
                        });
                        let value = if op == Opcode::BuildList {
                            Value::List(payload)
                        } else {
                            Value::Tuple(payload)
                        };

                        self.add_gc_item(&value);
                        self.regs[base + code[pos + 2 + count] as usize] = value;
                        pos += count + 4;
                    }

                    Opcode::BuildHash => {
                        let count = code[pos + 1] as usize;
                        let payload = Rc::new(HashVal {
                            gc: Default::default(),
                            elems: std::cell::RefCell::new(Vec::new()),
                        });

                        let mut i = 0;
                        while i < count {
                            let key = self.regs[base + code[pos + 2 + i] as usize].clone();
                            let value =
                                self.regs[base + code[pos + 3 + i] as usize].clone();
                            let key_hash = calculate_hash(&self.sipkey, &key);
                            hash_set(&payload, key_hash, key, value)?;
                            i += 2;
                        }

                        let value = Value::Hash(payload);
                        self.add_gc_item(&value);
                        self.regs[base + code[pos + 2 + count] as usize] = value;
                        pos += count + 4;
                    }

                    Opcode::BuildVariant => {
                        let variant_class = code[pos + 1];
                        let count = code[pos + 2] as usize;
                        let cls = self.symtab.class(variant_class);
                        let enum_id = cls.parent.unwrap_or(variant_class);
                        let variant_id = cls.variant_id;

                        let values: Vec<Value> = (0..count)
                            .map(|i| self.regs[base + code[pos + 3 + i] as usize].clone())
                            .collect();

                        let value = Value::Variant(Rc::new(VariantVal {
                            gc: Default::default(),
                            enum_id,
                            variant_id,
                            values: std::cell::RefCell::new(values),
                        }));

                        self.add_gc_item(&value);
                        self.regs[base + code[pos + 3 + count] as usize] = value;
                        pos += count + 5;
                    }

                    Opcode::SubscriptGet => {
                        let line = code[pos + 4];
                        let source = self.regs[base + code[pos + 1] as usize].clone();
                        let index = self.regs[base + code[pos + 2] as usize].clone();
                        let value = self.subscript_get(&source, &index, line)?;
                        self.regs[base + code[pos + 3] as usize] = value;
                        pos += 5;
                    }

                    Opcode::SubscriptSet => {
                        let line = code[pos + 4];
                        let source = self.regs[base + code[pos + 1] as usize].clone();
                        let index = self.regs[base + code[pos + 2] as usize].clone();
                        let value = self.regs[base + code[pos + 3] as usize].clone();
                        self.subscript_set(&source, &index, value, line)?;
                        pos += 5;
                    }

                    Opcode::GlobalGet => {
                        let value = self.regs[code[pos + 1] as usize].clone();
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::GlobalSet => {
                        let value = self.regs[base + code[pos + 2] as usize].clone();
                        self.regs[code[pos + 1] as usize] = value;
                        pos += 4;
                    }

                    Opcode::LoadReadonly => {
                        let value = self.readonly[code[pos + 1] as usize].clone();
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::LoadInteger => {
                        let value = code[pos + 1] as i16 as i64;
                        self.regs[base + code[pos + 2] as usize] = Value::Integer(value);
                        pos += 4;
                    }

                    Opcode::LoadBoolean => {
                        self.regs[base + code[pos + 2] as usize] =
                            Value::Boolean(code[pos + 1] == 1);
                        pos += 4;
                    }

                    Opcode::LoadByte => {
                        self.regs[base + code[pos + 2] as usize] =
                            Value::Integer(code[pos + 1] as i64);
                        pos += 4;
                    }

                    Opcode::LoadEmptyVariant => {
                        let value = self.empty_variant(code[pos + 1]);
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::InstanceNew
                    | Opcode::InstanceNewTagged
                    | Opcode::InstanceNewSpeculative => {
                        let class_id = code[pos + 1];
                        let out = base + code[pos + 2] as usize;

                        // A subclass constructor below us may have made
                        // the instance already; reuse it instead of
                        // building one to throw away.
                        let inherited = if self.frames.len() >= 2 {
                            self.frames[self.frames.len() - 2].build_value.clone()
                        } else {
                            None
                        };

                        if let Some(bv) = inherited.filter(|bv| bv.class_id > class_id) {
                            self.regs[out] = Value::Instance(bv.clone());
                            self.frames.last_mut().unwrap().build_value = Some(bv);
                            pos += 4;
                            continue;
                        }

                        let total = self.symtab.total_prop_count(class_id) as usize;
                        let payload = Rc::new(InstanceVal {
                            gc: Default::default(),
                            class_id,
                            values: std::cell::RefCell::new(vec![Value::Unset; total]),
                        });
                        let value = Value::Instance(payload.clone());

                        if op != Opcode::InstanceNew {
                            self.add_gc_item(&value);
                        }

                        self.regs[out] = value;
                        self.frames.last_mut().unwrap().build_value = Some(payload);
                        pos += 4;
                    }

                    Opcode::PropertyGet => {
                        let line = code[pos + 4];
                        let index = code[pos + 1] as usize;
                        let source = self.regs[base + code[pos + 2] as usize].clone();

                        let value = match &source {
                            Value::Instance(iv) => {
                                iv.values.borrow().get(index).cloned().unwrap_or(Value::Unset)
                            }
                            _ => {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "Property access on a non-instance.".to_string(),
                                    line,
                                ))
                            }
                        };

                        self.regs[base + code[pos + 3] as usize] = value;
                        pos += 5;
                    }

                    Opcode::PropertySet => {
                        let line = code[pos + 4];
                        let index = code[pos + 1] as usize;
                        let source = self.regs[base + code[pos + 2] as usize].clone();
                        let value = self.regs[base + code[pos + 3] as usize].clone();

                        match &source {
                            Value::Instance(iv) => {
                                iv.values.borrow_mut()[index] = value;
                            }
                            _ => {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "Property access on a non-instance.".to_string(),
                                    line,
                                ))
                            }
                        }
                        pos += 5;
                    }

                    Opcode::CatchPush => {
                        let slot = pos + 1;
                        let target = jump_from(slot, code[slot]);
                        self.catch_chain.push(CatchEntry {
                            frame_index: self.frames.len() - 1,
                            code_pos: target,
                            reg_base: base,
                        });
                        pos += 3;
                    }

                    Opcode::CatchPop => {
                        self.catch_chain.pop();
                        pos += 1;
                    }

                    Opcode::ExceptionCatch | Opcode::ExceptionStore => {
                        // Only the unwinder looks at these; straight-line
                        // execution is routed around them.
                        return Err(self.raise(
                            ErrorKind::RuntimeError,
                            "Walked into an exception branch header.".to_string(),
                            0,
                        ));
                    }

                    Opcode::ExceptionRaise => {
                        let line = code[pos + 2];
                        let value = self.regs[base + code[pos + 1] as usize].clone();

                        let (class_id, message) = match &value {
                            Value::Instance(iv) => {
                                let message = match iv.values.borrow().first() {
                                    Some(Value::String(s)) => s.as_ref().clone(),
                                    _ => String::new(),
                                };
                                (iv.class_id, message)
                            }
                            _ => {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "Raise of a non-exception value.".to_string(),
                                    line,
                                ))
                            }
                        };

                        self.frames.last_mut().unwrap().line_num = line;
                        return Err(Box::new(Raise {
                            class_id,
                            message,
                            raised_value: Some(value),
                        }));
                    }

                    Opcode::MatchDispatch => {
                        let line_slot = pos + 4 + code[pos + 3] as usize;
                        let line = code[line_slot];
                        let value = self.regs[base + code[pos + 1] as usize].clone();

                        let variant_id = match &value {
                            Value::Variant(v) => v.variant_id,
                            _ => {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "Match source is not an enum value.".to_string(),
                                    line,
                                ))
                            }
                        };

                        // Emit-time exhaustiveness means this index hits.
                        let slot = pos + 4 + variant_id as usize;
                        pos = jump_from(slot, code[slot]);
                    }

                    Opcode::VariantDecompose => {
                        let count = code[pos + 2] as usize;
                        let source = self.regs[base + code[pos + 1] as usize].clone();

                        if let Value::Variant(v) = &source {
                            let values = v.values.borrow();
                            for i in 0..count {
                                self.regs[base + code[pos + 3 + i] as usize] =
                                    values[i].clone();
                            }
                        }
                        pos += count + 4;
                    }

                    Opcode::ClosureNew => {
                        let count = code[pos + 1];
                        let data = ClosureData::new(count);

                        let current = self.frames.last().unwrap().function.clone();
                        let copy = current.copy_with_closure(data.clone());
                        let value = Value::Function(Rc::new(copy));

                        self.add_gc_item(&value);
                        self.regs[base + code[pos + 2] as usize] = value;
                        self.frames.last_mut().unwrap().upvalues = Some(data);
                        pos += 4;
                    }

                    Opcode::ClosureFunction => {
                        let line = code[pos + 3];
                        let spot = code[pos + 1] as usize;

                        let template = match &self.readonly[spot] {
                            Value::Function(f) => f.clone(),
                            _ => {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "Closure copy of a non-function.".to_string(),
                                    line,
                                ))
                            }
                        };

                        let cells = match &self.frames.last().unwrap().upvalues {
                            Some(data) => data.clone(),
                            None => {
                                return Err(self.raise(
                                    ErrorKind::RuntimeError,
                                    "No active closure for closure_function.".to_string(),
                                    line,
                                ))
                            }
                        };

                        let copy = template.copy_with_closure(cells);
                        let value = Value::Function(Rc::new(copy));
                        self.add_gc_item(&value);
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::ClosureGet => {
                        let spot = code[pos + 1] as usize;
                        let cell = {
                            let frame = self.frames.last().unwrap();
                            let data = frame.upvalues.as_ref().expect("closure_get without cells");
                            data.cells.borrow()[spot].clone()
                        };
                        let value = cell.borrow().clone();
                        self.regs[base + code[pos + 2] as usize] = value;
                        pos += 4;
                    }

                    Opcode::ClosureSet => {
                        let spot = code[pos + 1] as usize;
                        let value = self.regs[base + code[pos + 2] as usize].clone();
                        let cell = {
                            let frame = self.frames.last().unwrap();
                            let data = frame.upvalues.as_ref().expect("closure_set without cells");
                            data.cells.borrow()[spot].clone()
                        };
                        *cell.borrow_mut() = value;
                        pos += 4;
                    }

                    Opcode::DynamicCast => {
                        let class_id = code[pos + 1];
                        let line = code[pos + 4];
                        let source = self.regs[base + code[pos + 2] as usize].clone();

                        let inner = match &source {
                            Value::Dynamic(d) => d.inner.borrow().clone(),
                            _ => {
                                return Err(self.raise(
                                    ErrorKind::BadTypecastError,
                                    "Cast source is not a Dynamic.".to_string(),
                                    line,
                                ))
                            }
                        };

                        let value = if inner.class_id() == class_id {
                            let some = Value::Variant(Rc::new(VariantVal {
                                gc: Default::default(),
                                enum_id: ids::OPTION,
                                variant_id: 0,
                                values: std::cell::RefCell::new(vec![inner]),
                            }));
                            self.add_gc_item(&some);
                            some
                        } else {
                            self.empty_variant(ids::NONE)
                        };

                        self.regs[base + code[pos + 3] as usize] = value;
                        pos += 5;
                    }

                    Opcode::Interpolation => {
                        let count = code[pos + 1] as usize;
                        let mut out = String::new();
                        for i in 0..count {
                            let value = &self.regs[base + code[pos + 2 + i] as usize];
                            out.push_str(&interpolate_value(value));
                        }
                        self.regs[base + code[pos + 2 + count] as usize] =
                            Value::String(Rc::new(out));
                        pos += count + 4;
                    }

                    Opcode::OptargDispatch => {
                        let first = code[pos + 1] as usize;
                        let count = code[pos + 2] as usize;
                        let optargs = count - 1;

                        let mut set_prefix = optargs;
                        for i in 0..optargs {
                            if self.regs[base + first + i].is_unset() {
                                set_prefix = i;
                                break;
                            }
                        }

                        let slot = pos + 3 + set_prefix;
                        pos = jump_from(slot, code[slot]);
                    }

                    Opcode::VmExit => {
                        self.frames.last_mut().unwrap().code_pos = pos;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn number_of(&mut self, base: usize, reg: u16, line: u16) -> OpResult<f64> {
        match &self.regs[base + reg as usize] {
            Value::Integer(i) => Ok(*i as f64),
            Value::Double(d) => Ok(*d),
            other => {
                let message = format!("Expected a number, not {}.", other);
                Err(self.raise(ErrorKind::RuntimeError, message, line))
            }
        }
    }

    fn order_values(
        &mut self,
        lhs: &Value,
        rhs: &Value,
        line: u16,
    ) -> OpResult<std::cmp::Ordering> {
        use std::cmp::Ordering;

        let ordering = match (lhs, rhs) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::ByteString(a), Value::ByteString(b)) => a.cmp(b),
            _ => {
                return Err(self.raise(
                    ErrorKind::RuntimeError,
                    "Invalid comparison.".to_string(),
                    line,
                ))
            }
        };

        Ok(ordering)
    }

    fn empty_variant(&mut self, variant_class: u16) -> Value {
        if let Some(value) = self.empty_variants.get(&variant_class) {
            return value.clone();
        }

        let cls = self.symtab.class(variant_class);
        let value = Value::Variant(Rc::new(VariantVal {
            gc: Default::default(),
            enum_id: cls.parent.unwrap_or(variant_class),
            variant_id: cls.variant_id,
            values: std::cell::RefCell::new(Vec::new()),
        }));

        self.empty_variants.insert(variant_class, value.clone());
        value
    }

    fn subscript_get(&mut self, source: &Value, index: &Value, line: u16) -> OpResult<Value> {
        match source {
            Value::List(lv) | Value::Tuple(lv) => {
                let elems = lv.elems.borrow();
                let raw = index.as_integer();
                let spot = normalize_index(raw, elems.len());
                match spot {
                    Some(i) => Ok(elems[i].clone()),
                    None => Err(self.index_error(raw, line)),
                }
            }
            Value::ByteString(bytes) => {
                let raw = index.as_integer();
                let spot = normalize_index(raw, bytes.len());
                match spot {
                    Some(i) => Ok(Value::Integer(bytes[i] as i64)),
                    None => Err(self.index_error(raw, line)),
                }
            }
            Value::Hash(hv) => {
                let key_hash = calculate_hash(&self.sipkey, index);
                match hash_find(hv, key_hash, index)? {
                    Some(i) => Ok(hv.elems.borrow()[i].value.clone()),
                    None => Err(self.key_error(index, line)),
                }
            }
            _ => Err(self.raise(
                ErrorKind::RuntimeError,
                "Subscript on an unsupported value.".to_string(),
                line,
            )),
        }
    }

    fn subscript_set(
        &mut self,
        source: &Value,
        index: &Value,
        value: Value,
        line: u16,
    ) -> OpResult<()> {
        match source {
            Value::List(lv) | Value::Tuple(lv) => {
                let mut elems = lv.elems.borrow_mut();
                let raw = index.as_integer();
                match normalize_index(raw, elems.len()) {
                    Some(i) => {
                        elems[i] = value;
                        Ok(())
                    }
                    None => {
                        drop(elems);
                        Err(self.index_error(raw, line))
                    }
                }
            }
            Value::Hash(hv) => {
                let key_hash = calculate_hash(&self.sipkey, index);
                hash_set(hv, key_hash, index.clone(), value)?;
                Ok(())
            }
            _ => Err(self.raise(
                ErrorKind::RuntimeError,
                "Subscript on an unsupported value.".to_string(),
                line,
            )),
        }
    }
}

/// Resolve a jump word: operands hold the distance from their own slot.
fn jump_from(slot: usize, word: u16) -> usize {
    slot.wrapping_add(word as i16 as isize as usize)
}

/// Negative indexes count back from the end; anything out of range is an
/// error for the caller to raise.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let spot = if index < 0 { index + len as i64 } else { index };
    if spot >= 0 && (spot as usize) < len {
        Some(spot as usize)
    } else {
        None
    }
}
