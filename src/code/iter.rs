use crate::code::Opcode;

/// Walks a code buffer one instruction at a time, exposing the layout of
/// the current instruction as field counts. The word order within every
/// instruction is fixed:
///
///   [opcode] [specials...] [counters...] [inputs...] [outputs...]
///   [jumps...] [line?]
///
/// Counter words hold the length of the variable-size sections, so the
/// whole stream can be walked without knowing what any opcode does. Both
/// the disassembler and the emitter's closure transform are built on this.
#[derive(Debug, Clone)]
pub struct CodeIter<'a> {
    buffer: &'a [u16],
    stop: usize,
    pub offset: usize,
    pub round_total: usize,
    pub opcode: Opcode,
    pub specials: usize,
    pub counters: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub jumps: usize,
    pub line: usize,
}

impl<'a> CodeIter<'a> {
    pub fn new(buffer: &'a [u16], start: usize, stop: usize) -> Self {
        CodeIter {
            buffer,
            stop,
            offset: start,
            round_total: 0,
            opcode: Opcode::VmExit,
            specials: 0,
            counters: 0,
            inputs: 0,
            outputs: 0,
            jumps: 0,
            line: 0,
        }
    }

    pub fn buffer(&self) -> &'a [u16] {
        self.buffer
    }

    /// Step to the next instruction. Returns false at the end of the range
    /// or on a word that is not an opcode.
    pub fn next(&mut self) -> bool {
        self.offset += self.round_total;

        if self.offset >= self.stop {
            return false;
        }

        let op = match Opcode::try_from(self.buffer[self.offset]) {
            Ok(op) => op,
            Err(_) => return false,
        };

        self.opcode = op;
        self.specials = 0;
        self.counters = 0;
        self.inputs = 0;
        self.outputs = 0;
        self.jumps = 0;
        self.line = 0;

        let buffer = self.buffer;
        let offset = self.offset;
        let at = move |i: usize| buffer[offset + i] as usize;

        match op {
            Opcode::FastAssign | Opcode::Assign => {
                self.inputs = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 4;
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
            | Opcode::IntBitXor
            | Opcode::NumberAdd
            | Opcode::NumberMinus
            | Opcode::NumberMul
            | Opcode::NumberDiv
            | Opcode::CompareEq
            | Opcode::CompareNotEq
            | Opcode::CompareGreater
            | Opcode::CompareGreaterEq => {
                self.inputs = 2;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 5;
            }
            Opcode::UnaryNot | Opcode::UnaryMinus | Opcode::UnaryBitNot => {
                self.inputs = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::Jump => {
                self.jumps = 1;
                self.round_total = 2;
            }
            Opcode::JumpIf => {
                self.specials = 1;
                self.inputs = 1;
                self.jumps = 1;
                self.round_total = 4;
            }
            Opcode::JumpIfSet => {
                self.specials = 1;
                self.jumps = 1;
                self.round_total = 3;
            }
            Opcode::JumpIfNotClass => {
                self.specials = 1;
                self.inputs = 1;
                self.jumps = 1;
                self.round_total = 4;
            }
            Opcode::ForSetup => {
                self.specials = 1;
                self.inputs = 3;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 7;
            }
            Opcode::ForInteger => {
                self.inputs = 3;
                self.outputs = 1;
                self.jumps = 1;
                self.line = 1;
                self.round_total = 7;
            }
            Opcode::CallForeign | Opcode::CallNative | Opcode::CallRegister => {
                self.specials = 1;
                self.counters = 1;
                self.inputs = at(2);
                self.outputs = 1;
                self.line = 1;
                self.round_total = at(2) + 5;
            }
            Opcode::ReturnValue => {
                self.inputs = 1;
                self.line = 1;
                self.round_total = 3;
            }
            Opcode::ReturnUnit => {
                self.line = 1;
                self.round_total = 2;
            }
            Opcode::BuildList | Opcode::BuildTuple | Opcode::BuildHash => {
                self.counters = 1;
                self.inputs = at(1);
                self.outputs = 1;
                self.line = 1;
                self.round_total = at(1) + 4;
            }
            Opcode::BuildVariant => {
                self.specials = 1;
                self.counters = 1;
                self.inputs = at(2);
                self.outputs = 1;
                self.line = 1;
                self.round_total = at(2) + 5;
            }
            Opcode::SubscriptGet => {
                self.inputs = 2;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 5;
            }
            Opcode::SubscriptSet => {
                self.inputs = 3;
                self.line = 1;
                self.round_total = 5;
            }
            Opcode::GlobalGet => {
                self.specials = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::GlobalSet => {
                self.specials = 1;
                self.inputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::LoadReadonly
            | Opcode::LoadInteger
            | Opcode::LoadBoolean
            | Opcode::LoadByte
            | Opcode::LoadEmptyVariant => {
                self.specials = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::InstanceNew
            | Opcode::InstanceNewTagged
            | Opcode::InstanceNewSpeculative => {
                self.specials = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::PropertyGet => {
                self.specials = 1;
                self.inputs = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 5;
            }
            Opcode::PropertySet => {
                self.specials = 1;
                self.inputs = 2;
                self.line = 1;
                self.round_total = 5;
            }
            Opcode::CatchPush => {
                self.jumps = 1;
                self.line = 1;
                self.round_total = 3;
            }
            Opcode::CatchPop | Opcode::VmExit => {
                self.round_total = 1;
            }
            Opcode::ExceptionCatch => {
                self.specials = 1;
                self.jumps = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::ExceptionStore => {
                self.outputs = 1;
                self.line = 1;
                self.round_total = 3;
            }
            Opcode::ExceptionRaise => {
                self.inputs = 1;
                self.line = 1;
                self.round_total = 3;
            }
            Opcode::MatchDispatch => {
                self.specials = 2;
                self.counters = 1;
                self.jumps = at(3);
                self.line = 1;
                self.round_total = at(3) + 5;
            }
            Opcode::VariantDecompose => {
                self.specials = 1;
                self.counters = 1;
                self.outputs = at(2);
                self.line = 1;
                self.round_total = at(2) + 4;
            }
            Opcode::ClosureNew
            | Opcode::ClosureFunction
            | Opcode::ClosureGet => {
                self.specials = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::ClosureSet => {
                self.specials = 1;
                self.inputs = 1;
                self.line = 1;
                self.round_total = 4;
            }
            Opcode::DynamicCast => {
                self.specials = 1;
                self.inputs = 1;
                self.outputs = 1;
                self.line = 1;
                self.round_total = 5;
            }
            Opcode::Interpolation => {
                self.counters = 1;
                self.inputs = at(1);
                self.outputs = 1;
                self.line = 1;
                self.round_total = at(1) + 4;
            }
            Opcode::OptargDispatch => {
                self.specials = 1;
                self.counters = 1;
                self.jumps = at(2);
                self.round_total = at(2) + 3;
            }
        }

        true
    }

    /// Position of the first special word.
    pub fn special_start(&self) -> usize {
        self.offset + 1
    }

    pub fn input_start(&self) -> usize {
        self.offset + 1 + self.specials + self.counters
    }

    pub fn output_start(&self) -> usize {
        self.input_start() + self.inputs
    }

    pub fn jump_start(&self) -> usize {
        self.output_start() + self.outputs
    }

    /// Position of the trailing line word, if the opcode carries one.
    pub fn line_pos(&self) -> usize {
        self.jump_start() + self.jumps
    }
}
