use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The instruction set of the VM. Instructions are sequences of 16-bit
/// words; the first word of each instruction is one of these. The layout of
/// the remaining words is fixed per opcode and described by `CodeIter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    // Copy one register to another. The fast form is written when the
    // emitter knows the value cannot be shared (no ref bookkeeping).
    FastAssign,
    Assign,

    // Fast-path integer-only operations.
    IntAdd,
    IntMinus,
    IntModulo,
    IntMul,
    IntDiv,
    IntLeftShift,
    IntRightShift,
    IntBitAnd,
    IntBitOr,
    IntBitXor,

    // Integer/Double ops that check which of the two is present.
    NumberAdd,
    NumberMinus,
    NumberMul,
    NumberDiv,

    // Typed comparisons over Integer, Double, String, and ByteString.
    // General equality falls through to the class equality walk.
    CompareEq,
    CompareNotEq,
    CompareGreater,
    CompareGreaterEq,

    UnaryNot,
    UnaryMinus,
    UnaryBitNot,

    // Jump operands are encoded as distances relative to the operand's own
    // word, so a backward jump is a (wrapping) negative u16.
    Jump,
    JumpIf,
    JumpIfSet,
    JumpIfNotClass,

    ForSetup,
    ForInteger,

    CallForeign,
    CallNative,
    CallRegister,

    ReturnValue,
    ReturnUnit,

    BuildList,
    BuildTuple,
    BuildHash,
    BuildVariant,

    SubscriptGet,
    SubscriptSet,

    GlobalGet,
    GlobalSet,

    LoadReadonly,
    LoadInteger,
    LoadBoolean,
    LoadByte,
    LoadEmptyVariant,

    InstanceNew,
    InstanceNewTagged,
    InstanceNewSpeculative,

    PropertyGet,
    PropertySet,

    CatchPush,
    CatchPop,
    ExceptionCatch,
    ExceptionStore,
    ExceptionRaise,

    MatchDispatch,
    VariantDecompose,

    ClosureNew,
    ClosureFunction,
    ClosureGet,
    ClosureSet,

    DynamicCast,

    Interpolation,

    OptargDispatch,

    // Terminate __main__. Also spoofed when a foreign function re-enters the
    // VM so that the inner dispatch loop unwinds back out.
    VmExit,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::FastAssign => "fast_assign",
            Opcode::Assign => "assign",
            Opcode::IntAdd => "int_add",
            Opcode::IntMinus => "int_minus",
            Opcode::IntModulo => "int_modulo",
            Opcode::IntMul => "int_mul",
            Opcode::IntDiv => "int_div",
            Opcode::IntLeftShift => "int_left_shift",
            Opcode::IntRightShift => "int_right_shift",
            Opcode::IntBitAnd => "int_bitwise_and",
            Opcode::IntBitOr => "int_bitwise_or",
            Opcode::IntBitXor => "int_bitwise_xor",
            Opcode::NumberAdd => "number_add",
            Opcode::NumberMinus => "number_minus",
            Opcode::NumberMul => "number_mul",
            Opcode::NumberDiv => "number_divide",
            Opcode::CompareEq => "compare_eq",
            Opcode::CompareNotEq => "compare_not_eq",
            Opcode::CompareGreater => "compare_greater",
            Opcode::CompareGreaterEq => "compare_greater_eq",
            Opcode::UnaryNot => "unary_not",
            Opcode::UnaryMinus => "unary_minus",
            Opcode::UnaryBitNot => "unary_bitwise_not",
            Opcode::Jump => "jump",
            Opcode::JumpIf => "jump_if",
            Opcode::JumpIfSet => "jump_if_set",
            Opcode::JumpIfNotClass => "jump_if_not_class",
            Opcode::ForSetup => "for_setup",
            Opcode::ForInteger => "for_integer",
            Opcode::CallForeign => "call_foreign",
            Opcode::CallNative => "call_native",
            Opcode::CallRegister => "call_register",
            Opcode::ReturnValue => "return_value",
            Opcode::ReturnUnit => "return_unit",
            Opcode::BuildList => "build_list",
            Opcode::BuildTuple => "build_tuple",
            Opcode::BuildHash => "build_hash",
            Opcode::BuildVariant => "build_variant",
            Opcode::SubscriptGet => "subscript_get",
            Opcode::SubscriptSet => "subscript_set",
            Opcode::GlobalGet => "global_get",
            Opcode::GlobalSet => "global_set",
            Opcode::LoadReadonly => "load_readonly",
            Opcode::LoadInteger => "load_integer",
            Opcode::LoadBoolean => "load_boolean",
            Opcode::LoadByte => "load_byte",
            Opcode::LoadEmptyVariant => "load_empty_variant",
            Opcode::InstanceNew => "instance_new",
            Opcode::InstanceNewTagged => "instance_new_tagged",
            Opcode::InstanceNewSpeculative => "instance_new_speculative",
            Opcode::PropertyGet => "property_get",
            Opcode::PropertySet => "property_set",
            Opcode::CatchPush => "catch_push",
            Opcode::CatchPop => "catch_pop",
            Opcode::ExceptionCatch => "exception_catch",
            Opcode::ExceptionStore => "exception_store",
            Opcode::ExceptionRaise => "exception_raise",
            Opcode::MatchDispatch => "match_dispatch",
            Opcode::VariantDecompose => "variant_decompose",
            Opcode::ClosureNew => "closure_new",
            Opcode::ClosureFunction => "closure_function",
            Opcode::ClosureGet => "closure_get",
            Opcode::ClosureSet => "closure_set",
            Opcode::DynamicCast => "dynamic_cast",
            Opcode::Interpolation => "interpolation",
            Opcode::OptargDispatch => "optarg_dispatch",
            Opcode::VmExit => "vm_exit",
        }
    }
}
