//! The typed expression tree handed over by the front end. The tree
//! carries no result information; the emitter computes result registers
//! and types while lowering.

use crate::symtab::VarId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    LeftShift,
    RightShift,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Assign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    BitNot,
}

#[derive(Debug, Clone)]
pub struct Ast {
    pub kind: AstKind,
    pub line: u16,
}

#[derive(Debug, Clone)]
pub struct CallArg {
    /// Declared parameter position when the argument was keyed; None for
    /// plain positional arguments.
    pub keyword_pos: Option<u16>,
    pub expr: Ast,
}

#[derive(Debug, Clone)]
pub enum AstKind {
    Integer(i64),
    Double(f64),
    String(String),
    Boolean(bool),
    Byte(u8),
    /// A local, global, upvalue, or defined-function reference; the var's
    /// own data decides which read is emitted.
    Var(VarId),
    SelfVar,
    Binary {
        op: BinaryOp,
        left: Box<Ast>,
        right: Box<Ast>,
    },
    Unary {
        op: UnaryOp,
        value: Box<Ast>,
    },
    Call {
        target: Box<Ast>,
        args: Vec<CallArg>,
    },
    /// A super constructor call from within a class constructor. The
    /// subclass instance is reused through the frame chain at run time.
    SuperCall {
        parent_class: u16,
        args: Vec<Ast>,
    },
    /// Variant application. Not a call at run time.
    Variant {
        variant_class: u16,
        args: Vec<Ast>,
    },
    Subscript {
        source: Box<Ast>,
        index: Box<Ast>,
    },
    Property {
        source: Box<Ast>,
        index: u16,
    },
    BuildList(Vec<Ast>),
    BuildTuple(Vec<Ast>),
    BuildHash(Vec<(Ast, Ast)>),
    Interpolation(Vec<Ast>),
    /// Attempt to narrow a Dynamic back down; yields an Option.
    DynamicCast {
        source: Box<Ast>,
        class_id: u16,
    },
}

impl Ast {
    pub fn new(kind: AstKind, line: u16) -> Ast {
        Ast { kind, line }
    }

    pub fn integer(value: i64, line: u16) -> Ast {
        Ast::new(AstKind::Integer(value), line)
    }

    pub fn double(value: f64, line: u16) -> Ast {
        Ast::new(AstKind::Double(value), line)
    }

    pub fn string(value: &str, line: u16) -> Ast {
        Ast::new(AstKind::String(value.to_string()), line)
    }

    pub fn boolean(value: bool, line: u16) -> Ast {
        Ast::new(AstKind::Boolean(value), line)
    }

    pub fn var(id: VarId, line: u16) -> Ast {
        Ast::new(AstKind::Var(id), line)
    }

    pub fn binary(op: BinaryOp, left: Ast, right: Ast, line: u16) -> Ast {
        Ast::new(AstKind::Binary { op, left: Box::new(left), right: Box::new(right) }, line)
    }

    pub fn unary(op: UnaryOp, value: Ast, line: u16) -> Ast {
        Ast::new(AstKind::Unary { op, value: Box::new(value) }, line)
    }

    pub fn call(target: Ast, args: Vec<Ast>, line: u16) -> Ast {
        let args = args
            .into_iter()
            .map(|expr| CallArg { keyword_pos: None, expr })
            .collect();
        Ast::new(AstKind::Call { target: Box::new(target), args }, line)
    }

    pub fn call_keyed(target: Ast, args: Vec<CallArg>, line: u16) -> Ast {
        Ast::new(AstKind::Call { target: Box::new(target), args }, line)
    }

    pub fn subscript(source: Ast, index: Ast, line: u16) -> Ast {
        Ast::new(
            AstKind::Subscript { source: Box::new(source), index: Box::new(index) },
            line,
        )
    }
}
