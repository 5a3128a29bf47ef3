use std::fmt;

/// The builtin error classes that runtime raises resolve to. Each maps to a
/// catchable class in the symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DivisionByZeroError,
    IndexError,
    KeyError,
    ValueError,
    RuntimeError,
    IOError,
    FormatError,
    BadTypecastError,
    RecursionError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::DivisionByZeroError => "DivisionByZeroError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::KeyError => "KeyError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::IOError => "IOError",
            ErrorKind::FormatError => "FormatError",
            ErrorKind::BadTypecastError => "BadTypecastError",
            ErrorKind::RecursionError => "RecursionError",
        }
    }
}

/// One line of traceback: module path, qualified function name, line.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub path: String,
    pub name: String,
    pub line: u16,
}

#[derive(Debug, Clone)]
pub enum LilyError {
    /// The emitter rejected a program. Carries the offending line.
    Syntax { message: String, line: u16 },
    /// A raise that escaped every catch. The class id is the raised class
    /// (builtin errors and user exception classes alike).
    Uncaught {
        class_id: u16,
        class_name: String,
        message: String,
        traceback: Vec<TraceEntry>,
    },
}

impl LilyError {
    /// Render the message the way the embedder shows it: the class and
    /// message, then one traceback line per frame.
    pub fn render(&self) -> String {
        match self {
            LilyError::Syntax { message, line } => {
                format!("SyntaxError: {}\n    from line {}\n", message, line)
            }
            LilyError::Uncaught { class_name, message, traceback, .. } => {
                let mut out = format!("{}: {}\n", class_name, message);
                if !traceback.is_empty() {
                    out.push_str("Traceback:\n");
                    for entry in traceback {
                        out.push_str(&format!(
                            "    from {}:{}: in {}\n",
                            entry.path, entry.line, entry.name
                        ));
                    }
                }
                out
            }
        }
    }
}

impl fmt::Display for LilyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LilyError::Syntax { message, line } => {
                write!(f, "SyntaxError at line {}: {}", line, message)
            }
            LilyError::Uncaught { class_name, message, .. } => {
                write!(f, "{}: {}", class_name, message)
            }
        }
    }
}

impl std::error::Error for LilyError {}

pub type LilyResult<T> = Result<T, LilyError>;

/// An in-flight raise inside the VM. This is plain data: the unwinder walks
/// the catch chain with it and either resumes in an except branch or turns
/// it into a `LilyError::Uncaught` for the embedder.
#[derive(Debug, Clone)]
pub struct Raise {
    pub class_id: u16,
    pub message: String,
    /// Set when the raise came from a user `raise` with a live exception
    /// instance.
    pub raised_value: Option<crate::value::Value>,
}

pub type OpResult<T> = Result<T, Box<Raise>>;
