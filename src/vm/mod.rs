pub mod errors;
pub mod machine;

pub use errors::{ErrorKind, LilyError, LilyResult, OpResult, Raise, TraceEntry};
pub use machine::Vm;
