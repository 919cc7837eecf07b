pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod symbols;

pub use compile::{CompileOutput, Compiler, CompilerConfig};
pub use compile_error::{CompileError, CompileFailure, CompileWarning, Diagnostic, Diagnostics};
pub use ir::Program;
pub use op::Op;
