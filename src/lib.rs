//! A single-pass bytecode compiler for a small dynamically-typed scripting language.
//!
//! This crate turns source text into a [value::Function] holding a [chunk::Chunk] of bytecode.
//! It does not execute that bytecode: running it, and disassembling it for debugging, are the
//! responsibility of a separate runtime crate this one is built to hand its output to.

pub mod chunk;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod scanner;
pub mod value;

mod with_try_from_u8;

/// The type returned by various functions that parse, compile, and run Lox code.
/// This is the standard [std::result::Result], but the error is always
/// [error::InterpretationError]. This type alias is generic for the return type, however.
///
/// ```
/// fn compile() -> rlox::Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, error::InterpretationError>;

/// Re-exports common items.
///
/// Since Part III of Crafting Interpreters is written in C, which lacks explicit features for
/// scoping across modules, many items are assumed to be globally-visible. Therefore, we export the
/// most common "global" items here:
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::compiler::compile;
    pub use crate::error::InterpretationError;
    pub use crate::gc::ActiveGC;
    pub use crate::scanner::{Lexeme, Scanner, Token};
    pub use crate::value::{Function, Value};
}
