//! Provides [InterpretationError], the error that most things return.
use thiserror::Error;

/// Any error that can occur during interpretation.
#[derive(Debug, Error)]
pub enum InterpretationError {
    /// A compile-time error, such as a syntax error, or a name error.
    #[error("compile-time error")]
    CompileError,
    /// A runtime error, such as a type error or exception.
    ///
    /// This compiler never constructs this variant itself (it has no runtime); it's kept so that
    /// downstream crates sharing this error type don't need a second, incompatible error enum.
    #[error("runtime error")]
    RuntimeError,
}
