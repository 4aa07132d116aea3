//! User-visible compiler errors.
//!
//! Only two things can legitimately fail from the user's point of view:
//! reading/writing files and feeding the compiler malformed IR. Everything
//! downstream of a well-formed module is an internal invariant, and passes
//! assert those instead of returning errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl CompileError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        CompileError::Parse { line, message: message.into() }
    }
}
