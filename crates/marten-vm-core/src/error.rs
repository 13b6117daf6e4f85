//! Error kinds and the exception-channel result types
//!
//! A failing primitive stores the thrown value in the runtime's single
//! `current_exception` slot and returns [`JsException`], a zero-sized
//! marker. The sentinel never travels inside values; `Result` is the only
//! carrier. Host-facing APIs convert the slot into [`EngineError`].

use thiserror::Error;

/// Marker for "an exception is pending in the runtime slot".
///
/// Deliberately carries nothing: the thrown value is owned by the runtime
/// so that propagation stays a plain `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exception raised")]
pub struct JsException;

/// Result of every fallible engine primitive.
pub type JsResult<T> = Result<T, JsException>;

/// The native error constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `EvalError`
    Eval,
    /// `RangeError`
    Range,
    /// `ReferenceError`
    Reference,
    /// `SyntaxError`
    Syntax,
    /// `TypeError`
    Type,
    /// `URIError`
    Uri,
    /// `InternalError` (stack overflow, interrupts)
    Internal,
    /// `AggregateError`
    Aggregate,
}

/// All error kinds, in class-id registration order.
pub const ERROR_KINDS: [ErrorKind; 8] = [
    ErrorKind::Eval,
    ErrorKind::Range,
    ErrorKind::Reference,
    ErrorKind::Syntax,
    ErrorKind::Type,
    ErrorKind::Uri,
    ErrorKind::Internal,
    ErrorKind::Aggregate,
];

impl ErrorKind {
    /// The constructor/prototype `name` property.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Eval => "EvalError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Uri => "URIError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::Aggregate => "AggregateError",
        }
    }

    /// Index into the per-realm error prototype array.
    pub fn index(self) -> usize {
        match self {
            ErrorKind::Eval => 0,
            ErrorKind::Range => 1,
            ErrorKind::Reference => 2,
            ErrorKind::Syntax => 3,
            ErrorKind::Type => 4,
            ErrorKind::Uri => 5,
            ErrorKind::Internal => 6,
            ErrorKind::Aggregate => 7,
        }
    }
}

/// Host-boundary error: what `eval`, module loading and job execution
/// surface to the embedder.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A JavaScript exception escaped to the host.
    #[error("{message}")]
    Exception {
        /// `"Name: message"` rendering of the thrown value
        message: String,
        /// Captured `stack` property, when the thrown value carried one
        stack: Option<String>,
    },
    /// The runtime's memory limit was exceeded.
    #[error("out of memory")]
    OutOfMemory,
    /// No compiler collaborator is installed for `eval`.
    #[error("no compiler installed")]
    NoCompiler,
}
