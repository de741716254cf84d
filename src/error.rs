use thiserror::Error;

/// Failures reported by the argument parser.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgError {
    #[error("required argument '{0}' is missing")]
    MissingRequired(String),

    #[error("expected {expected} but got \"{value}\" for parameter \"{param}\"")]
    TypeMismatch {
        param: String,
        expected: String,
        value: String,
    },

    #[error("invalid non-positional argument '{flag}', valid are: {valid}")]
    UnknownFlag { flag: String, valid: String },

    #[error("the provided argument '{flag}' is an abbreviation for {candidates}")]
    AmbiguousFlag { flag: String, candidates: String },

    #[error("value for parameter '{0}' expected")]
    MissingFlagValue(String),

    #[error("invalid argument '{0}', maybe too many arguments")]
    TooManyArguments(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Rejected class graph mutation; the graph was left unchanged.
    #[error("{0}")]
    Structural(String),

    #[error("{object}: unable to dispatch method '{method}'")]
    Unknown { object: String, method: String },

    #[error("{object}: unable to dispatch sub-method \"{sub}\" of {path}; valid are: {valid}")]
    UnknownSubMethod {
        object: String,
        path: String,
        sub: String,
        valid: String,
    },

    #[error("{object} {method}: guard {{{expr}}} raised an error: {message}")]
    Guard {
        object: String,
        method: String,
        expr: String,
        message: String,
    },

    #[error("{object}: assertion failed check: {{{expr}}} in proc '{method}'")]
    Assertion {
        object: String,
        method: String,
        expr: String,
    },

    #[error("{object} {method}: result \"{value}\" is not of type {expected}")]
    ReturnType {
        object: String,
        method: String,
        value: String,
        expected: String,
    },

    #[error("{object} {method}: {source}")]
    Argument {
        object: String,
        method: String,
        source: ArgError,
    },

    #[error("{0}")]
    Reclass(String),

    #[error("object {0} does not exist or was destroyed")]
    Destroyed(String),

    #[error("maximum dispatch depth of {0} exceeded")]
    Recursion(usize),

    #[error("{0}: no active method frame")]
    NoActiveFrame(String),

    #[error("invalid pattern \"{pattern}\": {message}")]
    Pattern { pattern: String, message: String },

    /// Error raised by a method body or collaborator.
    #[error("{0}")]
    Script(String),
}

impl DispatchError {
    pub fn script(msg: impl Into<String>) -> Self {
        DispatchError::Script(msg.into())
    }

    pub fn is_unknown(&self) -> bool {
        matches!(
            self,
            DispatchError::Unknown { .. } | DispatchError::UnknownSubMethod { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
