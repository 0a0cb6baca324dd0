use thiserror::Error;

/// Raised while turning an expression string into bytecode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expression is empty")]
    Empty,
    #[error("unknown symbol `{symbol}` at position {position}")]
    UnknownSymbol { symbol: String, position: usize },
    #[error("unknown function `{name}` at position {position}")]
    UnknownFunction { name: String, position: usize },
    #[error("function `{name}` at position {position} must be followed by `(`")]
    MissingArguments { name: String, position: usize },
    #[error("unexpected character `{found}` at position {position}")]
    UnexpectedCharacter { found: char, position: usize },
    #[error("malformed number `{text}` at position {position}")]
    InvalidNumber { text: String, position: usize },
    #[error("unexpected {found} at position {position}")]
    UnexpectedToken { found: String, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("missing `)` for the `(` at position {position}")]
    UnclosedParen { position: usize },
    #[error("`{0}` is not a valid symbol name")]
    InvalidName(String),
    #[error("symbol `{0}` is declared more than once")]
    DuplicateSymbol(String),
    #[error("expression is {length} characters long, the limit is {limit}")]
    TooLong { length: usize, limit: usize },
    #[error("expression nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Raised when a compiled expression has no finite value at the requested point.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum EvaluationError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("{function} is undefined at {argument}")]
    Domain {
        function: &'static str,
        argument: f64,
    },
    #[error("{operation} produced a non-finite value")]
    NonFinite { operation: &'static str },
    #[error("expected {expected} inputs, got {found}")]
    InputLength { expected: usize, found: usize },
    #[error("malformed bytecode: stack underflow")]
    StackUnderflow,
}

/// Errors surfaced by the public phase-plane API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaneError {
    #[error("cannot parse d{variable}/dt = `{expression}`: {source}")]
    Parse {
        variable: String,
        expression: String,
        #[source]
        source: ParseError,
    },
    #[error("invalid symbol table: {0}")]
    Symbols(#[source] ParseError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("expected {expected} values, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("only 1D and 2D systems are supported, got dimension {0}")]
    UnsupportedDimension(usize),
    #[error("invalid axis range [{min}, {max}]: bounds must be finite with max > min")]
    InvalidLimits { min: f64, max: f64 },
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("parameter `{name}` must be finite, got {value}")]
    InvalidParameter { name: String, value: f64 },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("gallery error: {0}")]
    Gallery(String),
}

impl PlaneError {
    /// The underlying parse failure, if this error came from compilation.
    pub fn as_parse_error(&self) -> Option<&ParseError> {
        match self {
            PlaneError::Parse { source, .. } | PlaneError::Symbols(source) => Some(source),
            _ => None,
        }
    }
}

pub type Result<T, E = PlaneError> = std::result::Result<T, E>;
