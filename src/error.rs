use thiserror::Error;

/// Result type alias for tether operations
pub type TetherResult<T> = Result<T, TetherError>;

/// Error types for the tether library
#[derive(Error, Debug)]
pub enum TetherError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settings could not be loaded or deserialized
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Malformed text in an options file or option value
    #[error("Parse error: {0}")]
    Parse(String),

    /// A forwarding rule could not be parsed
    #[error("Can't parse {input:?} as a forwarding port or pair of ports: {reason}")]
    InvalidForwarding { input: String, reason: String },

    /// The same local port was asked to forward to two different destinations
    #[error("Duplicate local port {port}: requested {requested}, already assigned to {assigned}")]
    DuplicatePort {
        port: u16,
        requested: u16,
        assigned: u16,
    },

    /// No descriptor is registered under this name
    #[error("Unknown ssh option: {0}")]
    UnknownOption(String),

    /// A value does not fit the option's declared type
    #[error("Invalid value for {option}: {value:?}")]
    InvalidValue { option: String, value: String },

    /// A stored value cannot be rendered with the option's declared kind
    #[error("Type {kind} is not supported for option {option} (value = {value})")]
    UnsupportedType {
        option: String,
        kind: String,
        value: String,
    },

    /// The external command could not be started
    #[error("Launch error: {0}")]
    Launch(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl From<eyre::Report> for TetherError {
    fn from(err: eyre::Report) -> Self {
        TetherError::Other(err.to_string())
    }
}
