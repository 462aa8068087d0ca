use thiserror::Error;

/// Common error type for the NSQ exporter.
#[derive(Debug, Error)]
pub enum Error {
    /// The daemon could not be reached, timed out, or answered with a
    /// non-success HTTP status.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The status document was not valid JSON or did not match the
    /// snapshot shape.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short classification used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Decode(_) => "decode",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Result type alias using the exporter's Error.
pub type Result<T> = std::result::Result<T, Error>;
