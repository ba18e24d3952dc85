use thiserror::Error;

#[derive(Error, Debug)]
pub enum MimirError {
    #[error("I/O error: {0}")]
    Io(String),

    /// A located source is no longer where it was found
    #[error("Source missing: {0}")]
    MissingSource(String),

    #[error("Parsing error: {0}")]
    Parsing(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Invalid message format: {0}")]
    Format(String),

    #[error("Invalid locale: {0}")]
    Locale(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MimirError {
    fn from(err: std::io::Error) -> Self {
        MimirError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MimirError>;
