use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    Io(String),
    Format(String),
    Cache(String),
    Proxy(String),
    Validation(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "failed to read configuration: {e}"),
            Error::Format(e) => write!(f, "configuration file format error: {e}"),
            Error::Cache(e) => write!(f, "cache configuration error: {e}"),
            Error::Proxy(e) => write!(f, "proxy configuration error: {e}"),
            Error::Validation(e) => write!(f, "validation configuration error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error.to_string())
    }
}
