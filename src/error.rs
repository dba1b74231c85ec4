use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Config(toml::de::Error),
    InvalidConfig(String),
    /// A syscall the reactor cannot run without failed; the server stops.
    Fatal(&'static str, io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Config(e) => write!(f, "failed to parse config: {}", e),
            ServerError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            ServerError::Fatal(call, e) => write!(f, "{} failed: {}", call, e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) | ServerError::Fatal(_, e) => Some(e),
            ServerError::Config(e) => Some(e),
            ServerError::InvalidConfig(_) => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> ServerError {
        ServerError::Io(err)
    }
}

impl From<toml::de::Error> for ServerError {
    fn from(err: toml::de::Error) -> ServerError {
        ServerError::Config(err)
    }
}
