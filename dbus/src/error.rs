use std::io;

use thiserror::Error;

/// Reasons the authentication handshake can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("server rejected EXTERNAL authentication: '{0}'")]
    Rejected(String),
    #[error("unexpected server response: '{0}'")]
    UnexpectedResponse(String),
    #[error("server response exceeds {0} bytes without a line terminator")]
    LineTooLong(usize),
    #[error("connection closed during authentication")]
    Eof,
    #[error("server guid '{server}' does not match address guid '{address}'")]
    GuidMismatch { server: String, address: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Environment variable {0} is not set")]
    MissingAddress(&'static str),
    #[error("Invalid bus address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Could not connect to '{address}'")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Frame of {size} bytes exceeds the maximum of {max} bytes")]
    OversizedFrame { size: usize, max: usize },
    #[error("Invalid method: '{0}'")]
    InvalidMethod(String),
    #[error("Arguments with signature '{actual}' do not match expected signature '{expected}'")]
    InvalidArgs { expected: String, actual: String },
    #[error("{name}: {message}")]
    MethodError { name: String, message: String },
    #[error("Timeout waiting for the reply to serial {0}")]
    Timeout(u32),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection is not initialized")]
    NotInitialized,
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl Error {
    /// True for errors raised while opening or authenticating a connection.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Error::MissingAddress(_)
                | Error::InvalidAddress { .. }
                | Error::Connect { .. }
                | Error::Auth(_)
        )
    }

    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Error::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
