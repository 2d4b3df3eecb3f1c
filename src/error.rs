//! Error types for topology discovery, server selection and pooling.
use bson;
use connstring::ServerAddress;

use std::{error, fmt, io, sync};
use std::sync::Arc;

/// The result type for all fallible operations in this crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The error type for topology, pool and connection operations.
#[derive(Debug)]
pub enum Error {
    /// A caller supplied an invalid argument or configuration value.
    ArgumentError(String),
    /// A generic operation failed.
    OperationError(String),
    /// The server replied with something this client could not use.
    ResponseError(String),
    /// A socket-level failure.
    IoError(io::Error),
    /// An internal lock was poisoned by a panicking thread.
    LockError,
    /// A command document could not be encoded.
    EncoderError(bson::EncoderError),
    /// A reply document could not be decoded.
    DecoderError(bson::DecoderError),
    /// A wait-queue or connect deadline elapsed. Callers may retry.
    ConnectionTimeout(String),
    /// Every candidate instance failed to connect. `causes` holds the
    /// per-address errors that were recorded during the attempt.
    ConnectionFailed {
        message: String,
        causes: Vec<(ServerAddress, Arc<Error>)>,
    },
    /// A server's role or replica set name contradicts the configuration.
    TopologyMismatch(String),
    /// Too many callers are already waiting for a pooled connection.
    PoolExhausted(String),
    /// A connection or topology invariant was violated. Always a bug.
    InternalInvariant(String),
    /// An operation was attempted on a connection that is not open.
    ConnectionClosed(String),
}

impl Error {
    /// Returns true if this error describes an elapsed deadline rather than
    /// a failed connection.
    pub fn is_timeout(&self) -> bool {
        match *self {
            Error::ConnectionTimeout(_) => true,
            Error::IoError(ref err) => {
                err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock
            }
            _ => false,
        }
    }

    /// Builds an aggregate connection failure. The message names the first
    /// failing address and its reason.
    pub fn connection_failed(prefix: &str, causes: Vec<(ServerAddress, Arc<Error>)>) -> Error {
        let message = match causes.first() {
            Some(&(ref address, ref err)) => format!("{}: {} ({}).", prefix, err, address),
            None => format!("{}.", prefix),
        };

        Error::ConnectionFailed {
            message: message,
            causes: causes,
        }
    }

    /// Returns the per-address errors attached to an aggregate failure.
    pub fn causes(&self) -> &[(ServerAddress, Arc<Error>)] {
        match *self {
            Error::ConnectionFailed { ref causes, .. } => causes,
            _ => &[],
        }
    }
}

impl<'a> From<&'a str> for Error {
    fn from(s: &str) -> Error {
        Error::OperationError(s.to_owned())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::OperationError(s)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<bson::EncoderError> for Error {
    fn from(err: bson::EncoderError) -> Error {
        Error::EncoderError(err)
    }
}

impl From<bson::DecoderError> for Error {
    fn from(err: bson::DecoderError) -> Error {
        Error::DecoderError(err)
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::LockError
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ArgumentError(ref inner) |
            Error::OperationError(ref inner) |
            Error::ResponseError(ref inner) |
            Error::ConnectionTimeout(ref inner) |
            Error::TopologyMismatch(ref inner) |
            Error::PoolExhausted(ref inner) |
            Error::ConnectionClosed(ref inner) => inner.fmt(fmt),
            Error::InternalInvariant(ref inner) => write!(fmt, "Internal error: {}", inner),
            Error::IoError(ref inner) => inner.fmt(fmt),
            Error::LockError => fmt.write_str("Internal lock poisoned."),
            Error::EncoderError(ref inner) => inner.fmt(fmt),
            Error::DecoderError(ref inner) => inner.fmt(fmt),
            Error::ConnectionFailed { ref message, .. } => message.fmt(fmt),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IoError(ref inner) => Some(inner),
            Error::EncoderError(ref inner) => Some(inner),
            Error::DecoderError(ref inner) => Some(inner),
            Error::ConnectionFailed { ref causes, .. } => {
                causes.first().map(|&(_, ref err)| &**err as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}
