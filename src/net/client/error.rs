//! Error type for upstream exchanges.

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

use crate::net::util::is_os_limit;

/// Error type for upstream exchanges.
///
/// A successful exchange is simply `Ok(_)`.
#[derive(Clone, Debug)]
pub enum Error {
    /// No answer arrived before the network timeout.
    Timeout,

    /// The exchange failed in a way that will not improve by retrying the
    /// same server.
    PermanentError(Option<Arc<io::Error>>),

    /// The process ran out of some local resource such as descriptors.
    OsLimit(Arc<io::Error>),

    /// An answer arrived after too many near misses and was discarded.
    Spoofed,
}

impl Error {
    /// Classifies an I/O error that occurred while setting up a socket.
    pub(crate) fn from_setup(err: io::Error) -> Self {
        if is_os_limit(&err) {
            Error::OsLimit(Arc::new(err))
        } else {
            Error::PermanentError(Some(Arc::new(err)))
        }
    }

    /// Creates a permanent error from an I/O error.
    pub(crate) fn permanent(err: io::Error) -> Self {
        Error::PermanentError(Some(Arc::new(err)))
    }

    /// Returns whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::Timeout => write!(f, "timeout waiting for response"),
            Error::PermanentError(Some(err)) => {
                write!(f, "exchange failed: {}", err)
            }
            Error::PermanentError(None) => write!(f, "exchange failed"),
            Error::OsLimit(err) => {
                write!(f, "out of local resources: {}", err)
            }
            Error::Spoofed => {
                write!(f, "answer rejected after too many near misses")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Timeout => None,
            Error::PermanentError(Some(e)) => Some(e),
            Error::PermanentError(None) => None,
            Error::OsLimit(e) => Some(e),
            Error::Spoofed => None,
        }
    }
}

//============ Tests =========================================================
