//! Error type for persistent transports.

use std::error;
use std::fmt::{Display, Formatter};

/// Error type for persistent transports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The transport was stopped before.
    ///
    /// The stop signal fires only once and cannot be re-armed.
    AlreadyStopped,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::AlreadyStopped => write!(f, "transport already stopped"),
        }
    }
}

impl error::Error for Error {}
