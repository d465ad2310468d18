//! Loop errors.

use std::{fmt::Display, io};

use strum::{AsRefStr, EnumMessage};

/// A specialized `Result` for loop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the loop itself.
///
/// Per-operation I/O failures (connection reset, disk full, ...) are not
/// represented here; they are delivered as [`std::io::Error`] through the
/// completion result of the affected operation.
#[derive(Debug, AsRefStr, EnumMessage)]
pub enum Error {
    /// `stop` was called on an operation that is not started.
    #[strum(message = "the operation is not active")]
    NotActive,
    /// `stop` was called on an operation that is already being cancelled.
    #[strum(message = "the operation is already being cancelled")]
    AlreadyCancelling,
    /// The operation id belongs to a different loop.
    #[strum(message = "the operation belongs to a different loop")]
    WrongLoop,
    /// A zero-length buffer or an otherwise unusable argument was passed to
    /// `start`.
    #[strum(message = "invalid argument")]
    InvalidArgument,
    /// The kernel queue object could not be created.
    #[strum(message = "kernel queue creation failed")]
    KernelInit(io::Error),
    /// A per-operation kernel registration failed.
    #[strum(message = "kernel registration failed")]
    KernelSubmit(io::Error),
    /// The kernel wait failed fatally.
    #[strum(message = "kernel wait failed")]
    KernelPoll(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.as_ref(), self.get_message().unwrap_or_default())?;
        match self {
            Self::KernelInit(e) | Self::KernelSubmit(e) | Self::KernelPoll(e) => {
                write!(f, " ({e})")
            }
            _ => Ok(()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::KernelInit(e) | Self::KernelSubmit(e) | Self::KernelPoll(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(other: Error) -> io::Error {
        match other {
            Error::KernelInit(e) | Error::KernelSubmit(e) | Error::KernelPoll(e) => e,
            Error::InvalidArgument => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
            _ => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_kind() {
        assert!(Error::NotActive.to_string().contains("NotActive"));
        let e = Error::KernelPoll(io::Error::from_raw_os_error(22));
        assert!(e.to_string().contains("KernelPoll"));
    }

    #[test]
    fn invalid_argument_maps_to_invalid_input() {
        let e: io::Error = Error::InvalidArgument.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
    }
}
