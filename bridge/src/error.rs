use core::fmt;

/// Recoverable failures of the bridge runtime.
///
/// Broken invariants (double dispose, out-of-order frame pops, use of a
/// disposed handle) are not errors; they panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The heap could not satisfy an allocation even after a collection.
    OutOfMemory { requested: usize },
    /// Rejected runtime or heap settings.
    InvalidSettings(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            Error::InvalidSettings(reason) => write!(f, "invalid settings: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = core::result::Result<T, E>;
