//! Codec errors.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The codec refused its parameters.
    #[display("codec could not be initialised")]
    Encoder,
    /// Input isn't valid for the codec it was decoded with. Retrying the same
    /// bytes won't help; the stored entry is damaged.
    #[display("invalid or corrupted data")]
    InvalidData,
    /// Name doesn't match any codec or level.
    #[display("unknown codec or level: {_0}")]
    Unknown(#[error(not(source))] String),
    /// Codec exists but this build was compiled without it.
    #[display("codec not compiled in: {_0}")]
    Disabled(#[error(not(source))] String),
    #[display("I/O error while encoding")]
    Io,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_io_is_retryable() {
        assert!(ErrorKind::Io.is_retryable());
        assert!(!ErrorKind::InvalidData.is_retryable());
        assert!(!ErrorKind::Unknown("lz4".into()).is_retryable());
    }

    #[test]
    fn test_display_names_the_input() {
        assert_eq!(ErrorKind::Unknown("lz4".into()).to_string(), "unknown codec or level: lz4");
    }
}
