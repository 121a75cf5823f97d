use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("cache operation failed")]
    Cache,
    /// Some entries could not be compacted; the rest were.
    #[display("{failed} entries could not be compacted")]
    Compaction { failed: usize },
    /// Verification found and removed corrupt entries.
    #[display("{corrupt} corrupt entries removed")]
    Corrupt { corrupt: usize },
}
