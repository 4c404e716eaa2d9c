//! Error handling utils.
//!
//! System-call failures are recovered locally: the failing operation logs,
//! returns an [`Error`] and leaves no registration behind. Invariant
//! violations (resuming a running fiber, arming the same event twice) are
//! programmer errors and panic instead. A panic inside a fiber body is
//! contained at the fiber trampoline and never surfaces as an `Error`.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("invalid value for config variable {name}: {source}")]
    Config {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}
