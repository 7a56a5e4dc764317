//! Result and error types for IR construction.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::ir::MetaData;

/// An error produced while building the IR.
///
/// Construction-time shape and type violations are programmer errors in the
/// expression builder; they are surfaced as recoverable errors rather than
/// assertions so the builder can report them against the user program. A
/// factory that fails installs nothing: the dag is left exactly as it was
/// before the call.
#[derive(Debug, Error)]
pub enum IrError {
    /// A factory was invoked with operands or parameters that violate the
    /// operator's construction rules (arity, rank, element type, or an
    /// operand that does not belong to the dag).
    #[error("invalid construction: {0}")]
    InvalidConstruction(String),

    /// A raster path carries a suffix no registered format recognizes.
    #[error("unknown raster file format: {}", .0.display())]
    FileFormatUnknown(PathBuf),

    /// An I/O failure while opening or accessing a raster file.
    #[error("raster file error on {}: {source}", .path.display())]
    FileIoError {
        /// Path of the file the operation failed on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Two operands that must agree on metadata do not.
    #[error("metadata mismatch: {lhs:?} vs {rhs:?}")]
    MetaDataMismatch {
        /// Metadata of the left-hand operand.
        lhs: MetaData,
        /// Metadata of the right-hand operand.
        rhs: MetaData,
    },
}

impl IrError {
    /// Shorthand for an [`IrError::InvalidConstruction`] with a formatted
    /// reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConstruction(reason.into())
    }
}

/// A convenient alias for a `Result` that uses [`IrError`].
pub type IrResult<T> = Result<T, IrError>;
