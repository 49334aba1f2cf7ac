//! Container error types.

use mpyc_bytecode::DecodeError;
use thiserror::Error;

/// Errors raised while reading or writing `.mpy` data.
///
/// All of them mean the input is incompatible or corrupt; none are caused
/// by the source program.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("not a valid .mpy file (magic byte {found:#04x})")]
    BadMagic { found: u8 },

    #[error("incompatible .mpy version (expected: {expected}, found: {found})")]
    UnsupportedVersion { expected: u8, found: u8 },

    #[error("unexpected end of input while reading {what}")]
    Truncated { what: &'static str },

    #[error("corrupt .mpy data: {0}")]
    Corrupt(String),

    #[error("unsupported code kind {kind}")]
    UnsupportedKind { kind: u8 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Attach the name of the field being read to a low-level decode error.
    pub(crate) fn reading(what: &'static str) -> impl Fn(DecodeError) -> ContainerError {
        move |err| match err {
            DecodeError::Truncated => ContainerError::Truncated { what },
            other => ContainerError::Corrupt(format!("{} in {}", other, what)),
        }
    }
}
