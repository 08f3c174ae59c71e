use std::io;

use thiserror::Error;

/// Errors produced anywhere in the boot console pipeline, from transport
/// I/O up through protocol framing and CLI configuration.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("transport I/O error: {0}")]
    Transport(#[source] io::Error),

    #[error("file error: {0}")]
    File(#[source] io::Error),

    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("protocol timed out waiting for a response")]
    ProtocolTimeout,

    #[error("aborted by user")]
    UserAbort,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),
}

pub type Result<T> = std::result::Result<T, BootError>;
