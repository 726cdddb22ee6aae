use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    // Framing Errors
    #[error("invalid frame type byte {0:#04x}, only unfragmented text frames are accepted")]
    InvalidFrameType(u8),

    #[error("client frame is not masked")]
    UnmaskedFrame,

    // Configuration Errors
    #[error("ERROR: server.config not found")]
    ConfigNotFound,

    #[error("invalid configuration: {source}")]
    InvalidConfig {
        #[from]
        source: config::ConfigError,
    },

    // Lifecycle Errors
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}
