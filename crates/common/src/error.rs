// Error types for pgtunnel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel connection error: {0}")]
    Connect(String),

    #[error("Channel open error: {0}")]
    ChannelOpen(String),

    #[error("Session I/O error: {0}")]
    SessionIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
