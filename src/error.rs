use thiserror::Error;

/// Bridge specific errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("no {0} handler registered")]
    NoHandler(&'static str),

    #[error("stack engine error: {0}")]
    Engine(String),

    #[error("configuration error: {0}")]
    Config(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
