use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownpourError {
    #[error("Peer protocol error: {0}")]
    ProtocolError(String),

    #[error("Peer connection error: {0}")]
    PeerError(String),

    #[error("Piece error: {0}")]
    PieceError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Core shut down")]
    Stopped,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DownpourError>;
