use thiserror::Error;

#[derive(Debug, Error)]
pub enum HuddleError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("room is full: at most {max} participants")]
    CapacityExceeded { max: usize },
    #[error("not in a room")]
    NotInRoom,
    #[error("media error: {0}")]
    Media(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid response: {0}")]
    Decode(String),
}
