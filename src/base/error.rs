#[derive(Debug, Display, Error)]
pub enum TurnstileError {
    #[display("entry not found for key: {_0}")]
    KeyNotFound(#[error(not(source))] String),

    #[display("entry already exists for key: {_0}")]
    KeyExists(#[error(not(source))] String),

    #[display("could not set new lock id, already locked: {_0}")]
    AlreadyLocked(#[error(not(source))] String),

    #[display("timed out waiting for lock acquisition")]
    AcquireTimedOut,

    #[display("entry was deleted before the lock could be acquired")]
    DeletedWhileWaiting,

    #[display("failed to encode entry as json: {_0}")]
    Json(serde_json::Error),

    #[display("dispatcher queue closed: {_0}")]
    ChannelClosed(#[error(not(source))] &'static str),
}

impl From<serde_json::Error> for TurnstileError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

pub type TurnstileResult<T> = Result<T, TurnstileError>;
