use crate::value::ConversionError;
use thiserror::Error;

/// Failures surfaced by member remotes, proxies and message handlers.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no message handler supplied and no default handler registered")]
    NoHandler,
    #[error("member remotes must be attached from within a tokio runtime")]
    NoRuntime,
    #[error("instance is already attached to a member remote")]
    AlreadyAttached,
    #[error("message handler is not connected")]
    NotConnected,
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("codec error: {message}")]
    Codec { message: String },
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("no member matches signature {signature}")]
    UnknownMember { signature: String },
    #[error("{signature} expects {expected} arguments, got {actual}")]
    ArgumentCount {
        signature: String,
        expected: usize,
        actual: usize,
    },
    #[error("invocation of {signature} failed: {message}")]
    Invocation { signature: String, message: String },
    #[error("remote method proxies support two participants, found {participants}")]
    TooManyParticipants { participants: usize },
    #[error("operation cancelled")]
    Cancelled,
    #[error("message stream closed")]
    ChannelClosed,
}

pub type RemoteResult<T> = Result<T, RemoteError>;
