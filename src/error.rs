/// Error raised by a remote operation and sent between peers.
///
/// `kind` is a stable identifier chosen by the producer of the error, for
/// example `"IllegalStateException"` or one of the dispatch error kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl ToString, message: impl ToString) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}
