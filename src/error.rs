use thiserror::Error;

/// Errors surfaced by the box tree, its controller and the disk buffer.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller misuse that is detectable immediately: a dimension index out
    /// of range, a zero-sized event when configuring the cache, and so on.
    /// Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// File open/extend/read/write failure in the disk buffer. At setup time
    /// this is recoverable (the tree stays in-memory); once file backing is
    /// established a flush or load failure is fatal to that operation and
    /// must reach the caller, since dropping evicted data silently would
    /// corrupt the dataset.
    #[error("I/O failure while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed serialized controller state.
    #[error("parse error: {0}")]
    Parse(String),

    /// Internal invariant violation; indicates a bug in the caller or the
    /// tree itself, not a recoverable condition.
    #[error("logic error: {0}")]
    Logic(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
