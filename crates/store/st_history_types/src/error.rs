use crate::codec::CodecError;

// ---

/// The error taxonomy shared by every history back-end.
#[derive(thiserror::Error, Debug)]
pub enum HistoryError {
    #[error("time {t} is outside the history range [{start}, {end}]")]
    TimeOutOfRange { t: i64, start: i64, end: i64 },

    #[error("the shadow state-system cannot create or modify attributes")]
    AttributeTreeImmutable,

    #[error(transparent)]
    Corrupt(#[from] CodecError),

    #[error("operation on a disposed history")]
    Disposed,

    #[error("history replay was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HistoryResult<T> = ::std::result::Result<T, HistoryError>;
