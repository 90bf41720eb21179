use std::rc::Rc;

use thiserror::Error;

/// Errors raised or emitted by a [`Stream`](crate::Stream).
///
/// Two of these are hard usage errors returned synchronously from the
/// write side ([`WriteAfterEnd`](StreamError::WriteAfterEnd)) or emitted
/// as an `error` event ([`WriteAfterDestroy`](StreamError::WriteAfterDestroy));
/// the rest describe teardown.  Errors cross listener boundaries as
/// [`SharedError`] so that every subscriber, and the latched last-error
/// replayed to late subscribers, observe the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The producer called `write` after `end` was accepted.
    #[error("write after end")]
    WriteAfterEnd,

    /// The producer called `write` on a destroyed stream.  This is not
    /// returned; it is emitted as an `error` event while the write call
    /// itself reports success.
    #[error("cannot call write after a stream was destroyed")]
    WriteAfterDestroy,

    /// The stream was torn down before completing.  Iterators and
    /// promises reject with this when `destroy` is called without a
    /// cause.
    #[error("stream destroyed")]
    Destroyed,

    /// Cancellation via an [`AbortSignal`](crate::AbortSignal) that was
    /// triggered without an explicit reason.
    #[error("the operation was aborted")]
    Aborted,

    /// A free-form error injected by the producer, or a caller-supplied
    /// abort reason.
    #[error("{0}")]
    Msg(String),
}

impl StreamError {
    /// Convenience constructor for [`StreamError::Msg`].
    pub fn msg(s: impl Into<String>) -> Self {
        StreamError::Msg(s.into())
    }
}

/// Reference-counted error value as delivered to listeners.
pub type SharedError = Rc<StreamError>;
