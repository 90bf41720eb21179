use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{SharedError, StreamError};

/// External cancellation token for a [`Stream`](crate::Stream).
///
/// A signal is a cloneable handle onto one shared cancellation state.
/// Hand a clone to [`Options::signal`](crate::Options) at construction
/// and keep another to trigger the abort.  A signal that has already
/// fired aborts the stream immediately at construction.
///
/// Aborting is a latch: the first call wins, later calls are ignored,
/// and every subscribed stream observes the same reason.
///
/// ```
/// use minipipe::{AbortSignal, Options, Stream, StreamError};
///
/// let signal = AbortSignal::new();
/// let stream = Stream::with_options(Options {
///     signal: Some(signal.clone()),
///     ..Options::default()
/// });
/// signal.abort_with(StreamError::msg("operator hung up"));
/// assert!(stream.aborted());
/// assert!(stream.destroyed());
/// ```
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Rc<RefCell<SignalInner>>,
}

#[derive(Default)]
struct SignalInner {
    reason: Option<SharedError>,
    subs: Vec<Box<dyn FnMut(SharedError)>>,
}

impl AbortSignal {
    /// Create a fresh, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal with the generic
    /// [`Aborted`](StreamError::Aborted) reason.
    pub fn abort(&self) {
        self.abort_with(StreamError::Aborted);
    }

    /// Trigger the signal with an explicit reason.  Ignored if the
    /// signal has already fired.
    pub fn abort_with(&self, reason: StreamError) {
        let (reason, subs) = {
            let mut inner = self.inner.borrow_mut();
            if inner.reason.is_some() {
                return;
            }
            let reason: SharedError = Rc::new(reason);
            inner.reason = Some(reason.clone());
            (reason, std::mem::take(&mut inner.subs))
        };
        // Subscribers run with the borrow released; they are free to
        // inspect the signal or abort other streams.
        for mut f in subs {
            f(reason.clone());
        }
    }

    /// Whether the signal has fired.
    pub fn aborted(&self) -> bool {
        self.inner.borrow().reason.is_some()
    }

    /// The abort reason, once fired.
    pub fn reason(&self) -> Option<SharedError> {
        self.inner.borrow().reason.clone()
    }

    pub(crate) fn subscribe(&self, mut f: Box<dyn FnMut(SharedError)>) {
        let already = self.inner.borrow().reason.clone();
        if let Some(reason) = already {
            f(reason);
            return;
        }
        self.inner.borrow_mut().subs.push(f);
    }
}
