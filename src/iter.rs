use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::Stream as AsyncStream;

use crate::chunk::{Chunk, Item};
use crate::error::{SharedError, StreamError};
use crate::event::{EventKind, ListenerId};
use crate::stream::{Stream, TapEvent};

// ---------------------------------------------------------------------
// Synchronous iteration

/// Synchronous iterator over buffered items; see [`Stream::iter`].
pub struct Iter<T: Item> {
    stream: Stream<T>,
    stopped: Rc<Cell<bool>>,
    tap: Option<ListenerId>,
}

impl<T: Item> Stream<T> {
    /// Iterate synchronously: each `next` pulls one buffered item via
    /// [`read`](Stream::read) and the iterator finishes the first time
    /// nothing is buffered.  The stream ending, erroring, or being
    /// destroyed also finishes it (and pauses the stream).
    pub fn iter(&self) -> Iter<T> {
        self.clear_discarded();
        let stopped = Rc::new(Cell::new(false));
        let st = stopped.clone();
        let weak = self.downgrade();
        let tap = self.add_tap(move |ev| match ev {
            TapEvent::End | TapEvent::Error(_) | TapEvent::Destroyed => {
                if !st.get() {
                    st.set(true);
                    if let Some(s) = weak.upgrade() {
                        s.pause();
                    }
                }
            }
            TapEvent::Data(_) => {}
        });
        Iter { stream: self.clone(), stopped, tap: Some(tap) }
    }
}

impl<T: Item> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.stopped.get() {
            return None;
        }
        match self.stream.read() {
            Some(item) => Some(item),
            None => {
                self.stop();
                None
            }
        }
    }
}

impl<T: Item> Iter<T> {
    fn stop(&mut self) {
        if !self.stopped.get() {
            self.stopped.set(true);
            self.stream.pause();
        }
        if let Some(id) = self.tap.take() {
            self.stream.remove_tap(id);
        }
    }
}

impl<T: Item> Drop for Iter<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<'a, T: Item> IntoIterator for &'a Stream<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Iter<T> {
        self.iter()
    }
}

// ---------------------------------------------------------------------
// Asynchronous iteration

enum IterSignal<T> {
    Data(T),
    End,
    Error(SharedError),
    Destroyed,
}

/// Asynchronous iterator; see [`Stream::iter_async`].
///
/// Implements [`futures::Stream`], yielding `Ok` items and surfacing
/// stream errors (or a causeless destroy) as one final `Err` item.
pub struct AsyncIter<T: Item> {
    stream: Stream<T>,
    stopped: bool,
    waiting: Option<ListenerId>,
    outcome: Rc<RefCell<Option<IterSignal<T>>>>,
}

impl<T: Item> Stream<T> {
    /// Iterate asynchronously.  Buffered items come back immediately;
    /// otherwise the iterator restarts flow, waits for the next item,
    /// and pauses the stream again after yielding it, so each poll
    /// pulls at most one item.  Dropping the iterator pauses the
    /// stream.
    pub fn iter_async(&self) -> AsyncIter<T> {
        self.clear_discarded();
        AsyncIter {
            stream: self.clone(),
            stopped: false,
            waiting: None,
            outcome: Rc::new(RefCell::new(None)),
        }
    }
}

impl<T: Item> AsyncIter<T> {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stream.pause();
        }
        if let Some(id) = self.waiting.take() {
            self.stream.remove_tap(id);
        }
    }
}

impl<T: Item> AsyncIter<T> {
    fn settle(&mut self, signal: IterSignal<T>) -> Poll<Option<Result<T, SharedError>>> {
        if let Some(id) = self.waiting.take() {
            self.stream.remove_tap(id);
        }
        match signal {
            IterSignal::Data(item) => Poll::Ready(Some(Ok(item))),
            IterSignal::End => {
                self.stop();
                Poll::Ready(None)
            }
            IterSignal::Error(e) => {
                self.stop();
                Poll::Ready(Some(Err(e)))
            }
            IterSignal::Destroyed => {
                self.stop();
                Poll::Ready(Some(Err(Rc::new(StreamError::Destroyed))))
            }
        }
    }
}

impl<T: Item> AsyncStream for AsyncIter<T> {
    type Item = Result<T, SharedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.stream.tick();
        if this.stopped {
            return Poll::Ready(None);
        }
        let taken = this.outcome.borrow_mut().take();
        if let Some(signal) = taken {
            return this.settle(signal);
        }
        if this.waiting.is_some() {
            if this.stream.buffer_length() > 0 {
                // Flow was stopped from outside while we waited; pull
                // from the buffer like a fresh pull would, and fall
                // through to re-subscribe if it comes up empty.
                if let Some(id) = this.waiting.take() {
                    this.stream.remove_tap(id);
                }
                if let Some(item) = this.stream.read() {
                    return Poll::Ready(Some(Ok(item)));
                }
            } else {
                this.stream.add_waker(cx.waker());
                return Poll::Pending;
            }
        }
        if this.waiting.is_none() {
            if let Some(item) = this.stream.read() {
                return Poll::Ready(Some(Ok(item)));
            }
            if this.stream.eof_flag() {
                this.stop();
                return Poll::Ready(None);
            }
            // Nothing buffered and no EOF: subscribe for the next
            // event and restart flow.  One item at a time: the tap
            // pauses the stream again as soon as data lands.
            let outcome = this.outcome.clone();
            let weak = this.stream.downgrade();
            let id = this.stream.add_tap(move |ev| {
                let mut slot = outcome.borrow_mut();
                if slot.is_some() {
                    return;
                }
                match ev {
                    TapEvent::Data(d) => {
                        *slot = Some(IterSignal::Data(d.clone()));
                        drop(slot);
                        if let Some(s) = weak.upgrade() {
                            s.pause();
                        }
                    }
                    TapEvent::End => *slot = Some(IterSignal::End),
                    TapEvent::Error(e) => *slot = Some(IterSignal::Error(e.clone())),
                    TapEvent::Destroyed => *slot = Some(IterSignal::Destroyed),
                }
            });
            this.waiting = Some(id);
            this.stream.resume_for_iteration();
            // The resume may have completed synchronously.
            let taken = this.outcome.borrow_mut().take();
            if let Some(signal) = taken {
                return this.settle(signal);
            }
        }
        this.stream.add_waker(cx.waker());
        Poll::Pending
    }
}

impl<T: Item> Drop for AsyncIter<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------
// Promise

/// Future for stream completion; see [`Stream::promise`].
pub struct Done<T: Item> {
    stream: Stream<T>,
    state: Rc<RefCell<Option<Result<(), SharedError>>>>,
    tap: Option<ListenerId>,
}

impl<T: Item> Stream<T> {
    /// Future resolving once the `end` event fires and rejecting on
    /// `error` or destroy.  Attaching after the fact replays like a
    /// listener would: a latched error rejects immediately, an
    /// already-emitted end resolves immediately.
    pub fn promise(&self) -> Done<T> {
        let state: Rc<RefCell<Option<Result<(), SharedError>>>> = Rc::new(RefCell::new(None));
        if let Some(er) = self.latched_error() {
            *state.borrow_mut() = Some(Err(er));
        } else if self.emitted_end() {
            *state.borrow_mut() = Some(Ok(()));
        }
        let tap = if state.borrow().is_some() {
            None
        } else {
            let st = state.clone();
            Some(self.add_tap(move |ev| {
                let mut slot = st.borrow_mut();
                if slot.is_some() {
                    return;
                }
                match ev {
                    TapEvent::End => *slot = Some(Ok(())),
                    TapEvent::Error(e) => *slot = Some(Err(e.clone())),
                    TapEvent::Destroyed => {
                        *slot = Some(Err(Rc::new(StreamError::Destroyed)))
                    }
                    TapEvent::Data(_) => {}
                }
            }))
        };
        Done { stream: self.clone(), state, tap }
    }
}

impl<T: Item> Future for Done<T> {
    type Output = Result<(), SharedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.stream.tick();
        let done = this.state.borrow_mut().take();
        if let Some(result) = done {
            if let Some(id) = this.tap.take() {
                this.stream.remove_tap(id);
            }
            return Poll::Ready(result);
        }
        this.stream.add_waker(cx.waker());
        Poll::Pending
    }
}

impl<T: Item> Drop for Done<T> {
    fn drop(&mut self) {
        if let Some(id) = self.tap.take() {
            self.stream.remove_tap(id);
        }
    }
}

// ---------------------------------------------------------------------
// Aggregation

/// Everything a stream emitted, plus the aggregate data length (0 for
/// object-mode streams).
#[derive(Debug)]
pub struct Collected<T> {
    pub items: Vec<T>,
    pub data_length: usize,
}

/// Future for [`Stream::collect`].
pub struct Collect<T: Item> {
    done: Done<T>,
    stream: Stream<T>,
    items: Rc<RefCell<Vec<T>>>,
    data_length: Rc<Cell<usize>>,
    listener: Option<ListenerId>,
}

impl<T: Item> Stream<T> {
    /// Consume the stream to completion, returning every emitted item
    /// in order.  Attaches a `data` listener (starting flow) and waits
    /// for [`promise`](Stream::promise).
    pub fn collect(&self) -> Collect<T> {
        let done = self.promise();
        let items: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::new()));
        let data_length = Rc::new(Cell::new(0usize));
        let object = self.object_mode();
        let (it, dl) = (items.clone(), data_length.clone());
        let listener = self.on_data(move |item: &T| {
            if !object {
                dl.set(dl.get() + item.size());
            }
            it.borrow_mut().push(item.clone());
        });
        Collect {
            done,
            stream: self.clone(),
            items,
            data_length,
            listener: Some(listener),
        }
    }
}

impl<T: Item> Future for Collect<T> {
    type Output = Result<Collected<T>, SharedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.done).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let items = std::mem::take(&mut *this.items.borrow_mut());
                Poll::Ready(Ok(Collected { items, data_length: this.data_length.get() }))
            }
        }
    }
}

impl<T: Item> Drop for Collect<T> {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.stream.off(EventKind::Data, id);
        }
    }
}

/// Future for [`Stream::concat`].
pub struct Concat {
    collect: Collect<Chunk>,
    text: bool,
}

impl Stream<Chunk> {
    /// Collect and join into one chunk: a single string in text mode,
    /// one contiguous byte buffer otherwise.
    ///
    /// # Panics
    ///
    /// Panics on an object-mode stream, where joining items has no
    /// meaning.
    pub fn concat(&self) -> Concat {
        if self.object_mode() {
            panic_concat_objects();
        }
        Concat { text: self.encoding().is_some(), collect: self.collect() }
    }
}

impl Future for Concat {
    type Output = Result<Chunk, SharedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.collect).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(collected)) => {
                let chunk = if collected.items.is_empty() {
                    if this.text {
                        Chunk::Text(String::new())
                    } else {
                        Chunk::Bytes(bytes::Bytes::new())
                    }
                } else {
                    Chunk::merge(collected.items)
                };
                Poll::Ready(Ok(chunk))
            }
        }
    }
}

#[inline(never)]
#[cold]
#[track_caller]
fn panic_concat_objects() -> ! {
    panic!("cannot concat an object-mode stream")
}
