use std::cell::RefCell;
use std::rc::Rc;

use crate::error::SharedError;

/// Identifier of one registered listener, returned by the `on`/`once`
/// family and accepted by [`Stream::off`](crate::Stream::off).
///
/// Ids are unique per stream, never reused, and remain valid (as a
/// no-op) after the listener has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Build an id from a raw value.  External [`Writable`]
    /// implementations use this to hand out their own drain
    /// subscription tokens.
    ///
    /// [`Writable`]: crate::Writable
    pub fn from_raw(raw: u64) -> Self {
        ListenerId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// The named event channels of a [`Stream`](crate::Stream).
///
/// `Data`, `Error` and `Abort` carry payloads and are subscribed
/// through their typed registration methods; the remaining channels
/// are payload-free and go through [`Stream::on`](crate::Stream::on).
/// `Destroyed` is the internal teardown marker: it fires in place of
/// `Error` when a stream is destroyed without a cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Readable,
    Data,
    Error,
    Abort,
    Drain,
    Resume,
    End,
    Prefinish,
    Finish,
    Close,
    Destroyed,
}

/// One subscription table entry.  `once` entries are consumed when a
/// dispatch snapshot is taken, so a handler that re-emits from inside
/// its own invocation cannot fire itself twice.
struct Entry<F: ?Sized> {
    id: ListenerId,
    once: bool,
    f: Rc<RefCell<F>>,
}

/// A single named channel: ordered listeners, emit-to-all semantics.
pub(crate) struct Channel<F: ?Sized> {
    entries: Vec<Entry<F>>,
}

impl<F: ?Sized> Default for Channel<F> {
    fn default() -> Self {
        Channel { entries: Vec::new() }
    }
}

impl<F: ?Sized> Channel<F> {
    pub(crate) fn add(&mut self, id: ListenerId, once: bool, f: Rc<RefCell<F>>) {
        self.entries.push(Entry { id, once, f });
    }

    /// Remove by id; unknown ids are ignored.
    pub(crate) fn remove(&mut self, id: ListenerId) {
        self.entries.retain(|e| e.id != id);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handlers to invoke for one emission.  Once-listeners are
    /// dropped from the table here, before dispatch, and listener
    /// mutations made by the handlers themselves affect only later
    /// emissions.
    pub(crate) fn snapshot(&mut self) -> Vec<Rc<RefCell<F>>> {
        let fs: Vec<_> = self.entries.iter().map(|e| e.f.clone()).collect();
        self.entries.retain(|e| !e.once);
        fs
    }

}

/// Per-stream subscription tables, one channel per [`EventKind`].
pub(crate) struct Registry<T> {
    next_id: u64,
    pub data: Channel<dyn FnMut(&T)>,
    pub error: Channel<dyn FnMut(&SharedError)>,
    pub abort: Channel<dyn FnMut(&SharedError)>,
    pub readable: Channel<dyn FnMut()>,
    pub drain: Channel<dyn FnMut()>,
    pub resume: Channel<dyn FnMut()>,
    pub end: Channel<dyn FnMut()>,
    pub prefinish: Channel<dyn FnMut()>,
    pub finish: Channel<dyn FnMut()>,
    pub close: Channel<dyn FnMut()>,
    pub destroyed: Channel<dyn FnMut()>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            next_id: 0,
            data: Channel::default(),
            error: Channel::default(),
            abort: Channel::default(),
            readable: Channel::default(),
            drain: Channel::default(),
            resume: Channel::default(),
            end: Channel::default(),
            prefinish: Channel::default(),
            finish: Channel::default(),
            close: Channel::default(),
            destroyed: Channel::default(),
        }
    }
}

impl<T> Registry<T> {
    pub(crate) fn next_id(&mut self) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The payload-free channel for `kind`.
    ///
    /// # Panics
    ///
    /// Panics for the payload channels; those have typed registration.
    pub(crate) fn void(&mut self, kind: EventKind) -> &mut Channel<dyn FnMut()> {
        match kind {
            EventKind::Readable => &mut self.readable,
            EventKind::Drain => &mut self.drain,
            EventKind::Resume => &mut self.resume,
            EventKind::End => &mut self.end,
            EventKind::Prefinish => &mut self.prefinish,
            EventKind::Finish => &mut self.finish,
            EventKind::Close => &mut self.close,
            EventKind::Destroyed => &mut self.destroyed,
            EventKind::Data | EventKind::Error | EventKind::Abort => {
                panic_payload_channel(kind)
            }
        }
    }

    pub(crate) fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Data => self.data.len(),
            EventKind::Error => self.error.len(),
            EventKind::Abort => self.abort.len(),
            EventKind::Readable => self.readable.len(),
            EventKind::Drain => self.drain.len(),
            EventKind::Resume => self.resume.len(),
            EventKind::End => self.end.len(),
            EventKind::Prefinish => self.prefinish.len(),
            EventKind::Finish => self.finish.len(),
            EventKind::Close => self.close.len(),
            EventKind::Destroyed => self.destroyed.len(),
        }
    }

    pub(crate) fn remove(&mut self, kind: EventKind, id: ListenerId) {
        match kind {
            EventKind::Data => self.data.remove(id),
            EventKind::Error => self.error.remove(id),
            EventKind::Abort => self.abort.remove(id),
            _ => self.void(kind).remove(id),
        }
    }

    pub(crate) fn clear(&mut self, kind: EventKind) {
        match kind {
            EventKind::Data => self.data.clear(),
            EventKind::Error => self.error.clear(),
            EventKind::Abort => self.abort.clear(),
            _ => self.void(kind).clear(),
        }
    }

    pub(crate) fn clear_all(&mut self) {
        self.data.clear();
        self.error.clear();
        self.abort.clear();
        self.readable.clear();
        self.drain.clear();
        self.resume.clear();
        self.end.clear();
        self.prefinish.clear();
        self.finish.clear();
        self.close.clear();
        self.destroyed.clear();
    }
}

#[inline(never)]
#[cold]
#[track_caller]
fn panic_payload_channel(kind: EventKind) -> ! {
    panic!("{kind:?} carries a payload; use its typed registration method")
}
