use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::task::Waker;

use encoding_rs::Encoding;

use crate::buf::Buf;
use crate::chunk::{Chunk, Item, Mode};
use crate::error::{SharedError, StreamError};
use crate::event::{EventKind, ListenerId, Registry};
use crate::pipe::{PipeOptions, PipeRecord, Writable};
use crate::signal::AbortSignal;

/// Construction options for a [`Stream`].
///
/// `deferred` queues data/endish emissions and write callbacks on a
/// per-stream FIFO instead of running them inside the mutating call;
/// the queue drains on [`Stream::tick`] and whenever one of the
/// crate's futures is polled.  `signal` attaches an external
/// cancellation token.  `encoding` selects text mode and only applies
/// to [`Stream<Chunk>`] constructors; object-mode constructors reject
/// it.
#[derive(Clone, Default)]
pub struct Options {
    pub deferred: bool,
    pub signal: Option<AbortSignal>,
    pub encoding: Option<&'static Encoding>,
}

/// An event to emit on a [`Stream`], with its payload.
///
/// Most events are produced by the stream itself; `emit` exists so
/// producers can inject `Error` (or any other event) directly, with
/// the same override semantics the stream applies internally.
#[derive(Debug)]
pub enum Event<T> {
    Readable,
    Data(T),
    Error(SharedError),
    Abort(SharedError),
    Drain,
    Resume,
    End,
    Prefinish,
    Finish,
    Close,
    /// Internal teardown marker, emitted by `destroy` in place of
    /// `Error` when no cause is given.
    Destroyed,
}

/// Work queued by deferred mode, drained FIFO by [`Stream::tick`].
enum Deferred<T> {
    EmitData(T),
    EmitEndTail,
    Resume,
    Callback(Box<dyn FnOnce()>),
    ErrorReplay(SharedError, Rc<RefCell<dyn FnMut(&SharedError)>>),
}

/// Internal notification channel for iterators and promises.
///
/// Taps are separate from the public registry: they fire even when a
/// cancellation signal absorbs the public `error` event, and
/// `remove_all(None)` does not disturb them, so an iteration in
/// progress keeps working.
pub(crate) enum TapEvent<'a, T> {
    Data(&'a T),
    End,
    Error(&'a SharedError),
    Destroyed,
}

// Not derived: derive would demand `T: Copy`, but the variants only
// hold references.
impl<T> Clone for TapEvent<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TapEvent<'_, T> {}

struct TapEntry<T> {
    id: ListenerId,
    f: Rc<RefCell<dyn FnMut(TapEvent<'_, T>)>>,
}

struct Inner<T: Item> {
    mode: Mode,
    buffer: Buf<T>,
    flowing: bool,
    paused: bool,
    discarded: bool,
    eof: bool,
    emitting_end: bool,
    emitted_end: bool,
    closed: bool,
    destroyed: bool,
    aborted: bool,
    writable: bool,
    readable: bool,
    deferred: bool,
    draining: bool,
    has_signal: bool,
    emitted_error: Option<SharedError>,
    registry: Registry<T>,
    taps: Vec<TapEntry<T>>,
    pipes: Vec<PipeRecord<T>>,
    queue: VecDeque<Deferred<T>>,
    wakers: Vec<Waker>,
    close_hook: Option<Box<dyn FnOnce()>>,
}

/// In-process producer-to-consumer stream.
///
/// A `Stream` accepts writes, buffers them while nobody is consuming,
/// and hands them to consumers — `data` listeners, piped destinations,
/// iterators — in FIFO order as soon as they appear.  The payload is
/// chosen by the type parameter: [`Stream<Chunk>`] carries byte
/// buffers or decoded strings (see [`Stream::bytes`] and
/// [`Stream::text`]), while any other [`Item`] type runs in object
/// mode (see [`Stream::objects`]).
///
/// The handle is a cheap clone onto shared single-threaded state; all
/// operations run to completion synchronously and re-entrancy from
/// inside event handlers is allowed.  There is no internal locking and
/// the type is deliberately not thread-safe.
///
/// ```
/// use minipipe::Stream;
///
/// let s = Stream::bytes();
/// s.write(b"hello").unwrap();
/// s.end_with(b" world").unwrap();
/// let out = futures::executor::block_on(s.concat()).unwrap();
/// assert_eq!(out.as_bytes(), b"hello world");
/// ```
pub struct Stream<T: Item = Chunk> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Item> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream { inner: self.inner.clone() }
    }
}

impl<T: Item> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Stream")
            .field("flowing", &inner.flowing)
            .field("paused", &inner.paused)
            .field("buffer_length", &inner.buffer.len())
            .field("eof", &inner.eof)
            .field("emitted_end", &inner.emitted_end)
            .field("destroyed", &inner.destroyed)
            .finish()
    }
}

pub(crate) struct WeakStream<T: Item> {
    inner: Weak<RefCell<Inner<T>>>,
}

impl<T: Item> WeakStream<T> {
    pub(crate) fn upgrade(&self) -> Option<Stream<T>> {
        self.inner.upgrade().map(|inner| Stream { inner })
    }
}

// ---------------------------------------------------------------------
// Construction

impl Stream<Chunk> {
    /// Byte-mode stream: items are byte buffers, sized by byte length.
    pub fn bytes() -> Self {
        Self::with_options(Options::default())
    }

    /// Text-mode stream: byte writes are decoded incrementally into
    /// strings of the given encoding, sized by string length.
    pub fn text(encoding: &'static Encoding) -> Self {
        Self::with_options(Options { encoding: Some(encoding), ..Options::default() })
    }

    /// Byte- or text-mode stream, depending on `Options::encoding`.
    pub fn with_options(opts: Options) -> Self {
        let mode = match opts.encoding {
            Some(e) => Mode::text(e),
            None => Mode::bytes(),
        };
        Self::build(mode, opts)
    }
}

impl<T: Item> Stream<T> {
    /// Object-mode stream: items pass through untouched and the size
    /// metric is one per item.
    pub fn objects() -> Self {
        Self::objects_with(Options::default())
    }

    /// Object-mode stream with options.
    ///
    /// # Panics
    ///
    /// Panics if `Options::encoding` is set; an encoding and object
    /// mode are mutually exclusive.
    pub fn objects_with(opts: Options) -> Self {
        if opts.encoding.is_some() {
            panic_encoding_with_objects();
        }
        Self::build(Mode::object(), opts)
    }

    fn build(mode: Mode, opts: Options) -> Self {
        let object = mode.is_object();
        let stream = Stream {
            inner: Rc::new(RefCell::new(Inner {
                buffer: Buf::new(object),
                mode,
                flowing: false,
                paused: false,
                discarded: false,
                eof: false,
                emitting_end: false,
                emitted_end: false,
                closed: false,
                destroyed: false,
                aborted: false,
                writable: true,
                readable: true,
                deferred: opts.deferred,
                draining: false,
                has_signal: opts.signal.is_some(),
                emitted_error: None,
                registry: Registry::default(),
                taps: Vec::new(),
                pipes: Vec::new(),
                queue: VecDeque::new(),
                wakers: Vec::new(),
                close_hook: None,
            })),
        };
        if let Some(signal) = opts.signal {
            match signal.reason() {
                Some(reason) => stream.abort_now(reason),
                None => {
                    let weak = stream.downgrade();
                    signal.subscribe(Box::new(move |reason| {
                        if let Some(stream) = weak.upgrade() {
                            stream.abort_now(reason);
                        }
                    }));
                }
            }
        }
        stream
    }

    pub(crate) fn downgrade(&self) -> WeakStream<T> {
        WeakStream { inner: Rc::downgrade(&self.inner) }
    }
}

// ---------------------------------------------------------------------
// Observable flags

impl<T: Item> Stream<T> {
    /// Whether data is auto-emitted as soon as it arrives.
    pub fn flowing(&self) -> bool {
        self.inner.borrow().flowing
    }

    /// Whether the stream was explicitly paused.
    pub fn paused(&self) -> bool {
        self.inner.borrow().paused
    }

    /// Aggregate size of the buffered items: bytes, string length, or
    /// item count depending on mode.
    pub fn buffer_length(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    /// False once `end` has been accepted.
    pub fn writable(&self) -> bool {
        self.inner.borrow().writable
    }

    /// False once the `end` event has fired.
    pub fn readable(&self) -> bool {
        self.inner.borrow().readable
    }

    pub fn destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    pub fn emitted_end(&self) -> bool {
        self.inner.borrow().emitted_end
    }

    /// Whether this stream counts items instead of measuring them.
    pub fn object_mode(&self) -> bool {
        self.inner.borrow().mode.is_object()
    }

    /// The declared encoding, in text mode.
    pub fn encoding(&self) -> Option<&'static Encoding> {
        self.inner.borrow().mode.encoding()
    }

    /// Whether emissions are deferred to [`tick`](Stream::tick).
    pub fn deferred(&self) -> bool {
        self.inner.borrow().deferred
    }

    pub fn pipe_count(&self) -> usize {
        self.inner.borrow().pipes.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.borrow().registry.count(kind)
    }

    pub(crate) fn eof_flag(&self) -> bool {
        self.inner.borrow().eof
    }

    pub(crate) fn clear_discarded(&self) {
        self.inner.borrow_mut().discarded = false;
    }

    pub(crate) fn latched_error(&self) -> Option<SharedError> {
        self.inner.borrow().emitted_error.clone()
    }

    /// Install the teardown hook: invoked once by `destroy` unless a
    /// `close` was already requested.  This is the seam subclass-like
    /// wrappers use to release external resources.
    pub fn set_close_hook(&self, f: impl FnOnce() + 'static) {
        self.inner.borrow_mut().close_hook = Some(Box::new(f));
    }
}

// ---------------------------------------------------------------------
// Write side

impl<T: Item> Stream<T> {
    /// Write one item.
    ///
    /// Returns the current flowing state: `false` asks the producer to
    /// stop writing until `drain`.  Writes to an aborted stream are
    /// silently dropped (returning `false`); writes to a destroyed
    /// stream emit an `error` event and report `true`.
    ///
    /// # Errors
    ///
    /// [`StreamError::WriteAfterEnd`] once `end` has been accepted.
    pub fn write(&self, chunk: impl Into<T::Input>) -> Result<bool, StreamError> {
        self.write_impl(chunk.into(), None)
    }

    /// Like [`write`](Stream::write), invoking `cb` once the write has
    /// been taken — synchronously, or on the next drain in deferred
    /// mode.
    pub fn write_then(
        &self,
        chunk: impl Into<T::Input>,
        cb: impl FnOnce() + 'static,
    ) -> Result<bool, StreamError> {
        self.write_impl(chunk.into(), Some(Box::new(cb)))
    }

    fn write_impl(
        &self,
        input: T::Input,
        cb: Option<Box<dyn FnOnce()>>,
    ) -> Result<bool, StreamError> {
        {
            let inner = self.inner.borrow();
            if inner.aborted {
                return Ok(false);
            }
            if inner.eof {
                return Err(StreamError::WriteAfterEnd);
            }
        }
        if self.inner.borrow().destroyed {
            self.emit(Event::Error(Rc::new(StreamError::WriteAfterDestroy)));
            return Ok(true);
        }

        let object = self.inner.borrow().mode.is_object();

        // Zero-length chunks never enter the pipeline.
        if !object && T::input_is_empty(&input) {
            if self.inner.borrow().buffer.len() != 0 {
                self.emit(Event::Readable);
            }
            self.run_cb(cb);
            return Ok(self.inner.borrow().flowing);
        }

        let item = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            T::normalize(input, &mut inner.mode)
        };

        if !object {
            // Anything already buffered goes out first, keeping FIFO
            // order, without a trailing drain.
            let (flowing, nonempty) = {
                let inner = self.inner.borrow();
                (inner.flowing, !inner.buffer.is_empty())
            };
            if flowing && nonempty {
                self.flush(true);
            }
        }

        if self.inner.borrow().flowing {
            self.emit(Event::Data(item));
        } else {
            self.inner.borrow_mut().buffer.push(item);
        }

        if self.inner.borrow().buffer.len() != 0 {
            self.emit(Event::Readable);
        }

        self.run_cb(cb);
        Ok(self.inner.borrow().flowing)
    }

    fn run_cb(&self, cb: Option<Box<dyn FnOnce()>>) {
        if let Some(cb) = cb {
            if self.inner.borrow().deferred {
                self.enqueue(Deferred::Callback(cb));
            } else {
                cb();
            }
        }
    }

    /// Signal end-of-input.  Any buffered data still drains to
    /// consumers before the endish events fire.
    pub fn end(&self) {
        let _ = self.end_impl(None, None);
    }

    /// Write a final item, then end.
    ///
    /// # Errors
    ///
    /// [`StreamError::WriteAfterEnd`] if `end` was already accepted.
    pub fn end_with(&self, chunk: impl Into<T::Input>) -> Result<(), StreamError> {
        self.end_impl(Some(chunk.into()), None)
    }

    /// End, invoking `cb` when the `end` event fires (immediately, if
    /// it already has).
    pub fn end_then(&self, cb: impl FnOnce() + 'static) {
        let _ = self.end_impl(None, Some(Box::new(cb)));
    }

    /// Write a final item, then end, invoking `cb` on the `end` event.
    pub fn end_with_then(
        &self,
        chunk: impl Into<T::Input>,
        cb: impl FnOnce() + 'static,
    ) -> Result<(), StreamError> {
        self.end_impl(Some(chunk.into()), Some(Box::new(cb)))
    }

    fn end_impl(
        &self,
        chunk: Option<T::Input>,
        cb: Option<Box<dyn FnOnce()>>,
    ) -> Result<(), StreamError> {
        if let Some(chunk) = chunk {
            self.write_impl(chunk, None)?;
        }
        if let Some(cb) = cb {
            let mut cb = Some(cb);
            self.once(EventKind::End, move || {
                if let Some(cb) = cb.take() {
                    cb();
                }
            });
        }
        let check = {
            let mut inner = self.inner.borrow_mut();
            inner.eof = true;
            inner.writable = false;
            inner.flowing || !inner.paused
        };
        if check {
            self.maybe_emit_end();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Read side

impl<T: Item> Stream<T> {
    /// Pull the next item, or everything that is buffered.
    ///
    /// In object mode this shifts exactly one item.  In byte/text mode
    /// the buffer is first coalesced, so the whole pending content
    /// comes back as a single chunk.  Returns `None` when there is
    /// nothing buffered or the stream is destroyed.
    pub fn read(&self) -> Option<T> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return None;
            }
            inner.discarded = false;
        }
        let chunk = {
            let mut inner = self.inner.borrow_mut();
            if inner.buffer.len() == 0 {
                None
            } else {
                if !inner.mode.is_object() && inner.buffer.count() > 1 {
                    inner.buffer.coalesce();
                }
                inner.buffer.shift()
            }
        };
        match chunk {
            None => {
                self.maybe_emit_end();
                None
            }
            Some(chunk) => self.read_finish(chunk),
        }
    }

    fn read_finish(&self, chunk: T) -> Option<T> {
        self.emit(Event::Data(chunk.clone()));
        let (empty, eof) = {
            let inner = self.inner.borrow();
            (inner.buffer.is_empty(), inner.eof)
        };
        if empty && !eof {
            self.emit(Event::Drain);
        }
        self.maybe_emit_end();
        Some(chunk)
    }
}

impl Stream<Chunk> {
    /// Pull exactly `n` units from the buffer, splitting the head
    /// chunk if needed.
    ///
    /// Returns `None` — without touching the buffer — when `n` is 0 or
    /// exceeds [`buffer_length`](Stream::buffer_length).  On an
    /// object-mode stream `n` is ignored and one whole item is
    /// shifted, exactly like [`read`](Stream::read).
    ///
    /// # Panics
    ///
    /// Panics if the split would land inside a multi-byte character of
    /// a text chunk.
    pub fn read_n(&self, n: usize) -> Option<Chunk> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return None;
            }
            inner.discarded = false;
        }
        let chunk = {
            let mut inner = self.inner.borrow_mut();
            if inner.mode.is_object() {
                // n is ignored in object mode: one whole item.
                inner.buffer.shift()
            } else {
                let blen = inner.buffer.len();
                if blen == 0 || n == 0 || n > blen {
                    None
                } else {
                    if inner.buffer.count() > 1 {
                        inner.buffer.coalesce();
                    }
                    let head_len = inner.buffer.head_mut().map(|h| h.len()).unwrap_or(0);
                    if n == head_len {
                        inner.buffer.shift()
                    } else {
                        let piece = inner.buffer.head_mut().map(|h| h.split_to(n));
                        inner.buffer.took(n);
                        piece
                    }
                }
            }
        };
        match chunk {
            None => {
                self.maybe_emit_end();
                None
            }
            Some(chunk) => self.read_finish(chunk),
        }
    }
}

// ---------------------------------------------------------------------
// Consumption mode

impl<T: Item> Stream<T> {
    /// Stop auto-emission; data accumulates until a consumer pulls or
    /// flow restarts.  Also clears the discard latch.
    pub fn pause(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.flowing = false;
        inner.paused = true;
        inner.discarded = false;
        log::trace!("pause");
    }

    /// Start flowing.  With no consumer attached this latches the
    /// discard state: data keeps being accepted and dropped on the
    /// floor until a consumer arrives or `pause` is called.
    pub fn resume(&self) {
        self.resume_inner(false);
    }

    pub(crate) fn resume_for_iteration(&self) {
        self.resume_inner(true);
    }

    fn resume_inner(&self, for_iteration: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            if !for_iteration && inner.registry.data.is_empty() && inner.pipes.is_empty() {
                inner.discarded = true;
            }
            inner.paused = false;
            inner.flowing = true;
            log::trace!("resume (discarded={})", inner.discarded);
        }
        self.emit(Event::Resume);
        let (nonempty, eof) = {
            let inner = self.inner.borrow();
            (!inner.buffer.is_empty(), inner.eof)
        };
        if nonempty {
            self.flush(false);
        } else if eof {
            self.maybe_emit_end();
        } else {
            self.emit(Event::Drain);
        }
    }

    /// Drain the buffer to consumers while flow continues.
    fn flush(&self, no_drain: bool) {
        loop {
            let chunk = { self.inner.borrow_mut().buffer.shift() };
            let chunk = match chunk {
                Some(chunk) => chunk,
                None => break,
            };
            self.emit(Event::Data(chunk));
            let inner = self.inner.borrow();
            if !inner.flowing || inner.buffer.is_empty() {
                break;
            }
        }
        let (empty, eof) = {
            let inner = self.inner.borrow();
            (inner.buffer.is_empty(), inner.eof)
        };
        if !no_drain && empty && !eof {
            self.emit(Event::Drain);
        }
    }
}

// ---------------------------------------------------------------------
// Pipes

impl<T: Item> Stream<T> {
    /// Pipe every emitted item into `dest`, returning the destination
    /// handle for chaining.  Equivalent to
    /// [`pipe_opts`](Stream::pipe_opts) with default options.
    pub fn pipe<W>(&self, dest: W) -> W
    where
        W: Writable<T> + Clone + 'static,
    {
        self.pipe_opts(dest, PipeOptions::default())
    }

    /// Pipe with options.
    ///
    /// When the destination's `write` reports backpressure the source
    /// pauses itself, resuming on the destination's `drain`.  If this
    /// stream has already ended, the destination is ended immediately
    /// (when `end` propagation is on) and no record is kept.
    pub fn pipe_opts<W>(&self, dest: W, mut opts: PipeOptions) -> W
    where
        W: Writable<T> + Clone + 'static,
    {
        if self.inner.borrow().destroyed {
            return dest;
        }
        self.inner.borrow_mut().discarded = false;

        // Never close a shared process stream.
        if dest.is_process_stdio() {
            opts.end = false;
        }

        if self.inner.borrow().emitted_end {
            if opts.end {
                dest.end();
            }
            return dest;
        }

        let shared: Rc<dyn Writable<T>> = Rc::new(dest.clone());
        let src = self.clone();
        let drain_id = shared.add_drain_listener(Box::new(move || src.resume()));
        let proxy_id = if opts.proxy_errors {
            let d = shared.clone();
            Some(self.on_error(move |er| d.inject_error(er.clone())))
        } else {
            None
        };
        self.inner.borrow_mut().pipes.push(PipeRecord {
            dest: shared,
            end_on_finish: opts.end,
            drain_id,
            proxy_id,
        });
        log::trace!("pipe attached (end={}, proxy_errors={})", opts.end, opts.proxy_errors);

        if self.inner.borrow().deferred {
            self.enqueue(Deferred::Resume);
        } else {
            self.resume_inner(false);
        }
        dest
    }

    /// Detach the first pipe record bound to `dest`.  If it was the
    /// only pipe and no `data` listeners remain, flow stops.
    pub fn unpipe<W: Writable<T>>(&self, dest: &W) {
        let ident = dest.identity();
        let removed = {
            let mut inner = self.inner.borrow_mut();
            match inner.pipes.iter().position(|p| p.identity() == ident) {
                None => None,
                Some(pos) => {
                    if inner.pipes.len() == 1
                        && inner.flowing
                        && inner.registry.data.is_empty()
                    {
                        inner.flowing = false;
                    }
                    let rec = inner.pipes.remove(pos);
                    if let Some(id) = rec.proxy_id {
                        inner.registry.error.remove(id);
                    }
                    Some(rec)
                }
            }
        };
        if let Some(rec) = removed {
            if let Some(id) = rec.drain_id {
                rec.dest.remove_drain_listener(id);
            }
            log::trace!("pipe detached");
        }
    }
}

// ---------------------------------------------------------------------
// Listener registration

impl<T: Item> Stream<T> {
    /// Subscribe to a payload-free channel.
    ///
    /// Registration has the usual replay semantics: a `readable`
    /// listener fires immediately if data is buffered, and an endish
    /// listener added after the fact observes the past event exactly
    /// once.
    ///
    /// # Panics
    ///
    /// Panics for `Data`, `Error` and `Abort`; those carry payloads
    /// and have typed registration methods.
    pub fn on(&self, kind: EventKind, f: impl FnMut() + 'static) -> ListenerId {
        self.subscribe_void(kind, false, Rc::new(RefCell::new(f)))
    }

    /// One-shot variant of [`on`](Stream::on).
    pub fn once(&self, kind: EventKind, f: impl FnMut() + 'static) -> ListenerId {
        self.subscribe_void(kind, true, Rc::new(RefCell::new(f)))
    }

    fn subscribe_void(
        &self,
        kind: EventKind,
        once: bool,
        cell: Rc<RefCell<dyn FnMut()>>,
    ) -> ListenerId {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.registry.next_id();
            inner.registry.void(kind).add(id, once, cell);
            id
        };
        match kind {
            EventKind::Readable => {
                if self.inner.borrow().buffer.len() != 0 {
                    self.emit_void_now(EventKind::Readable);
                }
            }
            EventKind::End | EventKind::Finish | EventKind::Prefinish => {
                if self.inner.borrow().emitted_end {
                    self.emit_void_now(kind);
                    self.inner.borrow_mut().registry.clear(kind);
                }
            }
            _ => {}
        }
        id
    }

    /// Subscribe to `data`.  Attaching the first consumer clears the
    /// discard latch and, when nothing else is driving flow, resumes
    /// the stream.
    pub fn on_data(&self, f: impl FnMut(&T) + 'static) -> ListenerId {
        self.subscribe_data(false, Rc::new(RefCell::new(f)))
    }

    /// One-shot `data` listener.
    pub fn once_data(&self, f: impl FnMut(&T) + 'static) -> ListenerId {
        self.subscribe_data(true, Rc::new(RefCell::new(f)))
    }

    fn subscribe_data(&self, once: bool, cell: Rc<RefCell<dyn FnMut(&T)>>) -> ListenerId {
        let (id, should_resume) = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.registry.next_id();
            inner.registry.data.add(id, once, cell);
            inner.discarded = false;
            (id, inner.pipes.is_empty() && !inner.flowing)
        };
        if should_resume {
            self.resume_inner(false);
        }
        id
    }

    /// Subscribe to `error`.  If an error is already latched the
    /// handler is invoked with it immediately (after one drain in
    /// deferred mode).
    pub fn on_error(&self, f: impl FnMut(&SharedError) + 'static) -> ListenerId {
        self.subscribe_error(false, Rc::new(RefCell::new(f)))
    }

    /// One-shot `error` listener.
    pub fn once_error(&self, f: impl FnMut(&SharedError) + 'static) -> ListenerId {
        self.subscribe_error(true, Rc::new(RefCell::new(f)))
    }

    fn subscribe_error(
        &self,
        once: bool,
        cell: Rc<RefCell<dyn FnMut(&SharedError)>>,
    ) -> ListenerId {
        let (id, replay, deferred) = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.registry.next_id();
            inner.registry.error.add(id, once, cell.clone());
            (id, inner.emitted_error.clone(), inner.deferred)
        };
        if let Some(er) = replay {
            if deferred {
                self.enqueue(Deferred::ErrorReplay(er, cell));
            } else {
                (cell.borrow_mut())(&er);
            }
        }
        id
    }

    /// Subscribe to `abort`; the payload is the cancellation reason.
    pub fn on_abort(&self, f: impl FnMut(&SharedError) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.registry.next_id();
        inner.registry.abort.add(id, false, Rc::new(RefCell::new(f)));
        id
    }

    /// Remove one listener.  Removing the last `data` listener with no
    /// pipes attached (and no explicit discard) stops flow.
    pub fn off(&self, kind: EventKind, id: ListenerId) {
        let mut inner = self.inner.borrow_mut();
        inner.registry.remove(kind, id);
        if kind == EventKind::Data
            && inner.registry.data.is_empty()
            && !inner.discarded
            && inner.pipes.is_empty()
        {
            inner.flowing = false;
        }
    }

    /// Remove every listener on one channel, or on all of them.
    /// Iterators and promises ride on internal subscriptions and are
    /// not affected.
    pub fn remove_all(&self, kind: Option<EventKind>) {
        let mut inner = self.inner.borrow_mut();
        match kind {
            Some(kind) => inner.registry.clear(kind),
            None => inner.registry.clear_all(),
        }
        if matches!(kind, Some(EventKind::Data) | None)
            && !inner.discarded
            && inner.pipes.is_empty()
        {
            inner.flowing = false;
        }
    }
}

// ---------------------------------------------------------------------
// Emission

impl<T: Item> Stream<T> {
    /// Emit an event, applying the stream's override semantics: vacant
    /// data is dropped, `close` is latched until after `end`, errors
    /// are recorded for late subscribers, and endish bookkeeping runs
    /// where required.  Returns whether any listener observed it.
    pub fn emit(&self, ev: Event<T>) -> bool {
        {
            let inner = self.inner.borrow();
            if inner.destroyed
                && !matches!(&ev, Event::Error(_) | Event::Close | Event::Destroyed)
            {
                return false;
            }
        }
        match ev {
            Event::Data(item) => {
                let (object, deferred) = {
                    let inner = self.inner.borrow();
                    (inner.mode.is_object(), inner.deferred)
                };
                if !object && item.is_vacant() {
                    return false;
                }
                if deferred {
                    self.enqueue(Deferred::EmitData(item));
                    true
                } else {
                    self.emit_data_now(item)
                }
            }
            Event::End => self.emit_end(),
            Event::Close => {
                let emit_now = {
                    let mut inner = self.inner.borrow_mut();
                    inner.closed = true;
                    inner.emitted_end || inner.destroyed
                };
                if !emit_now {
                    return false;
                }
                let ret = self.emit_void_now(EventKind::Close);
                self.inner.borrow_mut().registry.clear(EventKind::Close);
                ret
            }
            Event::Error(er) => self.emit_error_now(er),
            Event::Resume => {
                let ret = self.emit_void_now(EventKind::Resume);
                self.maybe_emit_end();
                ret
            }
            Event::Finish | Event::Prefinish => {
                let kind = if matches!(ev, Event::Finish) {
                    EventKind::Finish
                } else {
                    EventKind::Prefinish
                };
                let ret = self.emit_void_now(kind);
                self.inner.borrow_mut().registry.clear(kind);
                ret
            }
            Event::Abort(reason) => {
                let ret = self.emit_abort_now(&reason);
                self.maybe_emit_end();
                ret
            }
            Event::Destroyed => {
                let ret = self.emit_void_now(EventKind::Destroyed);
                self.notify_taps(TapEvent::Destroyed);
                self.maybe_emit_end();
                ret
            }
            Event::Readable | Event::Drain => {
                let kind = if matches!(ev, Event::Readable) {
                    EventKind::Readable
                } else {
                    EventKind::Drain
                };
                let ret = self.emit_void_now(kind);
                self.maybe_emit_end();
                ret
            }
        }
    }

    /// Emit an `error` event carrying `err`.
    pub fn emit_error(&self, err: StreamError) -> bool {
        self.emit(Event::Error(Rc::new(err)))
    }

    fn emit_data_now(&self, item: T) -> bool {
        let (dests, listeners, discarded) = {
            let mut inner = self.inner.borrow_mut();
            let dests: Vec<Rc<dyn Writable<T>>> =
                inner.pipes.iter().map(|p| p.dest.clone()).collect();
            let discarded = inner.discarded;
            let listeners = if discarded {
                Vec::new()
            } else {
                inner.registry.data.snapshot()
            };
            (dests, listeners, discarded)
        };
        for dest in dests {
            if !dest.write(item.clone()) {
                self.pause();
            }
        }
        let ret = if discarded {
            false
        } else {
            let had = !listeners.is_empty();
            for f in listeners {
                (f.borrow_mut())(&item);
            }
            had
        };
        self.notify_taps(TapEvent::Data(&item));
        self.maybe_emit_end();
        ret
    }

    fn emit_error_now(&self, er: SharedError) -> bool {
        log::debug!("error: {er}");
        self.inner.borrow_mut().emitted_error = Some(er.clone());
        // The internal channel always fires, even when a cancellation
        // signal absorbs the public event below.
        self.notify_taps(TapEvent::Error(&er));
        let listeners = {
            let mut inner = self.inner.borrow_mut();
            if inner.has_signal && inner.registry.error.is_empty() {
                None
            } else {
                Some(inner.registry.error.snapshot())
            }
        };
        let ret = match listeners {
            None => false,
            Some(fs) => {
                let had = !fs.is_empty();
                for f in fs {
                    (f.borrow_mut())(&er);
                }
                had
            }
        };
        self.maybe_emit_end();
        ret
    }

    fn emit_end(&self) -> bool {
        let deferred = {
            let mut inner = self.inner.borrow_mut();
            if inner.emitted_end {
                return false;
            }
            inner.emitted_end = true;
            inner.readable = false;
            inner.deferred
        };
        if deferred {
            self.enqueue(Deferred::EmitEndTail);
            true
        } else {
            self.emit_end_tail()
        }
    }

    fn emit_end_tail(&self) -> bool {
        log::trace!("end");
        // Flush the decoder; a final partial sequence decodes to
        // replacement characters and goes out like any other data.
        let tail: Option<T> = {
            let mut inner = self.inner.borrow_mut();
            inner.mode.decoder_mut().and_then(|d| {
                let s = d.finish();
                if s.is_empty() {
                    None
                } else {
                    T::from_decoded_text(s)
                }
            })
        };
        if let Some(item) = tail {
            let (dests, listeners) = {
                let mut inner = self.inner.borrow_mut();
                let dests: Vec<Rc<dyn Writable<T>>> =
                    inner.pipes.iter().map(|p| p.dest.clone()).collect();
                let listeners = if inner.discarded {
                    Vec::new()
                } else {
                    inner.registry.data.snapshot()
                };
                (dests, listeners)
            };
            for dest in dests {
                dest.write(item.clone());
            }
            for f in listeners {
                (f.borrow_mut())(&item);
            }
            self.notify_taps(TapEvent::Data(&item));
        }
        // Close out the pipe records: unpipe each one — detaching its
        // subscriptions — and end the destinations that asked for it.
        let records: Vec<(Rc<dyn Writable<T>>, bool, Option<ListenerId>, Option<ListenerId>)> = {
            let mut inner = self.inner.borrow_mut();
            inner
                .pipes
                .drain(..)
                .map(|p| (p.dest, p.end_on_finish, p.drain_id, p.proxy_id))
                .collect()
        };
        for (dest, end_dest, drain_id, proxy_id) in records {
            if let Some(id) = proxy_id {
                self.inner.borrow_mut().registry.error.remove(id);
            }
            if let Some(id) = drain_id {
                dest.remove_drain_listener(id);
            }
            if end_dest {
                dest.end();
            }
        }
        let ret = self.emit_void_now(EventKind::End);
        self.notify_taps(TapEvent::End);
        self.inner.borrow_mut().registry.clear(EventKind::End);
        ret
    }

    /// Fire the closing sequence if the stream is drained, ended, and
    /// has not already done so: `end`, `prefinish`, `finish`, then
    /// `close` if one was requested.  Guarded against re-entry from
    /// the handlers it invokes.
    fn maybe_emit_end(&self) {
        let go = {
            let inner = self.inner.borrow();
            !inner.emitting_end
                && !inner.emitted_end
                && !inner.destroyed
                && inner.buffer.is_empty()
                && inner.eof
        };
        if !go {
            return;
        }
        self.inner.borrow_mut().emitting_end = true;
        self.emit(Event::End);
        self.emit(Event::Prefinish);
        self.emit(Event::Finish);
        if self.inner.borrow().closed {
            self.emit(Event::Close);
        }
        self.inner.borrow_mut().emitting_end = false;
    }

    fn emit_void_now(&self, kind: EventKind) -> bool {
        let fs = { self.inner.borrow_mut().registry.void(kind).snapshot() };
        let had = !fs.is_empty();
        for f in fs {
            (f.borrow_mut())();
        }
        had
    }

    fn emit_abort_now(&self, reason: &SharedError) -> bool {
        let fs = { self.inner.borrow_mut().registry.abort.snapshot() };
        let had = !fs.is_empty();
        for f in fs {
            (f.borrow_mut())(reason);
        }
        had
    }
}

// ---------------------------------------------------------------------
// Teardown

impl<T: Item> Stream<T> {
    /// Tear the stream down, discarding buffered data.  Emits the
    /// internal destroy marker; a repeat call re-emits only that.
    pub fn destroy(&self) {
        self.destroy_impl(None);
    }

    /// Tear down with a cause; the cause is emitted as an `error`.
    pub fn destroy_with(&self, err: StreamError) {
        self.destroy_impl(Some(Rc::new(err)));
    }

    fn destroy_impl(&self, err: Option<SharedError>) {
        if self.inner.borrow().destroyed {
            match err {
                Some(er) => {
                    self.emit(Event::Error(er));
                }
                None => {
                    self.emit(Event::Destroyed);
                }
            }
            return;
        }
        let hook = {
            let mut inner = self.inner.borrow_mut();
            inner.destroyed = true;
            inner.discarded = true;
            inner.buffer.clear();
            if inner.closed {
                None
            } else {
                inner.close_hook.take()
            }
        };
        log::debug!("destroy (cause: {:?})", err.as_deref());
        if let Some(hook) = hook {
            hook();
        }
        match err {
            Some(er) => {
                self.emit(Event::Error(er));
            }
            None => {
                self.emit(Event::Destroyed);
            }
        }
        self.wake_all();
    }

    fn abort_now(&self, reason: SharedError) {
        self.inner.borrow_mut().aborted = true;
        log::debug!("abort: {reason}");
        self.emit(Event::Abort(reason.clone()));
        self.destroy_impl(Some(reason));
    }
}

// ---------------------------------------------------------------------
// Deferral queue, taps, wakers

impl<T: Item> Stream<T> {
    /// Drain the deferred-emission queue, FIFO, including work queued
    /// by the drained operations themselves.  The crate's futures call
    /// this on every poll; call it directly when consuming a deferred
    /// stream by hand.  No-op in synchronous mode and when re-entered.
    pub fn tick(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        loop {
            let op = { self.inner.borrow_mut().queue.pop_front() };
            match op {
                None => break,
                Some(Deferred::EmitData(item)) => {
                    self.emit_data_now(item);
                }
                Some(Deferred::EmitEndTail) => {
                    self.emit_end_tail();
                }
                Some(Deferred::Resume) => self.resume_inner(false),
                Some(Deferred::Callback(cb)) => cb(),
                Some(Deferred::ErrorReplay(er, cell)) => (cell.borrow_mut())(&er),
            }
        }
        self.inner.borrow_mut().draining = false;
    }

    fn enqueue(&self, op: Deferred<T>) {
        self.inner.borrow_mut().queue.push_back(op);
        self.wake_all();
    }

    pub(crate) fn add_tap(
        &self,
        f: impl FnMut(TapEvent<'_, T>) + 'static,
    ) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.registry.next_id();
        inner.taps.push(TapEntry { id, f: Rc::new(RefCell::new(f)) });
        id
    }

    pub(crate) fn remove_tap(&self, id: ListenerId) {
        self.inner.borrow_mut().taps.retain(|t| t.id != id);
    }

    fn notify_taps(&self, ev: TapEvent<'_, T>) {
        let fs: Vec<_> = {
            self.inner.borrow().taps.iter().map(|t| t.f.clone()).collect()
        };
        for f in fs {
            (f.borrow_mut())(ev);
        }
        self.wake_all();
    }

    pub(crate) fn add_waker(&self, waker: &Waker) {
        let mut inner = self.inner.borrow_mut();
        if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
            inner.wakers.push(waker.clone());
        }
    }

    fn wake_all(&self) {
        let wakers = std::mem::take(&mut self.inner.borrow_mut().wakers);
        for w in wakers {
            w.wake();
        }
    }
}

// ---------------------------------------------------------------------
// A stream is a writable collaborator for upstream pipes.

impl<T: Item> Writable<T> for Stream<T> {
    fn write(&self, item: T) -> bool {
        match Stream::write(self, item.into_input()) {
            Ok(flowing) => flowing,
            Err(e) => {
                log::warn!("piped write refused: {e}");
                false
            }
        }
    }

    fn end(&self) {
        Stream::end(self);
    }

    fn add_drain_listener(&self, mut f: Box<dyn FnMut()>) -> Option<ListenerId> {
        Some(self.on(EventKind::Drain, move || f()))
    }

    fn remove_drain_listener(&self, id: ListenerId) {
        self.off(EventKind::Drain, id);
    }

    fn inject_error(&self, err: SharedError) {
        self.emit(Event::Error(err));
    }

    fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }
}

#[inline(never)]
#[cold]
#[track_caller]
fn panic_encoding_with_objects() -> ! {
    panic!("an encoding cannot be combined with an object-mode stream")
}
