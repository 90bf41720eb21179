use std::io::Write as _;
use std::rc::Rc;

use crate::chunk::{Chunk, Item};
use crate::error::SharedError;
use crate::event::ListenerId;

/// Options for [`Stream::pipe_opts`](crate::Stream::pipe_opts).
#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    /// Call `end()` on the destination once the source ends.  Defaults
    /// to `true`, but is forced off for process stdio sinks — shared
    /// process streams are never closed by a pipe.
    pub end: bool,
    /// Re-emit every source `error` on the destination.
    pub proxy_errors: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        PipeOptions { end: true, proxy_errors: false }
    }
}

/// The writable-collaborator contract a pipe destination must present.
///
/// [`Stream`](crate::Stream) implements this, so streams chain
/// directly; any other sink can take part by implementing it.  `write`
/// returning `false` is the backpressure signal: the source pauses
/// itself and waits for the destination's `drain` channel to fire.
pub trait Writable<T> {
    /// Accept one item.  `false` asks the source to pause.
    fn write(&self, item: T) -> bool;

    /// Source ended and end-propagation was requested.
    fn end(&self);

    /// Subscribe to this destination's `drain` channel, if it has one.
    /// Sinks without backpressure return `None`.
    fn add_drain_listener(&self, f: Box<dyn FnMut()>) -> Option<ListenerId>;

    /// Detach a listener handed out by
    /// [`add_drain_listener`](Writable::add_drain_listener).
    fn remove_drain_listener(&self, id: ListenerId);

    /// Entry point for error-proxying pipes: deliver a source error to
    /// this destination's own `error` channel.
    fn inject_error(&self, err: SharedError);

    /// Stable token identifying this destination, used by
    /// [`unpipe`](crate::Stream::unpipe) to find the matching record.
    fn identity(&self) -> usize;

    /// Whether this is the process stdout/stderr, which forces
    /// [`PipeOptions::end`] to `false`.
    fn is_process_stdio(&self) -> bool {
        false
    }
}

/// One source-to-destination binding held by the source stream.
///
/// The record owns the destination handle plus the subscription ids it
/// must detach on unpipe: its `drain` listener on the destination and,
/// for the error-proxying variant, its `error` listener on the source.
pub(crate) struct PipeRecord<T> {
    pub(crate) dest: Rc<dyn Writable<T>>,
    pub(crate) end_on_finish: bool,
    pub(crate) drain_id: Option<ListenerId>,
    pub(crate) proxy_id: Option<ListenerId>,
}

impl<T> PipeRecord<T> {
    pub(crate) fn identity(&self) -> usize {
        self.dest.identity()
    }
}

/// Pipe destination wrapping the process stdout.
///
/// Writes go straight through and always report readiness, there is no
/// `drain` channel, and [`is_process_stdio`](Writable::is_process_stdio)
/// keeps `pipe` from ever closing the shared process stream.  Write
/// failures are logged and otherwise ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

/// Pipe destination wrapping the process stderr.  See [`StdoutSink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSink;

impl Writable<Chunk> for StdoutSink {
    fn write(&self, item: Chunk) -> bool {
        if let Err(e) = std::io::stdout().write_all(item.as_bytes()) {
            log::warn!("stdout write failed: {e}");
        }
        true
    }

    fn end(&self) {}

    fn add_drain_listener(&self, _f: Box<dyn FnMut()>) -> Option<ListenerId> {
        None
    }

    fn remove_drain_listener(&self, _id: ListenerId) {}

    fn inject_error(&self, err: SharedError) {
        log::warn!("error proxied to stdout sink: {err}");
    }

    fn identity(&self) -> usize {
        1
    }

    fn is_process_stdio(&self) -> bool {
        true
    }
}

impl Writable<Chunk> for StderrSink {
    fn write(&self, item: Chunk) -> bool {
        if let Err(e) = std::io::stderr().write_all(item.as_bytes()) {
            log::warn!("stderr write failed: {e}");
        }
        true
    }

    fn end(&self) {}

    fn add_drain_listener(&self, _f: Box<dyn FnMut()>) -> Option<ListenerId> {
        None
    }

    fn remove_drain_listener(&self, _id: ListenerId) {}

    fn inject_error(&self, err: SharedError) {
        log::warn!("error proxied to stderr sink: {err}");
    }

    fn identity(&self) -> usize {
        2
    }

    fn is_process_stdio(&self) -> bool {
        true
    }
}

impl<T: Item, W: Writable<T> + ?Sized> Writable<T> for Rc<W> {
    fn write(&self, item: T) -> bool {
        (**self).write(item)
    }

    fn end(&self) {
        (**self).end()
    }

    fn add_drain_listener(&self, f: Box<dyn FnMut()>) -> Option<ListenerId> {
        (**self).add_drain_listener(f)
    }

    fn remove_drain_listener(&self, id: ListenerId) {
        (**self).remove_drain_listener(id)
    }

    fn inject_error(&self, err: SharedError) {
        (**self).inject_error(err)
    }

    fn identity(&self) -> usize {
        (**self).identity()
    }

    fn is_process_stdio(&self) -> bool {
        (**self).is_process_stdio()
    }
}
