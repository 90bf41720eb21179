//! Minimal in-process byte/string/object stream
//!
//! [`Stream`] is a streaming primitive for producer→consumer pipelines
//! that live entirely inside one process, where the platform's I/O
//! stream abstractions are too heavyweight.  A producer writes items
//! into the stream; the stream buffers them while no consumer is
//! attached and hands them out — in strict FIFO order — as soon as
//! consumers appear, whether those are `data` listeners, piped
//! destinations, or iterators.
//!
//! Three payload modes cover the common shapes:
//!
//! - **Bytes** ([`Stream::bytes`]): items are [`bytes::Bytes`] buffers,
//!   sized by byte length.
//! - **Text** ([`Stream::text`]): byte writes are decoded incrementally
//!   into strings of a declared encoding.  A multi-byte codepoint split
//!   across two writes decodes correctly once its continuation bytes
//!   arrive; the partial sequence waits inside the decoder, never in
//!   the buffer.
//! - **Object** ([`Stream::objects`]): items of any [`Item`] type pass
//!   through untouched and the size metric is one per item.  The
//!   [`object_item!`] macro derives the impl for your own types.
//!
//!
//! # Flowing, paused, and discarding
//!
//! A new stream is paused: writes accumulate in the buffer and
//! [`Stream::write`] keeps returning `false` to suggest the producer
//! hold off.  Attaching a `data` listener, piping, or iterating starts
//! flow, first draining the buffer in order.  [`Stream::pause`] stops
//! auto-emission again.
//!
//! Calling [`Stream::resume`] with *no* consumer attached latches a
//! third state: the stream flows but emitted data is dropped on the
//! floor.  This is how a producer says "run to completion, I don't
//! care about the output" without accumulating memory.  Attaching a
//! consumer or pausing clears the latch.
//!
//! Backpressure propagates two ways: `write` returns the flowing
//! state, and a piped destination whose `write` returns `false` pauses
//! the source until the destination's `drain` event fires.
//!
//!
//! # Lifecycle
//!
//! [`Stream::end`] marks end-of-input.  Once the buffer drains, the
//! stream emits `end`, `prefinish`, `finish`, and — if a `close` was
//! requested — `close`, in that order, exactly once.  Listeners added
//! after an endish event has fired observe it immediately, exactly
//! once.  [`Stream::destroy`] tears the stream down immediately,
//! discarding the buffer; an [`AbortSignal`] does the same from the
//! outside, preceded by an `abort` event.
//!
//! Errors are events: [`Stream::emit_error`] latches the error and
//! notifies `error` listeners, including ones that subscribe late.  A
//! stream constructed with a cancellation signal absorbs `error`
//! events that nobody is listening for, so aborts do not turn into
//! unobserved-error noise; promises and iterators still see them.
//!
//!
//! # Consuming
//!
//! ```
//! use minipipe::Stream;
//!
//! let s = Stream::bytes();
//! s.write(b"hello").unwrap();
//! s.end_with(b" world").unwrap();
//!
//! let out = futures::executor::block_on(s.concat()).unwrap();
//! assert_eq!(out.as_bytes(), b"hello world");
//! ```
//!
//! Or item by item, synchronously:
//!
//! ```
//! use minipipe::Stream;
//!
//! let s = Stream::bytes();
//! s.write(b"a").unwrap();
//! s.write(b"b").unwrap();
//! s.end();
//! let chunks: Vec<_> = s.iter().collect();
//! assert_eq!(chunks.len(), 1); // read() coalesces what is buffered
//! ```
//!
//! [`Stream::collect`] gathers every emitted item plus an aggregate
//! length, [`Stream::promise`] is bare completion, and
//! [`Stream::iter_async`] implements [`futures::Stream`] for `await`
//! loops.
//!
//!
//! # Pipes
//!
//! [`Stream::pipe`] forwards every emitted item to a [`Writable`]
//! destination — usually another stream — and by default ends it when
//! the source ends.  [`PipeOptions::proxy_errors`] additionally
//! re-emits source errors on the destination.  Piping to
//! [`StdoutSink`]/[`StderrSink`] writes through to the process streams
//! but never closes them.
//!
//!
//! # Deferred mode
//!
//! With [`Options::deferred`], data and endish emissions (and write
//! callbacks) are queued instead of running inside the mutating call,
//! preserving FIFO order within the queue.  The queue drains on
//! [`Stream::tick`] and automatically whenever one of the crate's
//! futures is polled.  This is the cooperative, single-threaded
//! equivalent of deferring to the next turn of a task queue.
//!
//!
//! # Single-threaded by design
//!
//! A `Stream` handle is a cheap clone onto shared state in the current
//! thread.  All operations run to completion synchronously; handlers
//! may re-enter the stream freely (`pause`, `resume`, `write`, `end`,
//! `destroy` are all legal inside a listener).  There is no locking
//! and no `Send`; wrap the stream in a single-owner task if you need
//! it near threads.

#![forbid(unsafe_code)]

mod buf;
mod decode;

mod chunk;
pub use chunk::{Chunk, Item, Mode, WriteChunk};

mod error;
pub use error::{SharedError, StreamError};

mod event;
pub use event::{EventKind, ListenerId};

mod signal;
pub use signal::AbortSignal;

mod pipe;
pub use pipe::{PipeOptions, StderrSink, StdoutSink, Writable};

mod stream;
pub use stream::{Event, Options, Stream};

mod iter;
pub use iter::{AsyncIter, Collect, Collected, Concat, Done, Iter};

pub use encoding_rs::{Encoding, UTF_16LE, UTF_8, WINDOWS_1252};
