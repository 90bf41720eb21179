//! State-machine behavior of the stream core: write/read sides, the
//! flowing/paused/discarding consumption modes, the endish lifecycle,
//! errors, abort, and the aggregation surface.

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::executor::block_on;
use futures::task::noop_waker;
use futures::{Stream as _, StreamExt as _};
use minipipe::{
    AbortSignal, Chunk, Event, EventKind, Options, Stream, StreamError, UTF_16LE, UTF_8,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Record every data payload as raw bytes.
fn record_data(s: &Stream) -> Rc<RefCell<Vec<Vec<u8>>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    s.on_data(move |c: &Chunk| seen2.borrow_mut().push(c.as_bytes().to_vec()));
    seen
}

fn counter(s: &Stream, kind: EventKind) -> Rc<Cell<u32>> {
    let n = Rc::new(Cell::new(0));
    let n2 = n.clone();
    s.on(kind, move || n2.set(n2.get() + 1));
    n
}

#[test]
fn bytes_passthrough() {
    init_logs();
    let s = Stream::bytes();
    let seen = record_data(&s);
    assert_eq!(true, s.flowing());

    assert_eq!(Ok(true), s.write(b"hello"));
    s.end_with(b" world").unwrap();

    assert_eq!(*seen.borrow(), vec![b"hello".to_vec(), b" world".to_vec()]);
    assert_eq!(true, s.emitted_end());
    assert_eq!(false, s.readable());
    assert_eq!(false, s.writable());
}

#[test]
fn concat_after_buffered_writes() {
    let s = Stream::bytes();
    let seen = record_data(&s);
    // Recorder started flow; pause again so both writes buffer first.
    s.pause();
    s.write(b"hello").unwrap();
    s.end_with(b" world").unwrap();
    assert_eq!(0, seen.borrow().len());

    let out = block_on(s.concat()).unwrap();
    assert_eq!(out, Chunk::Bytes(Bytes::from_static(b"hello world")));
    // Exactly two data events, in order.
    assert_eq!(*seen.borrow(), vec![b"hello".to_vec(), b" world".to_vec()]);
}

#[test]
fn utf8_split_codepoint() {
    let s = Stream::text(UTF_8);
    let seen = Rc::new(RefCell::new(Vec::<String>::new()));
    let seen2 = seen.clone();
    s.on_data(move |c: &Chunk| {
        if let Chunk::Text(t) = c {
            seen2.borrow_mut().push(t.clone());
        }
    });

    // U+2603 split across two writes: the first produces no data at
    // all, the second completes the codepoint.
    s.write(&[0xE2, 0x98][..]).unwrap();
    assert_eq!(0, seen.borrow().len());
    s.write(&[0x83][..]).unwrap();
    s.end();

    assert_eq!(*seen.borrow(), vec!["\u{2603}".to_owned()]);
}

#[test]
fn utf16le_round_trip() {
    let s = Stream::text(UTF_16LE);
    s.write(b"h\x00i\x00").unwrap();
    s.end();
    let out = block_on(s.concat()).unwrap();
    assert_eq!(out, Chunk::Text("hi".to_owned()));
}

#[test]
fn dangling_partial_flushes_replacement_on_end() {
    let s = Stream::text(UTF_8);
    let seen = Rc::new(RefCell::new(Vec::<String>::new()));
    let seen2 = seen.clone();
    s.on_data(move |c: &Chunk| {
        if let Chunk::Text(t) = c {
            seen2.borrow_mut().push(t.clone());
        }
    });
    // The lone lead byte produces nothing until the end flush, which
    // emits it as a replacement character.
    s.write(&[0xE2][..]).unwrap();
    assert_eq!(0, seen.borrow().len());
    s.end();
    assert_eq!(*seen.borrow(), vec!["\u{FFFD}".to_owned()]);
}

#[test]
fn read_boundaries() {
    let s = Stream::bytes();
    s.write(b"abc").unwrap();
    s.write(b"def").unwrap();
    assert_eq!(6, s.buffer_length());

    // Zero and oversized reads return nothing and touch nothing.
    assert_eq!(None, s.read_n(0));
    assert_eq!(None, s.read_n(7));
    assert_eq!(6, s.buffer_length());

    // A partial read coalesces, splits the head, and keeps the rest.
    assert_eq!(Some(Chunk::Bytes(Bytes::from_static(b"ab"))), s.read_n(2));
    assert_eq!(4, s.buffer_length());

    // A bare read drains everything that is left as one chunk.
    assert_eq!(Some(Chunk::Bytes(Bytes::from_static(b"cdef"))), s.read());
    assert_eq!(0, s.buffer_length());
    assert_eq!(None, s.read());
}

#[test]
fn read_null_path_runs_endish_check() {
    let s = Stream::bytes();
    s.pause();
    s.end();
    // Paused, so end() itself did not fire the sequence.
    assert_eq!(false, s.emitted_end());
    assert_eq!(None, s.read());
    assert_eq!(true, s.emitted_end());
}

#[test]
fn zero_length_writes_never_enter_pipeline() {
    let s = Stream::bytes();
    let readable = counter(&s, EventKind::Readable);
    let seen = record_data(&s);
    s.pause();

    s.write(&b""[..]).unwrap();
    assert_eq!(0, readable.get());

    s.write(b"x").unwrap();
    assert_eq!(1, readable.get());
    assert_eq!(1, s.buffer_length());

    // Still zero data events, but readable re-fires: the buffer is
    // non-empty at the time of the empty write.
    s.write(&b""[..]).unwrap();
    assert_eq!(2, readable.get());
    assert_eq!(1, s.buffer_length());
    assert_eq!(0, seen.borrow().len());
}

#[test]
fn endish_events_fire_in_order_with_close() {
    let s = Stream::bytes();
    let order = Rc::new(RefCell::new(Vec::new()));
    for (kind, name) in [
        (EventKind::End, "end"),
        (EventKind::Prefinish, "prefinish"),
        (EventKind::Finish, "finish"),
        (EventKind::Close, "close"),
    ] {
        let o = order.clone();
        s.on(kind, move || o.borrow_mut().push(name));
    }

    // A close request before end is latched, not emitted.
    assert_eq!(false, s.emit(Event::Close));
    assert_eq!(0, order.borrow().len());

    s.end();
    assert_eq!(*order.borrow(), vec!["end", "prefinish", "finish", "close"]);

    // Endish listeners are cleared after emission.
    assert_eq!(0, s.listener_count(EventKind::End));
    assert_eq!(0, s.listener_count(EventKind::Finish));
    assert_eq!(0, s.listener_count(EventKind::Prefinish));
    assert_eq!(0, s.listener_count(EventKind::Close));
}

#[test]
fn end_is_idempotent() {
    let s = Stream::bytes();
    let ends = counter(&s, EventKind::End);
    s.end();
    s.end();
    assert_eq!(1, ends.get());
}

#[test]
fn late_endish_subscriber_sees_event_once() {
    let s = Stream::bytes();
    s.end();
    assert_eq!(true, s.emitted_end());

    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();
    s.on(EventKind::End, move || f.set(f.get() + 1));
    assert_eq!(1, fired.get());
    assert_eq!(0, s.listener_count(EventKind::End));

    let f = fired.clone();
    s.on(EventKind::Finish, move || f.set(f.get() + 1));
    assert_eq!(2, fired.get());
}

#[test]
fn end_then_callback() {
    let s = Stream::bytes();
    let called = Rc::new(Cell::new(false));
    let c = called.clone();
    s.pause();
    s.write(b"tail").unwrap();
    s.end_then(move || c.set(true));
    // Buffer still holds data, so no end yet.
    assert_eq!(false, called.get());
    s.read();
    assert_eq!(true, called.get());
}

#[test]
fn late_error_listener_replays_sync() {
    let s = Stream::bytes();
    assert_eq!(false, s.emit_error(StreamError::msg("boom")));

    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    s.on_error(move |e| g.borrow_mut().push((**e).clone()));
    assert_eq!(*got.borrow(), vec![StreamError::msg("boom")]);
}

#[test]
fn late_error_listener_replays_after_tick_in_deferred_mode() {
    let s = Stream::with_options(Options { deferred: true, ..Options::default() });
    s.emit_error(StreamError::msg("boom"));

    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    s.on_error(move |e| g.borrow_mut().push((**e).clone()));
    assert_eq!(0, got.borrow().len());
    s.tick();
    assert_eq!(*got.borrow(), vec![StreamError::msg("boom")]);
}

#[test]
fn write_after_end_is_an_error() {
    let s = Stream::bytes();
    s.end();
    assert_eq!(Err(StreamError::WriteAfterEnd), s.write(b"x"));
    // Ending twice with a chunk hits the same wall.
    assert_eq!(Err(StreamError::WriteAfterEnd), s.end_with(b"y"));
}

#[test]
fn write_after_destroy_emits_error_event() {
    let s = Stream::bytes();
    let errs = Rc::new(RefCell::new(Vec::new()));
    let e2 = errs.clone();
    s.on_error(move |e| e2.borrow_mut().push((**e).clone()));

    s.destroy();
    assert_eq!(true, s.destroyed());
    assert_eq!(0, errs.borrow().len());

    assert_eq!(Ok(true), s.write(b"x"));
    assert_eq!(*errs.borrow(), vec![StreamError::WriteAfterDestroy]);
    assert_eq!(0, s.buffer_length());
}

#[test]
fn destroy_discards_buffer_and_is_idempotent() {
    let s = Stream::bytes();
    s.write(b"pending").unwrap();
    assert_eq!(7, s.buffer_length());

    let markers = counter(&s, EventKind::Destroyed);
    s.destroy();
    assert_eq!(0, s.buffer_length());
    assert_eq!(1, markers.get());

    // Repeat destroy only re-emits the marker.
    s.destroy();
    assert_eq!(2, markers.get());
}

#[test]
fn close_hook_runs_on_destroy() {
    let s = Stream::bytes();
    let closed = Rc::new(Cell::new(0));
    let c = closed.clone();
    s.set_close_hook(move || c.set(c.get() + 1));
    s.destroy();
    s.destroy();
    assert_eq!(1, closed.get());
}

#[test]
fn close_hook_skipped_when_close_already_requested() {
    let s = Stream::bytes();
    let closed = Rc::new(Cell::new(0));
    let c = closed.clone();
    s.set_close_hook(move || c.set(c.get() + 1));
    s.emit(Event::Close);
    s.destroy();
    assert_eq!(0, closed.get());
}

#[test]
fn abort_via_signal() {
    init_logs();
    let signal = AbortSignal::new();
    let s = Stream::with_options(Options { signal: Some(signal.clone()), ..Options::default() });

    let aborts = Rc::new(RefCell::new(Vec::new()));
    let a2 = aborts.clone();
    s.on_abort(move |r| a2.borrow_mut().push((**r).clone()));
    let errs = Rc::new(RefCell::new(Vec::new()));
    let e2 = errs.clone();
    s.on_error(move |e| e2.borrow_mut().push((**e).clone()));

    signal.abort_with(StreamError::msg("R"));

    assert_eq!(*aborts.borrow(), vec![StreamError::msg("R")]);
    assert_eq!(*errs.borrow(), vec![StreamError::msg("R")]);
    assert_eq!(true, s.aborted());
    assert_eq!(true, s.destroyed());

    // Writes after abort are silently dropped.
    assert_eq!(Ok(false), s.write(b"late"));
    assert_eq!(1, errs.borrow().len());
    assert_eq!(0, s.buffer_length());
}

#[test]
fn signal_without_listeners_absorbs_error() {
    let signal = AbortSignal::new();
    let s = Stream::with_options(Options { signal: Some(signal.clone()), ..Options::default() });
    signal.abort();
    assert_eq!(true, s.destroyed());

    // The error was absorbed, but stays latched for late subscribers.
    let got = Rc::new(RefCell::new(Vec::new()));
    let g = got.clone();
    s.on_error(move |e| g.borrow_mut().push((**e).clone()));
    assert_eq!(*got.borrow(), vec![StreamError::Aborted]);
}

#[test]
fn already_aborted_signal_aborts_at_construction() {
    let signal = AbortSignal::new();
    signal.abort();
    let s = Stream::with_options(Options { signal: Some(signal), ..Options::default() });
    assert_eq!(true, s.aborted());
    assert_eq!(true, s.destroyed());
}

#[derive(Clone, Debug, PartialEq)]
struct Rec {
    i: u32,
}
minipipe::object_item!(Rec);

#[test]
fn object_mode_aggregation() {
    let s = Stream::<Rec>::objects();
    s.write(Rec { i: 1 }).unwrap();
    s.write(Rec { i: 2 }).unwrap();
    s.write(Rec { i: 3 }).unwrap();
    assert_eq!(3, s.buffer_length());
    s.end();

    let out = block_on(s.collect()).unwrap();
    assert_eq!(out.items, vec![Rec { i: 1 }, Rec { i: 2 }, Rec { i: 3 }]);
    assert_eq!(0, out.data_length);
}

#[test]
fn read_n_on_object_stream_ignores_n() {
    let s = Stream::<Chunk>::objects();
    s.write(Bytes::from_static(b"abcdef")).unwrap();
    s.write(Bytes::from_static(b"gh")).unwrap();
    assert_eq!(2, s.buffer_length());

    // n is ignored in object mode: every read shifts one whole item,
    // even for values the byte/text null-check would reject.
    assert_eq!(Some(Chunk::Bytes(Bytes::from_static(b"abcdef"))), s.read_n(0));
    assert_eq!(Some(Chunk::Bytes(Bytes::from_static(b"gh"))), s.read_n(99));
    assert_eq!(0, s.buffer_length());
    assert_eq!(None, s.read_n(1));
}

#[test]
fn object_mode_read_shifts_one_item() {
    let s = Stream::<Rec>::objects();
    s.write(Rec { i: 1 }).unwrap();
    s.write(Rec { i: 2 }).unwrap();
    assert_eq!(Some(Rec { i: 1 }), s.read());
    assert_eq!(1, s.buffer_length());
}

#[test]
#[should_panic]
fn encoding_and_object_mode_conflict() {
    let _ = Stream::<Rec>::objects_with(Options {
        encoding: Some(UTF_8),
        ..Options::default()
    });
}

#[test]
#[should_panic]
fn concat_on_object_stream_panics() {
    let s = Stream::<Chunk>::objects();
    let _ = s.concat();
}

#[test]
fn collect_data_length_counts_bytes() {
    let s = Stream::bytes();
    s.write(b"abc").unwrap();
    s.end_with(b"de").unwrap();
    let out = block_on(s.collect()).unwrap();
    assert_eq!(2, out.items.len());
    assert_eq!(5, out.data_length);
}

#[test]
fn deferred_mode_defers_data_and_callbacks() {
    let s = Stream::with_options(Options { deferred: true, ..Options::default() });
    let seen = record_data(&s);
    let called = Rc::new(Cell::new(false));
    let c = called.clone();

    assert_eq!(Ok(true), s.write_then(b"hi", move || c.set(true)));
    assert_eq!(0, seen.borrow().len());
    assert_eq!(false, called.get());

    s.tick();
    assert_eq!(*seen.borrow(), vec![b"hi".to_vec()]);
    assert_eq!(true, called.get());
}

#[test]
fn deferred_mode_defers_end_listeners() {
    let s = Stream::with_options(Options { deferred: true, ..Options::default() });
    let ended = counter(&s, EventKind::End);
    s.end();
    // The latch flips synchronously, the listeners run on the drain.
    assert_eq!(true, s.emitted_end());
    assert_eq!(0, ended.get());
    s.tick();
    assert_eq!(1, ended.get());
}

#[test]
fn promise_resolves_on_end() {
    let s = Stream::bytes();
    let p = s.promise();
    s.end();
    assert_eq!(Ok(()), block_on(p));
}

#[test]
fn promise_rejects_on_destroy() {
    let s = Stream::bytes();
    let p = s.promise();
    s.destroy_with(StreamError::msg("bad"));
    assert_eq!(StreamError::msg("bad"), *block_on(p).unwrap_err());

    let s2 = Stream::bytes();
    let p2 = s2.promise();
    s2.destroy();
    assert_eq!(StreamError::Destroyed, *block_on(p2).unwrap_err());
}

#[test]
fn promise_attached_late_replays() {
    let s = Stream::bytes();
    s.end();
    assert_eq!(Ok(()), block_on(s.promise()));

    let s2 = Stream::bytes();
    s2.emit_error(StreamError::msg("oops"));
    assert_eq!(StreamError::msg("oops"), *block_on(s2.promise()).unwrap_err());
}

#[test]
fn resume_without_consumer_discards() {
    let s = Stream::bytes();
    s.resume();
    assert_eq!(true, s.flowing());

    s.write(b"dropped").unwrap();
    assert_eq!(0, s.buffer_length());

    // Attaching a consumer clears the latch; later data is delivered.
    let seen = record_data(&s);
    s.write(b"kept").unwrap();
    assert_eq!(*seen.borrow(), vec![b"kept".to_vec()]);
}

#[test]
fn removing_last_data_listener_stops_flow() {
    let s = Stream::bytes();
    let id = s.on_data(|_| {});
    assert_eq!(true, s.flowing());
    s.off(EventKind::Data, id);
    assert_eq!(false, s.flowing());

    // remove_all behaves the same way.
    s.on_data(|_| {});
    assert_eq!(true, s.flowing());
    s.remove_all(None);
    assert_eq!(false, s.flowing());
}

#[test]
fn paused_writes_flush_in_order_then_drain() {
    let s = Stream::bytes();
    let order = Rc::new(RefCell::new(Vec::new()));
    s.write(b"1").unwrap();
    s.write(b"2").unwrap();

    let o = order.clone();
    s.on(EventKind::Drain, move || o.borrow_mut().push("drain".to_owned()));
    let o = order.clone();
    s.on_data(move |c: &Chunk| {
        o.borrow_mut().push(String::from_utf8_lossy(c.as_bytes()).into_owned())
    });
    s.write(b"3").unwrap();

    assert_eq!(*order.borrow(), vec!["1", "2", "drain", "3"]);
}

#[test]
fn readable_listener_fires_on_subscribe_when_buffered() {
    let s = Stream::bytes();
    s.write(b"x").unwrap();
    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();
    s.on(EventKind::Readable, move || f.set(f.get() + 1));
    assert_eq!(1, fired.get());
}

#[test]
fn once_listener_fires_once() {
    let s = Stream::bytes();
    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();
    s.once(EventKind::Drain, move || f.set(f.get() + 1));
    s.resume();
    assert_eq!(1, fired.get());
    s.pause();
    s.resume();
    assert_eq!(1, fired.get());
}

#[test]
fn vacant_data_is_dropped() {
    let s = Stream::bytes();
    let seen = record_data(&s);
    assert_eq!(false, s.emit(Event::Data(Chunk::Bytes(Bytes::new()))));
    assert_eq!(0, seen.borrow().len());
}

#[test]
fn sync_iteration_drains_and_stops() {
    let s = Stream::bytes();
    s.write(b"a").unwrap();
    let mut it = s.iter();
    assert_eq!(Some(Chunk::Bytes(Bytes::from_static(b"a"))), it.next());
    s.write(b"b").unwrap();
    assert_eq!(Some(Chunk::Bytes(Bytes::from_static(b"b"))), it.next());
    s.end();
    assert_eq!(None, it.next());
    assert_eq!(None, it.next());
    // The stop path paused the stream.
    assert_eq!(false, s.flowing());
}

#[test]
fn async_iteration_yields_items_then_finishes() {
    let s = Stream::bytes();
    s.write(b"a").unwrap();
    s.write(b"b").unwrap();
    s.end();

    let items: Vec<_> = block_on(s.iter_async().collect::<Vec<_>>());
    // Buffered items come back through read(), which coalesces.
    assert_eq!(1, items.len());
    assert_eq!(
        Chunk::Bytes(Bytes::from_static(b"ab")),
        items[0].as_ref().unwrap().clone()
    );
}

#[test]
fn async_iteration_surfaces_errors() {
    let s = Stream::bytes();
    let mut it = s.iter_async();
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    assert!(Pin::new(&mut it).poll_next(&mut cx).is_pending());
    s.destroy_with(StreamError::msg("torn"));
    match Pin::new(&mut it).poll_next(&mut cx) {
        Poll::Ready(Some(Err(e))) => assert_eq!(StreamError::msg("torn"), *e),
        other => panic!("expected error item, got {other:?}"),
    }
    assert!(matches!(Pin::new(&mut it).poll_next(&mut cx), Poll::Ready(None)));
}

#[test]
fn remove_all_keeps_iteration_alive() {
    let s = Stream::bytes();
    let mut it = s.iter_async();
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    // The iterator is waiting on the stream.
    assert!(Pin::new(&mut it).poll_next(&mut cx).is_pending());

    // Clearing every public listener resets flow, but the iterator's
    // internal subscriptions survive.
    s.remove_all(None);
    assert_eq!(false, s.flowing());

    s.write(b"x").unwrap();
    match Pin::new(&mut it).poll_next(&mut cx) {
        Poll::Ready(Some(Ok(c))) => assert_eq!(Chunk::Bytes(Bytes::from_static(b"x")), c),
        other => panic!("expected item, got {other:?}"),
    }

    s.end();
    assert!(matches!(Pin::new(&mut it).poll_next(&mut cx), Poll::Ready(None)));
}

#[test]
fn buffer_length_matches_item_sizes_at_all_times() {
    let s = Stream::text(UTF_8);
    s.write("ab").unwrap();
    assert_eq!(2, s.buffer_length());
    s.write("\u{2603}").unwrap();
    assert_eq!(5, s.buffer_length());
    assert_eq!(Some(Chunk::Text("ab".to_owned())), s.read_n(2));
    assert_eq!(3, s.buffer_length());
    assert_eq!(Some(Chunk::Text("\u{2603}".to_owned())), s.read());
    assert_eq!(0, s.buffer_length());
}

#[test]
fn text_fast_path_and_byte_path_agree() {
    // The same content split arbitrarily across string and byte writes
    // collects to the same string as decoding it in one shot.
    let s = Stream::text(UTF_8);
    s.write("he").unwrap();
    s.write(&[0xE2, 0x98][..]).unwrap();
    s.write(&[0x83][..]).unwrap();
    s.write("llo").unwrap();
    s.end();
    let out = block_on(s.concat()).unwrap();
    assert_eq!(Chunk::Text("he\u{2603}llo".to_owned()), out);
}
