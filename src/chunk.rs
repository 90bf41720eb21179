use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;

use crate::decode::{encode_str, TextDecoder};

/// Payload mode of a stream, fixed at construction.
///
/// `Bytes` and `Text` apply to [`Stream<Chunk>`](crate::Stream); every
/// other item type runs in `Object` mode, where the size metric is one
/// per item.  The mode is opaque: it carries the text decoder state and
/// is handed to [`Item::normalize`] on every write.
pub struct Mode {
    kind: ModeKind,
}

pub(crate) enum ModeKind {
    Bytes,
    Text(TextDecoder),
    Object,
}

impl Mode {
    pub(crate) fn bytes() -> Self {
        Mode { kind: ModeKind::Bytes }
    }

    pub(crate) fn text(encoding: &'static Encoding) -> Self {
        Mode { kind: ModeKind::Text(TextDecoder::new(encoding)) }
    }

    pub(crate) fn object() -> Self {
        Mode { kind: ModeKind::Object }
    }

    pub(crate) fn kind_mut(&mut self) -> &mut ModeKind {
        &mut self.kind
    }

    pub(crate) fn decoder_mut(&mut self) -> Option<&mut TextDecoder> {
        match &mut self.kind {
            ModeKind::Text(d) => Some(d),
            _ => None,
        }
    }

    /// Whether items are counted rather than measured.
    pub fn is_object(&self) -> bool {
        matches!(self.kind, ModeKind::Object)
    }

    /// Whether items are decoded strings.
    pub fn is_text(&self) -> bool {
        matches!(self.kind, ModeKind::Text(_))
    }

    /// The declared encoding, in text mode.
    pub fn encoding(&self) -> Option<&'static Encoding> {
        match &self.kind {
            ModeKind::Text(d) => Some(d.encoding()),
            _ => None,
        }
    }
}

/// A stream payload item.
///
/// Implemented by [`Chunk`] for byte/text streams.  For object-mode
/// streams, implement it for your own type — or let the
/// [`object_item!`](crate::object_item) macro write the impl — and the
/// defaults give object semantics: every item has size 1, none are
/// vacant, and writes pass through untouched.
pub trait Item: Clone + 'static {
    /// What `write` accepts for this item type.
    type Input: 'static;

    /// Size metric: byte length, string length, or 1 per object.
    fn size(&self) -> usize {
        1
    }

    /// A vacant item is dropped instead of emitted as `data`.  Only
    /// byte/text chunks can be vacant.
    fn is_vacant(&self) -> bool {
        false
    }

    /// Zero-length inputs never enter the pipeline (byte/text only).
    fn input_is_empty(_input: &Self::Input) -> bool {
        false
    }

    /// Turn a write input into a buffered item, applying the mode's
    /// encode/decode normalization.
    fn normalize(input: Self::Input, mode: &mut Mode) -> Self;

    /// Reverse of [`normalize`](Item::normalize), used when one stream
    /// is piped into another.
    fn into_input(self) -> Self::Input;

    /// Carrier for the decoder's end-of-stream flush; `None` outside
    /// text mode.
    fn from_decoded_text(_s: String) -> Option<Self> {
        None
    }

    /// Collapse several buffered items into one.  Only reachable from
    /// byte/text streams, which override it.
    fn merge(_items: Vec<Self>) -> Self {
        unreachable!("merge is never called on object-mode items")
    }
}

/// Implement [`Item`] for one or more object payload types.
///
/// ```
/// #[derive(Clone, Debug, PartialEq)]
/// struct Record {
///     id: u32,
/// }
/// minipipe::object_item!(Record);
///
/// let stream = minipipe::Stream::<Record>::objects();
/// stream.write(Record { id: 1 }).unwrap();
/// ```
#[macro_export]
macro_rules! object_item {
    ($($t:ty),+ $(,)?) => {
        $(
            impl $crate::Item for $t {
                type Input = $t;
                fn normalize(input: $t, _mode: &mut $crate::Mode) -> $t {
                    input
                }
                fn into_input(self) -> $t {
                    self
                }
            }
        )+
    };
}

/// Payload of a byte- or text-mode stream.
///
/// A bytes-mode stream only ever holds `Bytes` variants and a text-mode
/// stream only `Text`; the enum exists so both modes share one item
/// type and the write side can accept either shape of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Bytes(Bytes),
    Text(String),
}

impl Chunk {
    /// Byte length or string length.
    pub fn len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload as raw bytes (utf-8 for text).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Bytes(b) => b,
            Chunk::Text(s) => s.as_bytes(),
        }
    }

    /// Split off and return the first `n` units, leaving the rest.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the chunk length, or if a text chunk would
    /// be split inside a multi-byte character.
    pub(crate) fn split_to(&mut self, n: usize) -> Chunk {
        match self {
            Chunk::Bytes(b) => Chunk::Bytes(b.split_to(n)),
            Chunk::Text(s) => {
                if !s.is_char_boundary(n) {
                    panic_split_boundary(n);
                }
                let tail = s.split_off(n);
                Chunk::Text(std::mem::replace(s, tail))
            }
        }
    }
}

impl Item for Chunk {
    type Input = WriteChunk;

    fn size(&self) -> usize {
        self.len()
    }

    fn is_vacant(&self) -> bool {
        self.is_empty()
    }

    fn input_is_empty(input: &WriteChunk) -> bool {
        input.len() == 0
    }

    fn normalize(input: WriteChunk, mode: &mut Mode) -> Chunk {
        match (mode.kind_mut(), input) {
            // Fast path: a string written to a text stream stays a
            // string, unless the decoder holds a partial sequence that
            // must come first.
            (ModeKind::Text(dec), WriteChunk::Str(s)) => {
                if dec.pending() {
                    let bytes = encode_str(&s, dec.encoding());
                    Chunk::Text(dec.write(&bytes))
                } else {
                    Chunk::Text(s)
                }
            }
            (ModeKind::Text(dec), WriteChunk::Bytes(b)) => Chunk::Text(dec.write(&b)),
            (ModeKind::Bytes, WriteChunk::Str(s)) => Chunk::Bytes(Bytes::from(s.into_bytes())),
            (ModeKind::Bytes, WriteChunk::Bytes(b)) => Chunk::Bytes(b),
            // Chunks carried by an object-mode stream pass through.
            (ModeKind::Object, WriteChunk::Str(s)) => Chunk::Text(s),
            (ModeKind::Object, WriteChunk::Bytes(b)) => Chunk::Bytes(b),
        }
    }

    fn into_input(self) -> WriteChunk {
        match self {
            Chunk::Bytes(b) => WriteChunk::Bytes(b),
            Chunk::Text(s) => WriteChunk::Str(s),
        }
    }

    fn from_decoded_text(s: String) -> Option<Chunk> {
        Some(Chunk::Text(s))
    }

    fn merge(items: Vec<Chunk>) -> Chunk {
        match items.first() {
            Some(Chunk::Text(_)) => {
                let mut out = String::with_capacity(items.iter().map(Chunk::len).sum());
                for item in &items {
                    if let Chunk::Text(s) = item {
                        out.push_str(s);
                    }
                }
                Chunk::Text(out)
            }
            _ => {
                let mut out = BytesMut::with_capacity(items.iter().map(Chunk::len).sum());
                for item in &items {
                    out.extend_from_slice(item.as_bytes());
                }
                Chunk::Bytes(out.freeze())
            }
        }
    }
}

/// Accepted shapes on the write side of a byte/text stream.
///
/// Byte slices, byte vectors, [`Bytes`] and either flavor of string
/// all convert into this; anything else is not contiguous data and
/// does not compile against the write side.
#[derive(Debug, Clone)]
pub enum WriteChunk {
    Bytes(Bytes),
    Str(String),
}

impl WriteChunk {
    pub fn len(&self) -> usize {
        match self {
            WriteChunk::Bytes(b) => b.len(),
            WriteChunk::Str(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for WriteChunk {
    fn from(b: Bytes) -> Self {
        WriteChunk::Bytes(b)
    }
}

impl From<Vec<u8>> for WriteChunk {
    fn from(v: Vec<u8>) -> Self {
        WriteChunk::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for WriteChunk {
    fn from(s: &[u8]) -> Self {
        WriteChunk::Bytes(Bytes::copy_from_slice(s))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteChunk {
    fn from(s: &[u8; N]) -> Self {
        WriteChunk::Bytes(Bytes::copy_from_slice(s))
    }
}

impl From<String> for WriteChunk {
    fn from(s: String) -> Self {
        WriteChunk::Str(s)
    }
}

impl From<&str> for WriteChunk {
    fn from(s: &str) -> Self {
        WriteChunk::Str(s.to_owned())
    }
}

impl From<Chunk> for WriteChunk {
    fn from(c: Chunk) -> Self {
        c.into_input()
    }
}

#[inline(never)]
#[cold]
#[track_caller]
fn panic_split_boundary(n: usize) -> ! {
    panic!("cannot split a text chunk inside a multi-byte character (offset {n})")
}
