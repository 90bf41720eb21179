use bytes::Bytes;
use encoding_rs::{Decoder, Encoding, UTF_16LE, UTF_8};

/// Incremental byte-to-string decoder for text-mode streams.
///
/// Wraps an [`encoding_rs`] streaming decoder: each [`write`] yields
/// the longest prefix of the input that forms complete codepoints in
/// the configured encoding, while trailing partial sequences stay
/// buffered inside the decoder until the continuation bytes arrive.
/// [`finish`] flushes whatever is left, emitting replacement
/// characters for a dangling partial sequence.
///
/// [`write`]: TextDecoder::write
/// [`finish`]: TextDecoder::finish
pub(crate) struct TextDecoder {
    encoding: &'static Encoding,
    inner: Decoder,
    probe: Probe,
}

/// Tracks whether the wrapped decoder is holding a partial multi-byte
/// sequence.  encoding_rs does not expose that state, so it is shadowed
/// here for the encodings where it can arise: utf-8 (incomplete lead
/// sequences) and utf-16le (odd byte, or a high surrogate awaiting its
/// pair).  Single-byte encodings never hold state.
enum Probe {
    Utf8 { need: u8 },
    Utf16Le { carry: Option<u8>, high_surrogate: bool },
    None,
}

impl Probe {
    fn new(encoding: &'static Encoding) -> Self {
        if encoding == UTF_8 {
            Probe::Utf8 { need: 0 }
        } else if encoding == UTF_16LE {
            Probe::Utf16Le { carry: None, high_surrogate: false }
        } else {
            Probe::None
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        match self {
            Probe::Utf8 { need } => {
                for &b in bytes {
                    if *need > 0 && b & 0xC0 == 0x80 {
                        *need -= 1;
                    } else {
                        *need = utf8_lead_need(b);
                    }
                }
            }
            Probe::Utf16Le { carry, high_surrogate } => {
                let mut last_unit = None;
                let mut rest = bytes;
                if let Some(lo) = carry.take() {
                    match rest.split_first() {
                        Some((&hi, tail)) => {
                            last_unit = Some(u16::from_le_bytes([lo, hi]));
                            rest = tail;
                        }
                        None => {
                            *carry = Some(lo);
                            return;
                        }
                    }
                }
                let mut pairs = rest.chunks_exact(2);
                for p in &mut pairs {
                    last_unit = Some(u16::from_le_bytes([p[0], p[1]]));
                }
                if let [b] = pairs.remainder() {
                    *carry = Some(*b);
                }
                if let Some(u) = last_unit {
                    *high_surrogate = (0xD800..0xDC00).contains(&u);
                }
            }
            Probe::None => {}
        }
    }

    fn pending(&self) -> bool {
        match self {
            Probe::Utf8 { need } => *need > 0,
            Probe::Utf16Le { carry, high_surrogate } => carry.is_some() || *high_surrogate,
            Probe::None => false,
        }
    }

    fn reset(&mut self) {
        match self {
            Probe::Utf8 { need } => *need = 0,
            Probe::Utf16Le { carry, high_surrogate } => {
                *carry = None;
                *high_surrogate = false;
            }
            Probe::None => {}
        }
    }
}

/// Continuation bytes still owed after this lead byte.  Continuation
/// and invalid lead bytes owe nothing; the decoder replaces them.
fn utf8_lead_need(b: u8) -> u8 {
    match b {
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        _ => 0,
    }
}

impl TextDecoder {
    pub(crate) fn new(encoding: &'static Encoding) -> Self {
        TextDecoder {
            encoding,
            inner: encoding.new_decoder(),
            probe: Probe::new(encoding),
        }
    }

    pub(crate) fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Whether a partial multi-byte sequence is buffered, in which case
    /// the next string write must not bypass the decoder.
    pub(crate) fn pending(&self) -> bool {
        self.probe.pending()
    }

    /// Decode a chunk, retaining any trailing partial sequence.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(
            self.inner
                .max_utf8_buffer_length(bytes.len())
                .unwrap_or(bytes.len() * 3 + 4),
        );
        let (_, read, _) = self.inner.decode_to_string(bytes, &mut out, false);
        debug_assert_eq!(read, bytes.len());
        self.probe.feed(bytes);
        out
    }

    /// Flush the decoder at end of stream.
    pub(crate) fn finish(&mut self) -> String {
        let mut out = String::with_capacity(
            self.inner.max_utf8_buffer_length(0).unwrap_or(16),
        );
        let _ = self.inner.decode_to_string(&[], &mut out, true);
        self.probe.reset();
        out
    }
}

/// Encode a string in the given encoding, for string writes that must
/// rejoin the byte path of a text-mode stream.  encoding_rs has no
/// utf-16le encoder, so that one is spelled out.
pub(crate) fn encode_str(s: &str, encoding: &'static Encoding) -> Bytes {
    if encoding == UTF_16LE {
        let mut v = Vec::with_capacity(s.len() * 2);
        for unit in s.encode_utf16() {
            v.extend_from_slice(&unit.to_le_bytes());
        }
        Bytes::from(v)
    } else {
        let (out, _, _) = encoding.encode(s);
        Bytes::from(out.into_owned())
    }
}
