// RESP2/RESP3 codec - streaming frame parser and request writer.
//
// The parser decodes exactly one top-level frame from a cursor over buffered
// bytes and is restartable: on `Incomplete` nothing is consumed and the same
// call with more bytes behaves as if the full buffer had been present from
// the start. The writer emits requests in the canonical RESP2 shape (an
// array of bulk strings) accepted by every server version.

use crate::frame::{Frame, FrameKind, parse_wire_double};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// Hard ceilings enforced while decoding, so a hostile or corrupted peer
/// makes the connection fail closed instead of exhausting memory.
#[derive(Debug, Clone)]
pub struct ParserLimits {
    /// Maximum aggregate nesting depth.
    pub max_depth: usize,
    /// Maximum element count for one aggregate frame.
    pub max_elements: usize,
    /// Maximum byte length of one bulk payload.
    pub max_bulk_len: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_elements: 1024 * 1024,
            max_bulk_len: 512 * 1024 * 1024,
        }
    }
}

impl ParserLimits {
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_elements(mut self, elements: usize) -> Self {
        self.max_elements = elements;
        self
    }

    pub fn with_max_bulk_len(mut self, len: usize) -> Self {
        self.max_bulk_len = len;
        self
    }
}

/// Codec errors with enough context to log why a connection was failed.
///
/// Every variant is fatal to the connection that produced it; a peer that
/// emits one malformed byte can no longer be trusted to stay frame-aligned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown frame marker: {0:#04x}")]
    UnknownMarker(u8),

    #[error("invalid {kind} length")]
    InvalidLength { kind: &'static str },

    #[error("missing CRLF terminator after {kind} payload")]
    MissingTerminator { kind: &'static str },

    #[error("invalid integer payload")]
    InvalidInteger,

    #[error("invalid double payload")]
    InvalidDouble,

    #[error("invalid boolean payload: expected 't' or 'f'")]
    InvalidBoolean,

    #[error("invalid big number payload")]
    InvalidBigNumber,

    #[error("invalid verbatim string payload")]
    InvalidVerbatim,

    #[error("unexpected payload on null frame")]
    InvalidNull,

    #[error("{what} limit exceeded: {observed} > {limit}")]
    LimitExceeded {
        what: &'static str,
        observed: usize,
        limit: usize,
    },
}

/// Outcome of one decode attempt.
///
/// `Incomplete` is an expected runtime condition hit on every partial read,
/// which is why it is a plain enum variant rather than a boxed error.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough data is buffered to finish one frame. No bytes were
    /// consumed; retry once more input arrives.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The buffered data can never become a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),
}

/// Streaming RESP frame parser.
///
/// Stateless apart from its limits: the outcome is a pure function of the
/// buffered bytes, which is what makes it restartable across partial reads.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    limits: ParserLimits,
}

impl Parser {
    pub fn new(limits: ParserLimits) -> Parser {
        Parser { limits }
    }

    /// Attempt to decode exactly one top-level frame.
    ///
    /// On success the cursor sits one byte past the frame; its position is
    /// the consumed length. On `Incomplete` the cursor position is
    /// unspecified and the caller restarts from the beginning of the buffer
    /// once more bytes arrive.
    pub fn parse(&self, src: &mut Cursor<&[u8]>) -> Result<Frame, FrameError> {
        self.parse_nested(src, 0)
    }

    fn parse_nested(&self, src: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, FrameError> {
        if depth > self.limits.max_depth {
            return Err(CodecError::LimitExceeded {
                what: "nesting depth",
                observed: depth,
                limit: self.limits.max_depth,
            }
            .into());
        }

        let marker = get_u8(src)?;
        let kind =
            FrameKind::try_from(marker).map_err(|_| CodecError::UnknownMarker(marker))?;

        let frame = match kind {
            FrameKind::SimpleString => Frame::SimpleString(copy_line(src)?),
            FrameKind::SimpleError => Frame::SimpleError(copy_line(src)?),
            FrameKind::Integer => {
                let line = get_line(src)?;
                Frame::Integer(parse_decimal(line).ok_or(CodecError::InvalidInteger)?)
            }
            FrameKind::BulkString => match self.bulk_payload(src, "bulk string", true)? {
                Some(data) => Frame::BulkString(Some(data)),
                None => Frame::BulkString(None),
            },
            FrameKind::BulkError => Frame::BulkError(self.required_bulk(src, "bulk error")?),
            FrameKind::Verbatim => {
                let data = self.required_bulk(src, "verbatim string")?;
                // Three-byte format tag, one colon, then the text.
                if data.len() < 4 || data[3] != b':' {
                    return Err(CodecError::InvalidVerbatim.into());
                }
                let format = [data[0], data[1], data[2]];
                Frame::Verbatim {
                    format,
                    data: data.slice(4..),
                }
            }
            FrameKind::Double => {
                let line = get_line(src)?;
                let text =
                    std::str::from_utf8(line).map_err(|_| CodecError::InvalidDouble)?;
                Frame::Double(parse_wire_double(text).ok_or(CodecError::InvalidDouble)?)
            }
            FrameKind::BigNumber => {
                let line = get_line(src)?;
                if !is_big_number(line) {
                    return Err(CodecError::InvalidBigNumber.into());
                }
                Frame::BigNumber(Bytes::copy_from_slice(line))
            }
            FrameKind::Boolean => match get_line(src)? {
                b"t" => Frame::Boolean(true),
                b"f" => Frame::Boolean(false),
                _ => return Err(CodecError::InvalidBoolean.into()),
            },
            FrameKind::Null => {
                if !get_line(src)?.is_empty() {
                    return Err(CodecError::InvalidNull.into());
                }
                Frame::Null
            }
            FrameKind::Array => match self.aggregate_len(src, "array", true)? {
                Some(len) => Frame::Array(Some(self.parse_elements(src, len, depth)?)),
                None => Frame::Array(None),
            },
            FrameKind::Set => {
                let len = self.required_len(src, "set")?;
                Frame::Set(self.parse_elements(src, len, depth)?)
            }
            FrameKind::Push => {
                let len = self.required_len(src, "push")?;
                Frame::Push(self.parse_elements(src, len, depth)?)
            }
            FrameKind::Map => {
                let len = self.required_len(src, "map")?;
                Frame::Map(self.parse_pairs(src, len, depth)?)
            }
            FrameKind::Attribute => {
                let len = self.required_len(src, "attribute")?;
                let attrs = self.parse_pairs(src, len, depth)?;
                let frame = Box::new(self.parse_nested(src, depth + 1)?);
                Frame::Attribute { attrs, frame }
            }
        };

        Ok(frame)
    }

    fn parse_elements(
        &self,
        src: &mut Cursor<&[u8]>,
        len: usize,
        depth: usize,
    ) -> Result<Vec<Frame>, FrameError> {
        let mut items = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            items.push(self.parse_nested(src, depth + 1)?);
        }
        Ok(items)
    }

    fn parse_pairs(
        &self,
        src: &mut Cursor<&[u8]>,
        len: usize,
        depth: usize,
    ) -> Result<Vec<(Frame, Frame)>, FrameError> {
        let mut pairs = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            let key = self.parse_nested(src, depth + 1)?;
            let value = self.parse_nested(src, depth + 1)?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    /// Read an aggregate header line. `Ok(None)` is the legacy `-1` null,
    /// only legal where `nullable` says so.
    fn aggregate_len(
        &self,
        src: &mut Cursor<&[u8]>,
        kind: &'static str,
        nullable: bool,
    ) -> Result<Option<usize>, FrameError> {
        let line = get_line(src)?;
        if nullable && line == b"-1" {
            return Ok(None);
        }
        let len = parse_unsigned(line).ok_or(CodecError::InvalidLength { kind })?;
        if len > self.limits.max_elements {
            return Err(CodecError::LimitExceeded {
                what: "aggregate element count",
                observed: len,
                limit: self.limits.max_elements,
            }
            .into());
        }
        Ok(Some(len))
    }

    /// An aggregate header for a kind that has no null form.
    fn required_len(&self, src: &mut Cursor<&[u8]>, kind: &'static str) -> Result<usize, FrameError> {
        match self.aggregate_len(src, kind, false)? {
            Some(len) => Ok(len),
            None => Err(CodecError::InvalidLength { kind }.into()),
        }
    }

    /// A bulk payload for a kind that has no null form.
    fn required_bulk(&self, src: &mut Cursor<&[u8]>, kind: &'static str) -> Result<Bytes, FrameError> {
        match self.bulk_payload(src, kind, false)? {
            Some(data) => Ok(data),
            None => Err(CodecError::InvalidLength { kind }.into()),
        }
    }

    /// Read a length-prefixed payload plus its trailing CRLF.
    fn bulk_payload(
        &self,
        src: &mut Cursor<&[u8]>,
        kind: &'static str,
        nullable: bool,
    ) -> Result<Option<Bytes>, FrameError> {
        let line = get_line(src)?;
        if nullable && line == b"-1" {
            return Ok(None);
        }
        let len = parse_unsigned(line).ok_or(CodecError::InvalidLength { kind })?;
        if len > self.limits.max_bulk_len {
            return Err(CodecError::LimitExceeded {
                what: "bulk length",
                observed: len,
                limit: self.limits.max_bulk_len,
            }
            .into());
        }

        let start = src.position() as usize;
        let buf = *src.get_ref();
        if buf.len() < start + len + 2 {
            return Err(FrameError::Incomplete);
        }
        if &buf[start + len..start + len + 2] != b"\r\n" {
            return Err(CodecError::MissingTerminator { kind }.into());
        }
        let data = Bytes::copy_from_slice(&buf[start..start + len]);
        src.set_position((start + len + 2) as u64);
        Ok(Some(data))
    }
}

/// Advance past one CRLF-terminated line and return its payload.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], FrameError> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
        i += 1;
    }
    Err(FrameError::Incomplete)
}

fn copy_line(src: &mut Cursor<&[u8]>) -> Result<Bytes, FrameError> {
    Ok(Bytes::copy_from_slice(get_line(src)?))
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, FrameError> {
    let pos = src.position() as usize;
    let buf = *src.get_ref();
    if pos >= buf.len() {
        return Err(FrameError::Incomplete);
    }
    src.set_position((pos + 1) as u64);
    Ok(buf[pos])
}

/// Strict signed decimal: optional `-`, no leading `+`, digits only.
fn parse_decimal(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse::<i64>().ok().filter(|_| {
        !line.starts_with(b"+") && !line.is_empty()
    })
}

fn parse_unsigned(line: &[u8]) -> Option<usize> {
    if line.is_empty() || !line.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(line).ok()?.parse::<usize>().ok()
}

fn is_big_number(line: &[u8]) -> bool {
    let digits = match line.first() {
        Some(b'+') | Some(b'-') => &line[1..],
        _ => line,
    };
    !digits.is_empty() && digits.iter().all(|b| b.is_ascii_digit())
}

const CRLF: &[u8] = b"\r\n";

/// Serialise a request as the canonical Array-of-BulkStrings frame.
///
/// Given a verb and N arguments this emits one array of length N+1. The
/// only scratch space is the on-stack decimal formatting buffer inside
/// [`write_decimal`]; argument bytes are copied straight into `dst`.
pub fn encode_command(dst: &mut BytesMut, verb: &[u8], args: &[Bytes]) {
    dst.put_u8(FrameKind::Array.marker());
    write_decimal(dst, (args.len() + 1) as i64);
    dst.put_slice(CRLF);
    write_bulk(dst, verb);
    for arg in args {
        write_bulk(dst, arg);
    }
}

fn write_bulk(dst: &mut BytesMut, payload: &[u8]) {
    dst.put_u8(FrameKind::BulkString.marker());
    write_decimal(dst, payload.len() as i64);
    dst.put_slice(CRLF);
    dst.put_slice(payload);
    dst.put_slice(CRLF);
}

/// Format a decimal through a fixed stack scratch buffer; i64::MIN included.
pub(crate) fn write_decimal(dst: &mut BytesMut, val: i64) {
    let mut scratch = [0u8; 20];
    let mut i = scratch.len();
    let negative = val < 0;
    let mut magnitude = val.unsigned_abs();
    loop {
        i -= 1;
        scratch[i] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if negative {
        i -= 1;
        scratch[i] = b'-';
    }
    dst.put_slice(&scratch[i..]);
}

/// Encode any model frame back to its wire form.
///
/// Requests never need this (they go through [`encode_command`]); it exists
/// for round-trip verification and the synthetic servers in the test suite.
pub fn encode_frame(dst: &mut BytesMut, frame: &Frame) {
    let marker = frame.kind().marker();
    match frame {
        Frame::SimpleString(data) | Frame::SimpleError(data) | Frame::BigNumber(data) => {
            dst.put_u8(marker);
            dst.put_slice(data);
            dst.put_slice(CRLF);
        }
        Frame::Integer(i) => {
            dst.put_u8(marker);
            write_decimal(dst, *i);
            dst.put_slice(CRLF);
        }
        Frame::BulkString(None) => dst.put_slice(b"$-1\r\n"),
        Frame::BulkString(Some(data)) => write_bulk(dst, data),
        Frame::BulkError(data) => {
            dst.put_u8(marker);
            write_decimal(dst, data.len() as i64);
            dst.put_slice(CRLF);
            dst.put_slice(data);
            dst.put_slice(CRLF);
        }
        Frame::Verbatim { format, data } => {
            dst.put_u8(marker);
            write_decimal(dst, (data.len() + 4) as i64);
            dst.put_slice(CRLF);
            dst.put_slice(format);
            dst.put_u8(b':');
            dst.put_slice(data);
            dst.put_slice(CRLF);
        }
        Frame::Double(d) => {
            dst.put_u8(marker);
            if d.is_nan() {
                dst.put_slice(b"nan");
            } else if *d == f64::INFINITY {
                dst.put_slice(b"inf");
            } else if *d == f64::NEG_INFINITY {
                dst.put_slice(b"-inf");
            } else {
                dst.put_slice(format!("{d}").as_bytes());
            }
            dst.put_slice(CRLF);
        }
        Frame::Boolean(b) => {
            dst.put_u8(marker);
            dst.put_u8(if *b { b't' } else { b'f' });
            dst.put_slice(CRLF);
        }
        Frame::Null => dst.put_slice(b"_\r\n"),
        Frame::Array(None) => dst.put_slice(b"*-1\r\n"),
        Frame::Array(Some(items)) => encode_aggregate(dst, marker, items),
        Frame::Set(items) => encode_aggregate(dst, marker, items),
        Frame::Push(items) => encode_aggregate(dst, marker, items),
        Frame::Map(pairs) => encode_pairs(dst, marker, pairs),
        Frame::Attribute { attrs, frame } => {
            encode_pairs(dst, marker, attrs);
            encode_frame(dst, frame);
        }
    }
}

fn encode_aggregate(dst: &mut BytesMut, marker: u8, items: &[Frame]) {
    dst.put_u8(marker);
    write_decimal(dst, items.len() as i64);
    dst.put_slice(CRLF);
    for item in items {
        encode_frame(dst, item);
    }
}

fn encode_pairs(dst: &mut BytesMut, marker: u8, pairs: &[(Frame, Frame)]) {
    dst.put_u8(marker);
    write_decimal(dst, pairs.len() as i64);
    dst.put_slice(CRLF);
    for (key, value) in pairs {
        encode_frame(dst, key);
        encode_frame(dst, value);
    }
}
