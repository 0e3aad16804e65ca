//! Provides the frame value model for the RESP wire protocol: one variant per
//! wire type, scalar coercions, and the equality rules the rest of the crate
//! relies on.

use bytes::Bytes;
use core::fmt;
use num_enum::TryFromPrimitive;
use thiserror::Error;

/// One-byte type markers that introduce every RESP frame.
///
/// RESP2 defines `+ - : $ *`; RESP3 adds the typed scalars and aggregates.
/// The discriminant is the literal marker byte on the wire.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    SimpleString = b'+',
    SimpleError = b'-',
    Integer = b':',
    BulkString = b'$',
    Array = b'*',
    Null = b'_',
    Double = b',',
    Boolean = b'#',
    BigNumber = b'(',
    BulkError = b'!',
    Verbatim = b'=',
    Map = b'%',
    Set = b'~',
    Push = b'>',
    Attribute = b'|',
}

impl FrameKind {
    /// The wire marker byte for this kind.
    pub fn marker(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::SimpleString => "simple string",
            FrameKind::SimpleError => "simple error",
            FrameKind::Integer => "integer",
            FrameKind::BulkString => "bulk string",
            FrameKind::Array => "array",
            FrameKind::Null => "null",
            FrameKind::Double => "double",
            FrameKind::Boolean => "boolean",
            FrameKind::BigNumber => "big number",
            FrameKind::BulkError => "bulk error",
            FrameKind::Verbatim => "verbatim string",
            FrameKind::Map => "map",
            FrameKind::Set => "set",
            FrameKind::Push => "push",
            FrameKind::Attribute => "attribute",
        }
    }
}

/// A single decoded server message.
///
/// The variant set mirrors the RESP3 type system exactly. A frame's kind
/// never changes after construction and container variants own their
/// elements. The legacy null sentinels (`$-1`, `*-1`) are preserved as
/// `BulkString(None)` / `Array(None)` rather than collapsed into `Null`, so
/// diagnostics can tell which shape the server actually sent; use
/// [`Frame::is_null`] where the distinction does not matter.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Status reply such as `+OK`.
    SimpleString(Bytes),
    /// Generic failure reply, e.g. `-ERR unknown command`.
    SimpleError(Bytes),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Length-prefixed byte run; `None` is the RESP2 null (`$-1`).
    BulkString(Option<Bytes>),
    /// Length-prefixed error text (RESP3).
    BulkError(Bytes),
    /// Bulk string carrying a three-byte display-format tag (`txt`, `mkd`).
    Verbatim { format: [u8; 3], data: Bytes },
    /// IEEE-754 double; `inf`, `-inf` and `nan` are legal on the wire.
    Double(f64),
    /// Decimal integer of unbounded magnitude, kept as its digit run.
    BigNumber(Bytes),
    Boolean(bool),
    /// The dedicated RESP3 null (`_`), distinct from a null bulk string.
    Null,
    /// Ordered sequence of frames; `None` is the RESP2 null array (`*-1`).
    Array(Option<Vec<Frame>>),
    /// Ordered key/value pairs. Duplicate keys are legal on the wire and
    /// preserved; callers wanting unique-key semantics collapse them.
    Map(Vec<(Frame, Frame)>),
    /// Unordered collection; element order on the wire is arbitrary.
    Set(Vec<Frame>),
    /// Out-of-band message (pub/sub delivery, invalidation, ...). Never a
    /// reply to a request.
    Push(Vec<Frame>),
    /// Metadata map attached to the frame that followed it on the wire.
    Attribute {
        attrs: Vec<(Frame, Frame)>,
        frame: Box<Frame>,
    },
}

/// A scalar coercion was requested that the frame cannot provide without
/// losing information.
///
/// Local to the caller; the connection that produced the frame stays healthy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot read {actual} frame as {requested}")]
pub struct TypeMismatch {
    pub requested: &'static str,
    pub actual: &'static str,
}

impl TypeMismatch {
    fn new(requested: &'static str, frame: &Frame) -> TypeMismatch {
        TypeMismatch {
            requested,
            actual: frame.kind().name(),
        }
    }
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::SimpleString(_) => FrameKind::SimpleString,
            Frame::SimpleError(_) => FrameKind::SimpleError,
            Frame::Integer(_) => FrameKind::Integer,
            Frame::BulkString(_) => FrameKind::BulkString,
            Frame::BulkError(_) => FrameKind::BulkError,
            Frame::Verbatim { .. } => FrameKind::Verbatim,
            Frame::Double(_) => FrameKind::Double,
            Frame::BigNumber(_) => FrameKind::BigNumber,
            Frame::Boolean(_) => FrameKind::Boolean,
            Frame::Null => FrameKind::Null,
            Frame::Array(_) => FrameKind::Array,
            Frame::Map(_) => FrameKind::Map,
            Frame::Set(_) => FrameKind::Set,
            Frame::Push(_) => FrameKind::Push,
            Frame::Attribute { .. } => FrameKind::Attribute,
        }
    }

    /// True for every absent-value shape: the RESP3 `Null` token, a null
    /// bulk string and a null array. The variants stay distinct in the
    /// model; this is the one place they collapse.
    pub fn is_null(&self) -> bool {
        matches!(
            self.inner(),
            Frame::Null | Frame::BulkString(None) | Frame::Array(None)
        )
    }

    /// True if this frame is out-of-band and must bypass reply correlation.
    /// An attribute preamble inherits the classification of the frame it
    /// decorates.
    pub fn is_push(&self) -> bool {
        matches!(self.inner(), Frame::Push(_))
    }

    /// True for both error kinds.
    pub fn is_error(&self) -> bool {
        matches!(self.inner(), Frame::SimpleError(_) | Frame::BulkError(_))
    }

    /// The frame behind any attribute preamble. Identity for every other
    /// kind.
    pub fn inner(&self) -> &Frame {
        match self {
            Frame::Attribute { frame, .. } => frame.inner(),
            other => other,
        }
    }

    /// Discard any attribute preamble, keeping only the decorated frame.
    pub fn into_inner(self) -> Frame {
        match self {
            Frame::Attribute { frame, .. } => frame.into_inner(),
            other => other,
        }
    }

    /// Borrow this frame's payload as a byte run.
    ///
    /// Succeeds for the kinds that literally carry bytes on the wire; typed
    /// scalars and containers refuse.
    pub fn as_bytes(&self) -> Result<&[u8], TypeMismatch> {
        match self.inner() {
            Frame::SimpleString(b)
            | Frame::SimpleError(b)
            | Frame::BulkError(b)
            | Frame::BigNumber(b) => Ok(b),
            Frame::BulkString(Some(b)) => Ok(b),
            Frame::Verbatim { data, .. } => Ok(data),
            other => Err(TypeMismatch::new("byte run", other)),
        }
    }

    /// Borrow this frame's payload as UTF-8 text.
    pub fn as_str(&self) -> Result<&str, TypeMismatch> {
        let bytes = match self.as_bytes() {
            Ok(bytes) => bytes,
            Err(mut e) => {
                e.requested = "string";
                return Err(e);
            }
        };
        std::str::from_utf8(bytes).map_err(|_| TypeMismatch::new("utf-8 string", self.inner()))
    }

    /// Interpret this frame as a signed 64-bit integer.
    ///
    /// Precision-preserving coercions only: an `Integer` is returned as-is,
    /// a `Double` succeeds when it is finite and equal to its truncation,
    /// and a byte run succeeds iff its bytes parse as signed decimal.
    pub fn as_integer(&self) -> Result<i64, TypeMismatch> {
        let frame = self.inner();
        match frame {
            Frame::Integer(i) => Ok(*i),
            Frame::Double(d) if d.is_finite() && *d == d.trunc() && in_i64_range(*d) => {
                Ok(*d as i64)
            }
            Frame::SimpleString(_)
            | Frame::BulkString(Some(_))
            | Frame::Verbatim { .. }
            | Frame::BigNumber(_) => {
                let s = self
                    .as_str()
                    .map_err(|_| TypeMismatch::new("integer", frame))?;
                s.parse::<i64>()
                    .map_err(|_| TypeMismatch::new("integer", frame))
            }
            other => Err(TypeMismatch::new("integer", other)),
        }
    }

    /// Interpret this frame as a double. Integers widen; byte runs succeed
    /// when they parse (`inf`, `-inf` and `nan` included).
    pub fn as_double(&self) -> Result<f64, TypeMismatch> {
        let frame = self.inner();
        match frame {
            Frame::Double(d) => Ok(*d),
            Frame::Integer(i) => Ok(*i as f64),
            Frame::SimpleString(_) | Frame::BulkString(Some(_)) | Frame::Verbatim { .. } => {
                let s = self
                    .as_str()
                    .map_err(|_| TypeMismatch::new("double", frame))?;
                parse_wire_double(s).ok_or_else(|| TypeMismatch::new("double", frame))
            }
            other => Err(TypeMismatch::new("double", other)),
        }
    }

    /// Interpret this frame as a boolean. Besides the `Boolean` kind, the
    /// integers 0 and 1 qualify (servers use `:0`/`:1` for predicates on
    /// RESP2).
    pub fn as_boolean(&self) -> Result<bool, TypeMismatch> {
        match self.inner() {
            Frame::Boolean(b) => Ok(*b),
            Frame::Integer(0) => Ok(false),
            Frame::Integer(1) => Ok(true),
            other => Err(TypeMismatch::new("boolean", other)),
        }
    }

    /// Borrow the elements of an array-shaped frame (`Array`, `Set` or
    /// `Push`).
    pub fn as_elements(&self) -> Result<&[Frame], TypeMismatch> {
        match self.inner() {
            Frame::Array(Some(items)) => Ok(items),
            Frame::Set(items) | Frame::Push(items) => Ok(items),
            other => Err(TypeMismatch::new("array", other)),
        }
    }

    /// Borrow field/value pairs from a map-shaped reply.
    ///
    /// Servers answer field/value queries with either a `Map` (RESP3) or a
    /// flat even-length `Array` (RESP2); both shapes are accepted here.
    pub fn as_field_pairs(&self) -> Result<Vec<(&Frame, &Frame)>, TypeMismatch> {
        match self.inner() {
            Frame::Map(pairs) => Ok(pairs.iter().map(|(k, v)| (k, v)).collect()),
            Frame::Array(Some(items)) if items.len() % 2 == 0 => {
                Ok(items.chunks_exact(2).map(|c| (&c[0], &c[1])).collect())
            }
            other => Err(TypeMismatch::new("field/value pairs", other)),
        }
    }

    /// The event name of a push frame (its first element), if this is one.
    pub fn push_event(&self) -> Option<&[u8]> {
        match self.inner() {
            Frame::Push(items) => items.first().and_then(|f| f.as_bytes().ok()),
            _ => None,
        }
    }
}

fn in_i64_range(d: f64) -> bool {
    // 2^63 is exactly representable as f64; i64::MAX is not.
    d >= i64::MIN as f64 && d < 9_223_372_036_854_775_808.0
}

/// Parse a double the way the wire spells it: ordinary decimal plus the
/// `inf` / `-inf` / `nan` tokens.
pub(crate) fn parse_wire_double(s: &str) -> Option<f64> {
    match s {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" | "-nan" => Some(f64::NAN),
        _ => s.parse::<f64>().ok().filter(|d| d.is_finite()),
    }
}

fn double_eq(a: f64, b: f64) -> bool {
    // Bit identity keeps nan == nan; the value comparison tolerates 0.0/-0.0.
    a.to_bits() == b.to_bits() || a == b
}

fn multiset_eq(a: &[Frame], b: &[Frame]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut taken = vec![false; b.len()];
    'outer: for item in a {
        for (slot, other) in taken.iter_mut().zip(b) {
            if !*slot && item == other {
                *slot = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

impl PartialEq for Frame {
    /// Frames are equal iff their kinds match and their payloads are
    /// bytewise equal. Containers compare element-wise, sets as multisets,
    /// maps as ordered pair sequences (duplicate keys are legal on the
    /// wire).
    fn eq(&self, other: &Frame) -> bool {
        match (self, other) {
            (Frame::SimpleString(a), Frame::SimpleString(b)) => a == b,
            (Frame::SimpleError(a), Frame::SimpleError(b)) => a == b,
            (Frame::Integer(a), Frame::Integer(b)) => a == b,
            (Frame::BulkString(a), Frame::BulkString(b)) => a == b,
            (Frame::BulkError(a), Frame::BulkError(b)) => a == b,
            (
                Frame::Verbatim { format: fa, data: da },
                Frame::Verbatim { format: fb, data: db },
            ) => fa == fb && da == db,
            (Frame::Double(a), Frame::Double(b)) => double_eq(*a, *b),
            (Frame::BigNumber(a), Frame::BigNumber(b)) => a == b,
            (Frame::Boolean(a), Frame::Boolean(b)) => a == b,
            (Frame::Null, Frame::Null) => true,
            (Frame::Array(a), Frame::Array(b)) => a == b,
            (Frame::Map(a), Frame::Map(b)) => a == b,
            (Frame::Set(a), Frame::Set(b)) => multiset_eq(a, b),
            (Frame::Push(a), Frame::Push(b)) => a == b,
            (
                Frame::Attribute { attrs: aa, frame: fa },
                Frame::Attribute { attrs: ab, frame: fb },
            ) => aa == ab && fa == fb,
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::SimpleString(b) => write!(fmt, "+{}", String::from_utf8_lossy(b)),
            Frame::SimpleError(b) => write!(fmt, "-{}", String::from_utf8_lossy(b)),
            Frame::Integer(i) => write!(fmt, ":{i}"),
            Frame::BulkString(None) => write!(fmt, "$(null)"),
            Frame::BulkString(Some(b)) => write!(fmt, "${} bytes", b.len()),
            Frame::BulkError(b) => write!(fmt, "!{}", String::from_utf8_lossy(b)),
            Frame::Verbatim { format, data } => write!(
                fmt,
                "={}:{} bytes",
                String::from_utf8_lossy(format),
                data.len()
            ),
            Frame::Double(d) => write!(fmt, ",{d}"),
            Frame::BigNumber(b) => write!(fmt, "({}", String::from_utf8_lossy(b)),
            Frame::Boolean(b) => write!(fmt, "#{}", if *b { 't' } else { 'f' }),
            Frame::Null => write!(fmt, "_"),
            Frame::Array(None) => write!(fmt, "*(null)"),
            Frame::Array(Some(items)) => write!(fmt, "*{} items", items.len()),
            Frame::Map(pairs) => write!(fmt, "%{} pairs", pairs.len()),
            Frame::Set(items) => write!(fmt, "~{} items", items.len()),
            Frame::Push(items) => write!(fmt, ">{} items", items.len()),
            Frame::Attribute { attrs, frame } => {
                write!(fmt, "|{} attrs {frame}", attrs.len())
            }
        }
    }
}

/// Shorthand constructors used throughout the crate and its tests.
impl Frame {
    pub fn simple(text: &'static str) -> Frame {
        Frame::SimpleString(Bytes::from_static(text.as_bytes()))
    }

    pub fn bulk(bytes: impl Into<Bytes>) -> Frame {
        Frame::BulkString(Some(bytes.into()))
    }

    pub fn error(text: impl Into<Bytes>) -> Frame {
        Frame::SimpleError(text.into())
    }

    pub fn array(items: Vec<Frame>) -> Frame {
        Frame::Array(Some(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_bytes_round_trip() {
        for kind in [
            FrameKind::SimpleString,
            FrameKind::SimpleError,
            FrameKind::Integer,
            FrameKind::BulkString,
            FrameKind::Array,
            FrameKind::Null,
            FrameKind::Double,
            FrameKind::Boolean,
            FrameKind::BigNumber,
            FrameKind::BulkError,
            FrameKind::Verbatim,
            FrameKind::Map,
            FrameKind::Set,
            FrameKind::Push,
            FrameKind::Attribute,
        ] {
            assert_eq!(FrameKind::try_from(kind.marker()), Ok(kind));
        }
        assert!(FrameKind::try_from(b'@').is_err());
    }

    #[test]
    fn null_shapes_stay_distinct_but_all_read_as_null() {
        let shapes = [Frame::Null, Frame::BulkString(None), Frame::Array(None)];
        for shape in &shapes {
            assert!(shape.is_null());
        }
        assert_ne!(shapes[0], shapes[1]);
        assert_ne!(shapes[1], shapes[2]);
    }

    #[test]
    fn integer_coercions() {
        assert_eq!(Frame::Integer(42).as_integer(), Ok(42));
        assert_eq!(Frame::Double(42.0).as_integer(), Ok(42));
        assert!(Frame::Double(42.5).as_integer().is_err());
        assert!(Frame::Double(f64::INFINITY).as_integer().is_err());
        assert_eq!(Frame::bulk("-17").as_integer(), Ok(-17));
        assert!(Frame::bulk("17.0").as_integer().is_err());
        assert!(Frame::array(vec![]).as_integer().is_err());
    }

    #[test]
    fn double_coercions() {
        assert_eq!(Frame::Integer(3).as_double(), Ok(3.0));
        assert_eq!(Frame::bulk("3.25").as_double(), Ok(3.25));
        assert_eq!(Frame::bulk("-inf").as_double(), Ok(f64::NEG_INFINITY));
        assert!(Frame::bulk("nan").as_double().unwrap().is_nan());
        assert!(Frame::Boolean(true).as_double().is_err());
    }

    #[test]
    fn boolean_coercions() {
        assert_eq!(Frame::Boolean(true).as_boolean(), Ok(true));
        assert_eq!(Frame::Integer(0).as_boolean(), Ok(false));
        assert_eq!(Frame::Integer(1).as_boolean(), Ok(true));
        assert!(Frame::Integer(2).as_boolean().is_err());
    }

    #[test]
    fn attribute_delegates_coercions() {
        let framed = Frame::Attribute {
            attrs: vec![(Frame::simple("ttl"), Frame::Integer(3600))],
            frame: Box::new(Frame::Integer(9)),
        };
        assert_eq!(framed.as_integer(), Ok(9));
        assert_eq!(framed.inner(), &Frame::Integer(9));
        assert_eq!(framed.kind(), FrameKind::Attribute);
    }

    #[test]
    fn set_equality_is_multiset() {
        let a = Frame::Set(vec![Frame::Integer(1), Frame::Integer(2), Frame::Integer(2)]);
        let b = Frame::Set(vec![Frame::Integer(2), Frame::Integer(1), Frame::Integer(2)]);
        let c = Frame::Set(vec![Frame::Integer(1), Frame::Integer(1), Frame::Integer(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn map_equality_keeps_duplicates_ordered() {
        let dup = |v| {
            Frame::Map(vec![
                (Frame::simple("k"), Frame::Integer(v)),
                (Frame::simple("k"), Frame::Integer(v + 1)),
            ])
        };
        assert_eq!(dup(1), dup(1));
        assert_ne!(dup(1), dup(2));
    }

    #[test]
    fn nan_doubles_compare_equal() {
        assert_eq!(Frame::Double(f64::NAN), Frame::Double(f64::NAN));
        assert_ne!(Frame::Double(f64::NAN), Frame::Double(1.0));
    }

    #[test]
    fn field_pairs_accept_both_shapes() {
        let map = Frame::Map(vec![(Frame::bulk("f"), Frame::bulk("v"))]);
        let flat = Frame::array(vec![Frame::bulk("f"), Frame::bulk("v")]);
        assert_eq!(map.as_field_pairs().unwrap().len(), 1);
        assert_eq!(flat.as_field_pairs().unwrap().len(), 1);
        let odd = Frame::array(vec![Frame::bulk("f")]);
        assert!(odd.as_field_pairs().is_err());
    }

    #[test]
    fn push_event_name() {
        let push = Frame::Push(vec![
            Frame::bulk("message"),
            Frame::bulk("news"),
            Frame::bulk("hello"),
        ]);
        assert_eq!(push.push_event(), Some(&b"message"[..]));
        assert!(push.is_push());
        assert!(!Frame::simple("OK").is_push());
    }
}
