//! The stat-proxy wire protocol.
//!
//! Every datagram carries exactly one event as colon-delimited ASCII:
//!
//! ```text
//! RL:<source>:<metric>:<opcode>:<value>             scalar opcodes
//! RL:<source>:<metric>:<opcode>:<value>:<pattern>   pattern and cardinality opcodes
//! ```
//!
//! | opcode | meaning                      |
//! |--------|------------------------------|
//! | `P`    | Sum                          |
//! | `S`    | Set                          |
//! | `M`    | Max                          |
//! | `I`    | Min                          |
//! | `A`    | Avg                          |
//! | `L`    | rolling cardinality insert   |
//! | `D`    | daily cardinality insert     |
//! | `T`    | pattern Sum                  |
//! | `E`    | pattern Set                  |
//! | `N`    | pattern Min                  |
//! | `X`    | pattern Max                  |
//! | `G`    | pattern Avg                  |
//!
//! The protocol is one-way. A datagram that does not decode is dropped by the
//! caller and nothing is sent back. Cardinality inserts carry a value field
//! for uniformity but only the pattern is counted.

use std::{fmt, str};

use crate::metric::{Kind, SketchSet};

/// Literal prefix of every datagram.
pub const SENTINEL: &[u8] = b"RL:";
/// Datagrams shorter than this are rejected.
pub const MIN_DATAGRAM_BYTES: usize = 9;
/// The receive buffer size. Longer datagrams are truncated by the socket.
pub const MAX_DATAGRAM_BYTES: usize = 2048;

const SCALAR_FIELDS: usize = 5;
const PATTERN_FIELDS: usize = 6;

/// Errors produced by [`decode`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The datagram is shorter than [`MIN_DATAGRAM_BYTES`].
    #[error("datagram of {0} bytes is too short")]
    TooShort(usize),
    /// The datagram does not begin with [`SENTINEL`].
    #[error("datagram does not begin with the RL: sentinel")]
    BadSentinel,
    /// The datagram is not valid UTF-8.
    #[error("datagram is not valid UTF-8")]
    Utf8,
    /// The datagram has neither 5 nor 6 fields.
    #[error("expected 5 or 6 fields, found {0}")]
    FieldCount(usize),
    /// The value field is not a base-10 integer.
    #[error("value {0:?} is not a base-10 integer")]
    InvalidValue(String),
    /// The opcode field is not in the opcode table.
    #[error("unknown opcode {0:?}")]
    UnknownOpcode(String),
    /// A pattern or cardinality opcode arrived without its pattern field.
    #[error("opcode {0} requires a pattern field")]
    MissingPattern(char),
    /// A scalar opcode arrived with a pattern field.
    #[error("opcode {0} does not take a pattern field")]
    UnexpectedPattern(char),
}

impl Error {
    /// Short, stable label for this rejection, suitable as a metric label.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Error::TooShort(_) => "too_short",
            Error::BadSentinel => "bad_sentinel",
            Error::Utf8 => "utf8",
            Error::FieldCount(_) => "field_count",
            Error::InvalidValue(_) => "invalid_value",
            Error::UnknownOpcode(_) => "unknown_opcode",
            Error::MissingPattern(_) => "missing_pattern",
            Error::UnexpectedPattern(_) => "unexpected_pattern",
        }
    }
}

/// The single-character tag selecting a write kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `P`
    Sum,
    /// `S`
    Set,
    /// `M`
    Max,
    /// `I`
    Min,
    /// `A`
    Avg,
    /// `L`
    Rolling,
    /// `D`
    Daily,
    /// `T`
    PatternSum,
    /// `E`
    PatternSet,
    /// `N`
    PatternMin,
    /// `X`
    PatternMax,
    /// `G`
    PatternAvg,
}

impl Opcode {
    /// Look up the opcode for a wire tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let op = match tag {
            "P" => Opcode::Sum,
            "S" => Opcode::Set,
            "M" => Opcode::Max,
            "I" => Opcode::Min,
            "A" => Opcode::Avg,
            "L" => Opcode::Rolling,
            "D" => Opcode::Daily,
            "T" => Opcode::PatternSum,
            "E" => Opcode::PatternSet,
            "N" => Opcode::PatternMin,
            "X" => Opcode::PatternMax,
            "G" => Opcode::PatternAvg,
            _ => return None,
        };
        Some(op)
    }

    /// The wire tag of this opcode.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Opcode::Sum => 'P',
            Opcode::Set => 'S',
            Opcode::Max => 'M',
            Opcode::Min => 'I',
            Opcode::Avg => 'A',
            Opcode::Rolling => 'L',
            Opcode::Daily => 'D',
            Opcode::PatternSum => 'T',
            Opcode::PatternSet => 'E',
            Opcode::PatternMin => 'N',
            Opcode::PatternMax => 'X',
            Opcode::PatternAvg => 'G',
        }
    }

    /// Whether this opcode requires the sixth, pattern, field.
    #[must_use]
    pub fn takes_pattern(self) -> bool {
        !matches!(
            self,
            Opcode::Sum | Opcode::Set | Opcode::Max | Opcode::Min | Opcode::Avg
        )
    }

    /// The reduction kind of a scalar or pattern opcode.
    #[must_use]
    pub fn kind(self) -> Option<Kind> {
        match self {
            Opcode::Sum | Opcode::PatternSum => Some(Kind::Sum),
            Opcode::Set | Opcode::PatternSet => Some(Kind::Set),
            Opcode::Max | Opcode::PatternMax => Some(Kind::Max),
            Opcode::Min | Opcode::PatternMin => Some(Kind::Min),
            Opcode::Avg | Opcode::PatternAvg => Some(Kind::Avg),
            Opcode::Rolling | Opcode::Daily => None,
        }
    }

    fn into_op(self, value: i64, pattern: Option<&str>) -> Result<Op<'_>, Error> {
        let tag = self.tag();
        match (self.takes_pattern(), pattern) {
            (false, Some(_)) => return Err(Error::UnexpectedPattern(tag)),
            (true, None) => return Err(Error::MissingPattern(tag)),
            _ => {}
        }
        let op = match (self, self.kind(), pattern) {
            (Opcode::Rolling, _, Some(pattern)) => Op::Cardinality {
                set: SketchSet::Rolling,
                value,
                pattern,
            },
            (Opcode::Daily, _, Some(pattern)) => Op::Cardinality {
                set: SketchSet::Daily,
                value,
                pattern,
            },
            (_, Some(kind), Some(pattern)) => Op::Pattern {
                kind,
                value,
                pattern,
            },
            (_, Some(kind), None) => Op::Scalar { kind, value },
            (_, None, _) => return Err(Error::MissingPattern(tag)),
        };
        Ok(op)
    }
}

/// A decoded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op<'a> {
    /// Write to a plain numeric metric.
    Scalar {
        /// Reduction kind
        kind: Kind,
        /// Delta
        value: i64,
    },
    /// Write to one pattern of a pattern-keyed metric.
    Pattern {
        /// Reduction kind
        kind: Kind,
        /// Delta
        value: i64,
        /// The pattern dimension
        pattern: &'a str,
    },
    /// Insert a value into a cardinality sketch.
    Cardinality {
        /// Target sketch set
        set: SketchSet,
        /// Carried on the wire, not counted
        value: i64,
        /// The value whose distinct occurrences are counted
        pattern: &'a str,
    },
}

impl Op<'_> {
    /// The opcode that encodes this write.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Scalar { kind, .. } => match kind {
                Kind::Sum => Opcode::Sum,
                Kind::Set => Opcode::Set,
                Kind::Max => Opcode::Max,
                Kind::Min => Opcode::Min,
                Kind::Avg => Opcode::Avg,
            },
            Op::Pattern { kind, .. } => match kind {
                Kind::Sum => Opcode::PatternSum,
                Kind::Set => Opcode::PatternSet,
                Kind::Max => Opcode::PatternMax,
                Kind::Min => Opcode::PatternMin,
                Kind::Avg => Opcode::PatternAvg,
            },
            Op::Cardinality { set, .. } => match set {
                SketchSet::Rolling => Opcode::Rolling,
                SketchSet::Daily => Opcode::Daily,
            },
        }
    }
}

/// One decoded datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event<'a> {
    /// The reporting source, by convention `<name>/<nodeId>`
    pub source: &'a str,
    /// The metric written to
    pub metric: &'a str,
    /// What to write
    pub op: Op<'a>,
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.op.opcode().tag();
        match self.op {
            Op::Scalar { value, .. } => {
                write!(f, "RL:{}:{}:{tag}:{value}", self.source, self.metric)
            }
            Op::Pattern { value, pattern, .. } | Op::Cardinality { value, pattern, .. } => {
                write!(
                    f,
                    "RL:{}:{}:{tag}:{value}:{pattern}",
                    self.source, self.metric
                )
            }
        }
    }
}

/// Decode one datagram payload.
///
/// # Errors
///
/// Function will return an error if the payload is too short, lacks the
/// sentinel, is not UTF-8, has the wrong field count, carries a non-integer
/// value or an unknown opcode, or if the presence of the pattern field does
/// not match the opcode.
pub fn decode(payload: &[u8]) -> Result<Event<'_>, Error> {
    if payload.len() < MIN_DATAGRAM_BYTES {
        return Err(Error::TooShort(payload.len()));
    }
    if !payload.starts_with(SENTINEL) {
        return Err(Error::BadSentinel);
    }
    let text = str::from_utf8(payload).map_err(|_| Error::Utf8)?;

    let mut fields = [""; PATTERN_FIELDS];
    let mut count = 0;
    for field in text.split(':') {
        if count < PATTERN_FIELDS {
            fields[count] = field;
        }
        count += 1;
    }
    if count != SCALAR_FIELDS && count != PATTERN_FIELDS {
        return Err(Error::FieldCount(count));
    }

    let [_, source, metric, tag, value, pattern] = fields;
    let value: i64 = value
        .parse()
        .map_err(|_| Error::InvalidValue(value.to_owned()))?;
    let opcode = Opcode::from_tag(tag).ok_or_else(|| Error::UnknownOpcode(tag.to_owned()))?;
    let pattern = (count == PATTERN_FIELDS).then_some(pattern);
    let op = opcode.into_op(value, pattern)?;

    Ok(Event { source, metric, op })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalar_sum() {
        let event = decode(b"RL:app1:reqs:P:5").expect("decode failed");
        assert_eq!(event.source, "app1");
        assert_eq!(event.metric, "reqs");
        assert_eq!(
            event.op,
            Op::Scalar {
                kind: Kind::Sum,
                value: 5
            }
        );
    }

    #[test]
    fn decode_every_scalar_opcode() {
        for (tag, kind) in [
            ("P", Kind::Sum),
            ("S", Kind::Set),
            ("M", Kind::Max),
            ("I", Kind::Min),
            ("A", Kind::Avg),
        ] {
            let payload = format!("RL:web/1:latency:{tag}:-42");
            let event = decode(payload.as_bytes()).expect("decode failed");
            assert_eq!(event.op, Op::Scalar { kind, value: -42 });
        }
    }

    #[test]
    fn decode_every_pattern_opcode() {
        for (tag, kind) in [
            ("T", Kind::Sum),
            ("E", Kind::Set),
            ("N", Kind::Min),
            ("X", Kind::Max),
            ("G", Kind::Avg),
        ] {
            let payload = format!("RL:web/1:hits:{tag}:3:/index");
            let event = decode(payload.as_bytes()).expect("decode failed");
            assert_eq!(
                event.op,
                Op::Pattern {
                    kind,
                    value: 3,
                    pattern: "/index"
                }
            );
        }
    }

    #[test]
    fn decode_cardinality() {
        let event = decode(b"RL:web/1:users:L:1:u42").expect("decode failed");
        assert_eq!(
            event.op,
            Op::Cardinality {
                set: SketchSet::Rolling,
                value: 1,
                pattern: "u42"
            }
        );
        let event = decode(b"RL:web/1:users:D:0:u42").expect("decode failed");
        assert!(matches!(
            event.op,
            Op::Cardinality {
                set: SketchSet::Daily,
                ..
            }
        ));
    }

    #[test]
    fn reject_four_fields() {
        assert_eq!(decode(b"RL:app1:reqs:P"), Err(Error::FieldCount(4)));
    }

    #[test]
    fn reject_seven_fields() {
        assert_eq!(decode(b"RL:a:b:T:1:x:y"), Err(Error::FieldCount(7)));
    }

    #[test]
    fn reject_short_payload() {
        assert_eq!(decode(b"RL:a:b:P"), Err(Error::TooShort(8)));
        assert_eq!(decode(b""), Err(Error::TooShort(0)));
    }

    #[test]
    fn reject_bad_sentinel() {
        assert_eq!(decode(b"XX:app1:reqs:P:5"), Err(Error::BadSentinel));
        assert_eq!(decode(b"rl:app1:reqs:P:5"), Err(Error::BadSentinel));
    }

    #[test]
    fn reject_non_utf8() {
        assert_eq!(decode(b"RL:app\xff:reqs:P:5"), Err(Error::Utf8));
    }

    #[test]
    fn reject_non_integer_value() {
        assert_eq!(
            decode(b"RL:app1:reqs:P:5.5"),
            Err(Error::InvalidValue("5.5".to_string()))
        );
        assert_eq!(
            decode(b"RL:app1:reqs:P:five"),
            Err(Error::InvalidValue("five".to_string()))
        );
        assert_eq!(
            decode(b"RL:app1:reqs:P:5\n"),
            Err(Error::InvalidValue("5\n".to_string()))
        );
    }

    #[test]
    fn reject_unknown_opcode() {
        assert_eq!(
            decode(b"RL:app1:reqs:Q:5"),
            Err(Error::UnknownOpcode("Q".to_string()))
        );
        assert_eq!(
            decode(b"RL:app1:reqs:PP:5"),
            Err(Error::UnknownOpcode("PP".to_string()))
        );
    }

    #[test]
    fn reject_missing_pattern() {
        assert_eq!(decode(b"RL:app1:reqs:T:5"), Err(Error::MissingPattern('T')));
        assert_eq!(decode(b"RL:app1:users:L:1"), Err(Error::MissingPattern('L')));
    }

    #[test]
    fn reject_unexpected_pattern() {
        assert_eq!(
            decode(b"RL:app1:reqs:P:5:x"),
            Err(Error::UnexpectedPattern('P'))
        );
    }

    #[test]
    fn display_is_the_wire_form() {
        for wire in [
            "RL:app1:reqs:P:5",
            "RL:svc/3:lat:A:-7",
            "RL:svc/3:hits:G:12:/home",
            "RL:svc/3:users:D:0:u1",
        ] {
            let event = decode(wire.as_bytes()).expect("decode failed");
            assert_eq!(event.to_string(), wire);
        }
    }

    #[test]
    fn empty_pattern_is_a_pattern() {
        let event = decode(b"RL:a:b:E:1:").expect("decode failed");
        assert_eq!(
            event.op,
            Op::Pattern {
                kind: Kind::Set,
                value: 1,
                pattern: ""
            }
        );
    }
}
