//! Reply shaping: turning decoded frames into the values callers expect.
//!
//! Shaping is table driven. Each command name maps to at most one `Shape`;
//! commands without an entry get the default conversion. A shaping failure
//! (bad UTF-8, an odd-length pair list, an unparsable score) is scoped to
//! the one reply it occurred on and never disturbs the connection or, in a
//! batch, sibling replies.

use crate::frame::Frame;
use crate::{Error, Result};

use bytes::Bytes;
use std::collections::{HashMap, HashSet};

/// A fully shaped reply value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    /// Ack and existence commands (SET, DEL, EXPIRE, SADD, ...).
    Bool(bool),
    Int(i64),
    /// A status line, e.g. `PONG`.
    Simple(String),
    Bytes(Bytes),
    List(Vec<Value>),
    /// Set-valued commands (SMEMBERS, SINTER, SUNION, SDIFF).
    Set(HashSet<String>),
    /// Flat key/value commands (HGETALL): element 2i is the key for 2i+1.
    Map(HashMap<String, String>),
    /// Ranged commands with WITHSCORES: (member, score) pairs.
    Scores(Vec<(String, f64)>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }
}

/// The transform to apply to a decoded reply.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Shape {
    /// Integer or `OK` status to boolean.
    Ack,
    /// MultiBulk to a set of strings.
    StringSet,
    /// MultiBulk of alternating entries to a map.
    Map,
    /// MultiBulk of alternating member/score entries to pairs.
    ScorePairs,
    /// No table entry; default conversion.
    Default,
}

impl Shape {
    /// Select the transform for a command. The arguments matter only for
    /// ranged commands, whose shape depends on the WITHSCORES flag.
    pub(crate) fn of(name: &str, args: &[Bytes]) -> Shape {
        match name.to_ascii_uppercase().as_str() {
            "SET" | "SETNX" | "DEL" | "EXISTS" | "EXPIRE" | "EXPIREAT" | "PERSIST"
            | "RENAMENX" | "MOVE" | "MSETNX" | "SADD" | "SREM" | "SISMEMBER" | "SMOVE"
            | "HSET" | "HSETNX" | "HDEL" | "HEXISTS" => Shape::Ack,
            "SMEMBERS" | "SINTER" | "SUNION" | "SDIFF" => Shape::StringSet,
            "HGETALL" => Shape::Map,
            "ZRANGE" | "ZREVRANGE" | "ZRANGEBYSCORE" if with_scores(args) => Shape::ScorePairs,
            _ => Shape::Default,
        }
    }
}

fn with_scores(args: &[Bytes]) -> bool {
    args.iter()
        .any(|arg| arg.eq_ignore_ascii_case(b"WITHSCORES"))
}

/// Apply a shape to a decoded reply.
///
/// An error reply skips shaping entirely and surfaces as `Err`.
pub(crate) fn shape(shape: Shape, frame: Frame) -> Result<Value> {
    if let Frame::Error(line) = frame {
        return Err(Error::server(line));
    }

    match shape {
        Shape::Ack => match frame {
            Frame::Integer(n) => Ok(Value::Bool(n > 0)),
            Frame::Simple(status) if status == "OK" => Ok(Value::Bool(true)),
            Frame::Null => Ok(Value::Bool(false)),
            other => Err(unexpected("ack", &other)),
        },
        Shape::StringSet => {
            let items = elements("set", frame)?;
            let mut set = HashSet::with_capacity(items.len());
            for item in items {
                set.insert(text(item)?);
            }
            Ok(Value::Set(set))
        }
        Shape::Map => {
            let items = elements("map", frame)?;
            if items.len() % 2 != 0 {
                return Err(Error::Protocol(
                    "map reply with an odd number of entries".to_string(),
                ));
            }
            let mut map = HashMap::with_capacity(items.len() / 2);
            let mut items = items.into_iter();
            while let (Some(key), Some(value)) = (items.next(), items.next()) {
                map.insert(text(key)?, text(value)?);
            }
            Ok(Value::Map(map))
        }
        Shape::ScorePairs => {
            let items = elements("scored range", frame)?;
            if items.len() % 2 != 0 {
                return Err(Error::Protocol(
                    "scored range reply with an odd number of entries".to_string(),
                ));
            }
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut items = items.into_iter();
            while let (Some(member), Some(score)) = (items.next(), items.next()) {
                let score = text(score)?;
                let score = score
                    .parse::<f64>()
                    .map_err(|_| Error::Protocol(format!("invalid score `{}`", score)))?;
                pairs.push((text(member)?, score));
            }
            Ok(Value::Scores(pairs))
        }
        Shape::Default => convert(frame),
    }
}

/// The default conversion for commands without a table entry. An error
/// frame nested inside an array surfaces as `Err` like a top-level one
/// would, never as a status string.
fn convert(frame: Frame) -> Result<Value> {
    match frame {
        Frame::Simple(status) => Ok(Value::Simple(status)),
        Frame::Integer(n) => Ok(Value::Int(n)),
        Frame::Bulk(data) => Ok(Value::Bytes(data)),
        Frame::Null => Ok(Value::Nil),
        Frame::Array(items) => items
            .into_iter()
            .map(convert)
            .collect::<Result<Vec<Value>>>()
            .map(Value::List),
        Frame::Error(line) => Err(Error::server(line)),
    }
}

fn elements(what: &str, frame: Frame) -> Result<Vec<Frame>> {
    match frame {
        Frame::Array(items) => Ok(items),
        Frame::Null => Ok(vec![]),
        other => Err(unexpected(what, &other)),
    }
}

fn text(frame: Frame) -> Result<String> {
    match frame {
        Frame::Simple(s) => Ok(s),
        Frame::Bulk(data) => String::from_utf8(data.to_vec())
            .map_err(|_| Error::Protocol("invalid UTF-8 in reply".to_string())),
        Frame::Integer(n) => Ok(n.to_string()),
        other => Err(unexpected("text", &other)),
    }
}

fn unexpected(what: &str, frame: &Frame) -> Error {
    Error::Protocol(format!("expected {} reply, got {:?}", what, frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_become_booleans() {
        assert_eq!(
            shape(Shape::Ack, Frame::Integer(1)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            shape(Shape::Ack, Frame::Integer(0)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            shape(Shape::Ack, Frame::Simple("OK".to_string())).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(shape(Shape::Ack, Frame::Null).unwrap(), Value::Bool(false));
    }

    #[test]
    fn set_replies_become_sets() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"1")),
            Frame::Bulk(Bytes::from_static(b"2")),
            Frame::Bulk(Bytes::from_static(b"1")),
        ]);
        let expected: HashSet<String> = ["1", "2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            shape(Shape::StringSet, frame).unwrap(),
            Value::Set(expected)
        );
    }

    #[test]
    fn alternating_entries_become_a_map() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"field")),
            Frame::Bulk(Bytes::from_static(b"value")),
            Frame::Bulk(Bytes::from_static(b"other")),
            Frame::Bulk(Bytes::from_static(b"thing")),
        ]);
        match shape(Shape::Map, frame).unwrap() {
            Value::Map(map) => {
                assert_eq!(map.len(), 2);
                assert_eq!(map["field"], "value");
                assert_eq!(map["other"], "thing");
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn odd_map_reply_is_a_protocol_error() {
        let frame = Frame::Array(vec![Frame::Bulk(Bytes::from_static(b"lonely"))]);
        assert!(matches!(
            shape(Shape::Map, frame),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn withscores_selects_score_pairs() {
        let args = [
            Bytes::from_static(b"0"),
            Bytes::from_static(b"-1"),
            Bytes::from_static(b"withscores"),
        ];
        assert_eq!(Shape::of("zrange", &args), Shape::ScorePairs);
        assert_eq!(Shape::of("zrange", &args[..2]), Shape::Default);

        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"a")),
            Frame::Bulk(Bytes::from_static(b"1.5")),
        ]);
        assert_eq!(
            shape(Shape::ScorePairs, frame).unwrap(),
            Value::Scores(vec![("a".to_string(), 1.5)])
        );
    }

    #[test]
    fn error_replies_skip_shaping() {
        let err = shape(
            Shape::Ack,
            Frame::Error("WRONGTYPE Operation against a key".to_string()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), Some("WRONGTYPE"));
    }

    #[test]
    fn nested_error_replies_are_not_mistaken_for_statuses() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"ok-element")),
            Frame::Error("WRONGTYPE Operation against a key".to_string()),
        ]);
        let err = shape(Shape::Default, frame).unwrap_err();
        assert_eq!(err.kind(), Some("WRONGTYPE"));
    }

    #[test]
    fn default_conversion_preserves_structure() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"foo")),
            Frame::Null,
            Frame::Integer(3),
        ]);
        assert_eq!(
            shape(Shape::Default, frame).unwrap(),
            Value::List(vec![
                Value::Bytes(Bytes::from_static(b"foo")),
                Value::Nil,
                Value::Int(3),
            ])
        );
    }
}
