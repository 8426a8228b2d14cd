//! Memory-synchronization directives (component D).
//!
//! Memsync directives describe pointer-reachable buffers that the type tree
//! alone does not make visible — a `c_void_p` argument that is actually a
//! length-prefixed or null-terminated buffer the routine reads or writes
//! through. Directives travel alongside a call's argument types and are
//! resolved against the argument tree both before the call (to size the
//! outbound memblock) and after it (to size the inbound write-back).
//!
//! Directives are declared dynamically — the same spirit as the type system
//! itself — so parsing starts from a loosely typed [`RawValue`] rather than
//! a fixed Rust struct literal; [`parse_all`] is where `memsync attribute
//! must be a list` is raised.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::types::Fundamental;
use crate::value::Arg;

/// A minimal dynamic value, the shape memsync directives are declared in.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    List(Vec<RawValue>),
    Map(Vec<(String, RawValue)>),
    Int(i64),
    Str(String),
    Null,
}

impl RawValue {
    fn as_list(&self) -> Option<&[RawValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    fn as_map(&self) -> Option<&[(String, RawValue)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    fn get(&self, key: &str) -> Option<&RawValue> {
        self.as_map()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// One step locating a value within an argument tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathSegment {
    /// Index into the top-level argument list.
    Arg(usize),
    /// Named struct field.
    Field(String),
    /// Array/struct-array element.
    Index(usize),
}

/// How a buffer's length is determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Length {
    Literal(usize),
    /// Read the length from another argument-tree location at call time.
    Path(Vec<PathSegment>),
    /// Scan the buffer for a zero element instead of reading a length.
    NullTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    InOut,
}

/// One memsync directive: a pointer-reachable buffer, its length, element
/// type, and which side(s) of the call must see its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub pointer_path: Vec<PathSegment>,
    pub length: Length,
    pub element: Fundamental,
    pub direction: Direction,
}

/// Parses a raw memsync attribute into directives. Fails with
/// `memsync_syntax` — and the exact message `"memsync attribute must be a
/// list"` — if the top-level value is not a list, and with `memsync_syntax`
/// for any malformed entry.
pub fn parse_all(raw: &RawValue) -> Result<Vec<Directive>, BridgeError> {
    let entries = raw
        .as_list()
        .ok_or_else(|| BridgeError::MemsyncSyntax("memsync attribute must be a list".to_string()))?;
    entries.iter().map(parse_one).collect()
}

fn parse_one(raw: &RawValue) -> Result<Directive, BridgeError> {
    let entry = raw
        .as_map()
        .ok_or_else(|| BridgeError::MemsyncSyntax("memsync entry must be a mapping".to_string()))?;
    let _ = entry;

    let pointer_raw = raw
        .get("pointer")
        .ok_or_else(|| BridgeError::MemsyncSyntax("memsync entry missing \"pointer\"".to_string()))?;
    let pointer_path = parse_path(pointer_raw)?;

    let length_raw = raw
        .get("length")
        .ok_or_else(|| BridgeError::MemsyncSyntax("memsync entry missing \"length\"".to_string()))?;
    let length = parse_length(length_raw)?;

    let element_name = raw
        .get("type")
        .and_then(RawValue::as_str)
        .ok_or_else(|| BridgeError::MemsyncSyntax("memsync entry missing \"type\"".to_string()))?;
    let element = Fundamental::from_wire_name(element_name)
        .ok_or_else(|| BridgeError::MemsyncSyntax(format!("unknown memsync element type {element_name:?}")))?;

    let direction = match raw.get("direction").and_then(RawValue::as_str).unwrap_or("inout") {
        "in" => Direction::In,
        "out" => Direction::Out,
        "inout" => Direction::InOut,
        other => {
            return Err(BridgeError::MemsyncSyntax(format!(
                "unknown memsync direction {other:?}"
            )))
        }
    };

    Ok(Directive {
        pointer_path,
        length,
        element,
        direction,
    })
}

fn parse_path(raw: &RawValue) -> Result<Vec<PathSegment>, BridgeError> {
    let items = raw
        .as_list()
        .ok_or_else(|| BridgeError::MemsyncSyntax("memsync path must be a list".to_string()))?;
    items
        .iter()
        .enumerate()
        .map(|(depth, item)| match item {
            RawValue::Int(n) if *n >= 0 => {
                if depth == 0 {
                    Ok(PathSegment::Arg(*n as usize))
                } else {
                    Ok(PathSegment::Index(*n as usize))
                }
            }
            RawValue::Str(s) => Ok(PathSegment::Field(s.clone())),
            other => Err(BridgeError::MemsyncSyntax(format!(
                "memsync path element must be a non-negative index or field name, got {other:?}"
            ))),
        })
        .collect()
}

fn parse_length(raw: &RawValue) -> Result<Length, BridgeError> {
    if let Some(s) = raw.as_str() {
        return if s == "null_terminated" {
            Ok(Length::NullTerminated)
        } else {
            Err(BridgeError::MemsyncSyntax(format!(
                "unknown memsync length sentinel {s:?}"
            )))
        };
    }
    if let Some(n) = raw.as_int() {
        return Ok(Length::Literal(n as usize));
    }
    if raw.as_list().is_some() {
        return Ok(Length::Path(parse_path(raw)?));
    }
    Err(BridgeError::MemsyncSyntax(
        "memsync length must be an integer, a path, or \"null_terminated\"".to_string(),
    ))
}

/// Locates the `Arg` at `path` within a top-level argument list.
pub fn resolve_path<'a>(args: &'a [Arg], path: &[PathSegment]) -> Result<&'a Arg, BridgeError> {
    let mut segments = path.iter();
    let top = match segments.next() {
        Some(PathSegment::Arg(i)) => args
            .get(*i)
            .ok_or_else(|| BridgeError::MemsyncResolve(format!("argument index {i} out of range")))?,
        _ => {
            return Err(BridgeError::MemsyncResolve(
                "memsync path must start with an argument index".to_string(),
            ))
        }
    };
    descend(top, segments.as_slice())
}

fn descend<'a>(value: &'a Arg, path: &[PathSegment]) -> Result<&'a Arg, BridgeError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(value);
    };
    let next = match (value, head) {
        (Arg::Struct(fields), PathSegment::Index(i)) | (Arg::Array(fields), PathSegment::Index(i)) => fields
            .get(*i)
            .ok_or_else(|| BridgeError::MemsyncResolve(format!("element index {i} out of range")))?,
        (Arg::Struct(_), PathSegment::Field(name)) => {
            return Err(BridgeError::MemsyncResolve(format!(
                "memsync struct field paths require field name resolution via type metadata, field {name:?} unresolved"
            )))
        }
        _ => {
            return Err(BridgeError::MemsyncResolve(
                "memsync path segment does not match argument shape".to_string(),
            ))
        }
    };
    descend(next, rest)
}

/// Resolves a [`Length`] to a concrete element count, given the argument
/// tree (for `Length::Path`) and the candidate buffer bytes (for
/// `Length::NullTerminated`).
pub fn resolve_length(
    length: &Length,
    args: &[Arg],
    element: Fundamental,
    buffer: Option<&[u8]>,
    arch: crate::config::Arch,
) -> Result<usize, BridgeError> {
    match length {
        Length::Literal(n) => Ok(*n),
        Length::Path(path) => {
            let resolved = resolve_path(args, path)?;
            integer_value(resolved)
        }
        Length::NullTerminated => {
            let bytes = buffer.ok_or_else(|| {
                BridgeError::MemsyncResolve("null_terminated length needs buffer contents".to_string())
            })?;
            let width = element.size(arch).max(1);
            let zero = vec![0u8; width];
            let count = bytes
                .chunks(width)
                .position(|chunk| chunk == zero.as_slice())
                .unwrap_or(bytes.len() / width);
            Ok(count)
        }
    }
}

fn integer_value(arg: &Arg) -> Result<usize, BridgeError> {
    let value = match arg {
        Arg::I8(v) => *v as i64,
        Arg::U8(v) => *v as i64,
        Arg::I16(v) => *v as i64,
        Arg::U16(v) => *v as i64,
        Arg::I32(v) => *v as i64,
        Arg::U32(v) => *v as i64,
        Arg::I64(v) => *v,
        Arg::U64(v) => *v as i64,
        _ => return Err(BridgeError::MemsyncResolve("length path did not resolve to an integer".to_string())),
    };
    if value < 0 {
        return Err(BridgeError::MemsyncResolve("length resolved to a negative value".to_string()));
    }
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_list_top_level_is_rejected_with_exact_message() {
        let raw = RawValue::Map(vec![("pointer".to_string(), RawValue::Int(0))]);
        let err = parse_all(&raw).unwrap_err();
        assert_eq!(err.to_string(), "memsync attribute must be a list");
    }

    #[test]
    fn well_formed_directive_parses() {
        let raw = RawValue::List(vec![RawValue::Map(vec![
            ("pointer".to_string(), RawValue::List(vec![RawValue::Int(0)])),
            ("length".to_string(), RawValue::List(vec![RawValue::Int(1)])),
            ("type".to_string(), RawValue::Str("c_uint8".to_string())),
            ("direction".to_string(), RawValue::Str("inout".to_string())),
        ])]);
        let directives = parse_all(&raw).unwrap();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].element, Fundamental::U8);
        assert_eq!(directives[0].direction, Direction::InOut);
        assert!(matches!(directives[0].length, Length::Path(_)));
    }

    #[test]
    fn null_terminated_sentinel_parses() {
        let raw = RawValue::List(vec![RawValue::Map(vec![
            ("pointer".to_string(), RawValue::List(vec![RawValue::Int(0)])),
            ("length".to_string(), RawValue::Str("null_terminated".to_string())),
            ("type".to_string(), RawValue::Str("c_char".to_string())),
        ])]);
        let directives = parse_all(&raw).unwrap();
        assert!(matches!(directives[0].length, Length::NullTerminated));
    }

    #[test]
    fn resolve_length_scans_for_zero_element() {
        let bytes = b"hi\0trailing-garbage".to_vec();
        let n = resolve_length(
            &Length::NullTerminated,
            &[],
            Fundamental::Char,
            Some(&bytes),
            crate::config::Arch::X86_64,
        )
        .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn resolve_length_path_reads_sibling_argument() {
        let args = vec![Arg::Bytes(vec![0; 4]), Arg::I32(3)];
        let n = resolve_length(
            &Length::Path(vec![PathSegment::Arg(1)]),
            &args,
            Fundamental::U8,
            None,
            crate::config::Arch::X86_64,
        )
        .unwrap();
        assert_eq!(n, 3);
    }
}
