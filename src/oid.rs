//! Storage identifiers and kind tags
//!
//! Every stored entity is named by an [`Oid`] and carries exactly one
//! storage [`Kind`] plus an `otype` (the type name used to pick a
//! constructor on load). Kinds form a closed set:
//! - `null`: the null value
//! - `lit`: bool, int, float, str, bytes
//! - `pickle`: opaque binary-encoded scalar (complex, decimal, ...)
//! - `weakref`: weak reference edge to another oid
//! - `tuple`: immutable ordered sequence
//! - `list`: list, set, frozenset (sub-tagged by otype)
//! - `map`: dict-like mapping
//! - `obj`: reduction-based object
//! - `external`: url resolved outside the store

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, persistent identifier of one stored entity.
///
/// Allocated from a counter persisted in store metadata and never reused
/// within a store's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Oid(pub i64);

impl Oid {
    /// First identifier handed out by a fresh store
    pub const FIRST: Oid = Oid(1000);

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Oid {
        Oid(self.0 + 1)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix('@').unwrap_or(s);
        digits
            .parse::<i64>()
            .map(Oid)
            .map_err(|_| Error::InvalidOid(s.to_string()))
    }
}

/// Physical encoding of a stored entity's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Null,
    Literal,
    PickledLiteral,
    Weakref,
    Tuple,
    ListLike,
    Mapping,
    Object,
    External,
}

impl Kind {
    /// Get the tag written to the `stg_kind` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Literal => "lit",
            Kind::PickledLiteral => "pickle",
            Kind::Weakref => "weakref",
            Kind::Tuple => "tuple",
            Kind::ListLike => "list",
            Kind::Mapping => "map",
            Kind::Object => "obj",
            Kind::External => "external",
        }
    }

    pub fn all() -> &'static [Kind] {
        &[
            Kind::Null,
            Kind::Literal,
            Kind::PickledLiteral,
            Kind::Weakref,
            Kind::Tuple,
            Kind::ListLike,
            Kind::Mapping,
            Kind::Object,
            Kind::External,
        ]
    }

    /// Whether a load at depth zero may hand out a proxy instead of the value
    pub fn is_lazy(&self) -> bool {
        matches!(self, Kind::ListLike | Kind::Mapping | Kind::Object | Kind::External)
    }

    /// Whether the payload is a set of edges to other oids
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Kind::Weakref | Kind::Tuple | Kind::ListLike | Kind::Mapping | Kind::Object
        )
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "null" => Ok(Kind::Null),
            "lit" => Ok(Kind::Literal),
            "pickle" => Ok(Kind::PickledLiteral),
            "weakref" => Ok(Kind::Weakref),
            "tuple" => Ok(Kind::Tuple),
            "list" => Ok(Kind::ListLike),
            "map" => Ok(Kind::Mapping),
            "obj" => Ok(Kind::Object),
            "external" => Ok(Kind::External),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An oid together with its shape, as returned by edge lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub oid: Oid,
    pub kind: Kind,
    pub otype: String,
}

impl Entry {
    pub fn new(oid: Oid, kind: Kind, otype: impl Into<String>) -> Self {
        Self {
            oid,
            kind,
            otype: otype.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in Kind::all() {
            let parsed: Kind = kind.as_str().parse().unwrap();
            assert_eq!(&parsed, kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = "blob".parse::<Kind>().unwrap_err();
        assert!(matches!(err, Error::UnknownKind(tag) if tag == "blob"));
    }

    #[test]
    fn test_lazy_kinds() {
        assert!(Kind::Mapping.is_lazy());
        assert!(Kind::Object.is_lazy());
        assert!(!Kind::Tuple.is_lazy());
        assert!(!Kind::Literal.is_lazy());
    }

    #[test]
    fn test_oid_display_and_parse() {
        let oid = Oid(1042);
        assert_eq!(oid.to_string(), "@1042");
        assert_eq!("@1042".parse::<Oid>().unwrap(), oid);
        assert_eq!("1042".parse::<Oid>().unwrap(), oid);
    }
}
