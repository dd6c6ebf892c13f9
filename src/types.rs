//! Core data types shared by the index, query engine and durability layer
//!
//! # Key Types
//!
//! - **`ObjectId`**: identifier of a tagged object (32-bit unsigned integer)
//! - **`QueryOp`**: one step of a multi-step boolean query
//! - **`TagState`**: replication state of a single tag
//! - **`Stats`**: point-in-time statistics about the index
//!
//! # Example
//!
//! ```rust
//! use tagbox::types::{QueryKind, QueryOp};
//!
//! let op = QueryOp::and(["vip", "male"]);
//! assert_eq!(op.kind, QueryKind::And);
//!
//! let parsed: QueryKind = "NOT".parse().unwrap();
//! assert_eq!(parsed, QueryKind::Not);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Identifier of a tagged object
///
/// Roaring bitmaps store 32-bit members, so object identifiers are `u32`.
pub type ObjectId = u32;

/// How the tag list of a single [`QueryOp`] is combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    /// Intersection of every listed tag
    And,
    /// Union of every listed tag
    Or,
    /// Complement of exactly one tag against all tagged objects
    Not,
}

impl QueryKind {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::And => "AND",
            QueryKind::Or => "OR",
            QueryKind::Not => "NOT",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" => Ok(QueryKind::And),
            "OR" => Ok(QueryKind::Or),
            "NOT" => Ok(QueryKind::Not),
            other => Err(Error::InvalidQuery(format!("unknown operation: {}", other))),
        }
    }
}

/// One operation of a complex query
///
/// `kind` decides how `tags` are combined within this op. Results of separate
/// ops are always intersected with each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOp {
    /// Combination applied to this op's own tags
    pub kind: QueryKind,
    /// Tag names, in order
    pub tags: Vec<String>,
}

impl QueryOp {
    /// Create an op from a kind and tag names
    pub fn new<I, S>(kind: QueryKind, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// AND op over `tags`
    pub fn and<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(QueryKind::And, tags)
    }

    /// OR op over `tags`
    pub fn or<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(QueryKind::Or, tags)
    }

    /// NOT op over a single tag
    pub fn not(tag: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Not,
            tags: vec![tag.into()],
        }
    }

    /// Reject ops whose shape does not match their kind
    pub fn validate(&self) -> Result<(), Error> {
        if self.kind == QueryKind::Not && self.tags.len() != 1 {
            return Err(Error::InvalidQuery(format!(
                "NOT operation requires exactly one tag, got {}",
                self.tags.len()
            )));
        }
        Ok(())
    }
}

/// Replication state of a tag relative to the external store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagState {
    /// No such tag in memory
    Absent,
    /// Changed in memory since the last successful store write
    Dirty,
    /// Matches what was last written to or read from the store
    Clean,
}

/// Point-in-time statistics about the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of tags
    pub total_tags: usize,
    /// Sum of per-tag cardinalities (an object counts once per tag it holds)
    pub total_objects: u64,
    /// Cardinality of the all-objects bitmap
    pub unique_objects: u64,
    /// Sum of serialized bitmap sizes in bytes
    pub memory_usage: u64,
    /// Tag with the most objects, if any tag exists
    pub largest_tag: Option<String>,
    /// Cardinality of `largest_tag`
    pub largest_tag_size: u64,
}
