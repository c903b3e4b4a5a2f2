//! Block identity
//!
//! A block is one unit of work, identified by a fixed-arity tuple of
//! integer offsets (a z/y/x chunk origin in the reference deployment).
//! Blocks are compared by value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of offsets identifying a block.
pub const BLOCK_ARITY: usize = 3;

/// A block offset tuple.
///
/// Serializes as a bare JSON array of integers, so a block list is
/// `[[0,0,0],[0,0,100],...]` both on disk and in the status files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Block(pub [u64; BLOCK_ARITY]);

impl Block {
    /// The raw offsets.
    pub fn offsets(&self) -> &[u64; BLOCK_ARITY] {
        &self.0
    }
}

impl From<[u64; BLOCK_ARITY]> for Block {
    fn from(offsets: [u64; BLOCK_ARITY]) -> Self {
        Self(offsets)
    }
}

impl fmt::Display for Block {
    /// Space-separated offsets, the wire form of an assigned block.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for offset in &self.0 {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{offset}")?;
            first = false;
        }
        Ok(())
    }
}
