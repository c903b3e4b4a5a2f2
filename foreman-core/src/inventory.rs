//! Block inventory
//!
//! The authoritative bookkeeping for every loaded block: the LIFO pending
//! queue, the in-flight list with dispatch timestamps, and the processed and
//! failed lists. Between any two dispatcher operations the four collections
//! are pairwise disjoint and together hold every loaded block.
//!
//! The inventory is a passive structure. All transitions are driven by the
//! dispatcher and the sweeper under a single lock; the only operation it
//! exposes is construction from the block-list file.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use crate::block::Block;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to read block list {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed block list {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// All dispatch state, guarded by one mutex owned by the dispatcher.
#[derive(Debug)]
pub struct Inventory {
    /// Blocks awaiting dispatch. Popped from the back, so the file order is
    /// reversed at load to hand out blocks in their original order.
    pub(crate) pending: Vec<Block>,
    /// Blocks currently assigned to some worker.
    pub(crate) in_flight: Vec<Block>,
    /// Dispatch timestamps, index-parallel to `in_flight`.
    pub(crate) stamps: Vec<Instant>,
    /// Blocks confirmed complete.
    pub(crate) processed: Vec<Block>,
    /// Blocks that exceeded the time limit in the current retry round.
    pub(crate) failed: Vec<Block>,
    /// Retry rounds consumed so far, at most `num_retries`.
    pub(crate) try_counter: u32,
    /// False once shutdown has begun.
    pub(crate) running: bool,
}

impl Inventory {
    /// Load the block list from a JSON file of offset arrays.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let blocks: Vec<Block> =
            serde_json::from_str(&raw).map_err(|source| InventoryError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        info!(
            "loaded block list from {}, added {} blocks to queue",
            path.display(),
            blocks.len()
        );
        Ok(Self::from_blocks(blocks))
    }

    /// Build an inventory from an in-memory block list.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let mut pending = blocks;
        pending.reverse();
        Self {
            pending,
            in_flight: Vec::new(),
            stamps: Vec::new(),
            processed: Vec::new(),
            failed: Vec::new(),
            try_counter: 0,
            running: true,
        }
    }

    /// Number of blocks awaiting dispatch.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
