//! Shutdown status serialization
//!
//! On shutdown the failed, processed and in-progress block lists are written
//! next to the configured output prefix, one JSON file per non-empty list.
//! The schema matches the input block list, so any of the files can be fed
//! back in as a fresh block list. The prefix is plain string concatenation
//! and may carry a filename stem (`./service_status_` yields
//! `./service_status_failed_blocks.json`).

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::block::Block;
use crate::inventory::Inventory;

pub const FAILED_BLOCKS_FILE: &str = "failed_blocks.json";
pub const PROCESSED_BLOCKS_FILE: &str = "processed_blocks.json";
pub const INPROGRESS_BLOCKS_FILE: &str = "inprogress_blocks.json";

/// A point-in-time copy of the three persisted lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub failed: Vec<Block>,
    pub processed: Vec<Block>,
    pub in_flight: Vec<Block>,
}

impl StatusSnapshot {
    pub(crate) fn capture(inventory: &Inventory) -> Self {
        Self {
            failed: inventory.failed.clone(),
            processed: inventory.processed.clone(),
            in_flight: inventory.in_flight.clone(),
        }
    }
}

/// Concatenate the output prefix with a status file name.
pub fn status_path(out_prefix: &Path, file_name: &str) -> PathBuf {
    let mut path = out_prefix.as_os_str().to_os_string();
    path.push(file_name);
    PathBuf::from(path)
}

/// Write every non-empty list to its status file. Absence of a file means
/// the corresponding list was empty.
pub fn write_status(status: &StatusSnapshot, out_prefix: &Path) -> io::Result<()> {
    write_block_list(&status.failed, out_prefix, FAILED_BLOCKS_FILE, "failed")?;
    write_block_list(&status.processed, out_prefix, PROCESSED_BLOCKS_FILE, "processed")?;
    write_block_list(
        &status.in_flight,
        out_prefix,
        INPROGRESS_BLOCKS_FILE,
        "in-progress",
    )?;
    Ok(())
}

fn write_block_list(
    blocks: &[Block],
    out_prefix: &Path,
    file_name: &str,
    what: &str,
) -> io::Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }
    let path = status_path(out_prefix, file_name);
    let writer = io::BufWriter::new(std::fs::File::create(&path)?);
    serde_json::to_writer(writer, blocks)?;
    info!(
        "serialized list of {} blocks with {} entries to {}",
        what,
        blocks.len(),
        path.display()
    );
    Ok(())
}
