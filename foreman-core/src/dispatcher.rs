//! Block dispatch state machine
//!
//! The dispatcher owns the inventory behind a single mutex and serves the
//! two wire operations against it: handing out blocks and accepting
//! confirms. It also carries the sweeper's scan body and the retry
//! controller, so every state transition lives in one place.
//!
//! The handle is cheap to clone; connection handlers and the sweeper all
//! share the same inventory and shutdown channel.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::block::Block;
use crate::config::Config;
use crate::inventory::Inventory;
use crate::status::{self, StatusSnapshot};

/// Tuning for the dispatch state machine.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// How long an in-flight block may go unconfirmed.
    pub time_limit: Duration,
    /// Sweeper period, also the drain-wait poll interval.
    pub check_interval: Duration,
    /// Maximum number of retry rounds.
    pub num_retries: u32,
    /// Status-file prefix; no persistence when absent.
    pub out_prefix: Option<PathBuf>,
}

impl DispatchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_limit: Duration::from_secs(config.time_limit),
            check_interval: Duration::from_secs(config.check_interval),
            num_retries: config.num_retries,
            out_prefix: config.out_prefix.clone(),
        }
    }
}

/// Current set sizes, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryStats {
    pub pending: usize,
    pub in_flight: usize,
    pub processed: usize,
    pub failed: usize,
    pub try_counter: u32,
}

/// Shared handle onto the dispatch state machine.
#[derive(Clone)]
pub struct Dispatcher {
    inventory: Arc<Mutex<Inventory>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(inventory: Inventory, options: DispatchOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inventory: Arc::new(Mutex::new(inventory)),
            shutdown_tx: Arc::new(shutdown_tx),
            options,
        }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// A receiver that flips to `true` once shutdown has begun.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn stats(&self) -> InventoryStats {
        let inv = self.lock();
        InventoryStats {
            pending: inv.pending.len(),
            in_flight: inv.in_flight.len(),
            processed: inv.processed.len(),
            failed: inv.failed.len(),
            try_counter: inv.try_counter,
        }
    }

    /// Hand out the next block, or `None` once the service is out of work.
    ///
    /// When the pending queue is empty this waits for the in-flight blocks
    /// to be confirmed or expired, then either opens a retry round or
    /// begins shutdown. The wait sleeps with the lock released; the sweeper
    /// has to get at the inventory to drain it.
    pub async fn request_block(&self) -> Option<Block> {
        loop {
            {
                let mut inv = self.lock();
                if !inv.running {
                    return None;
                }
                if let Some(block) = Self::dispatch_next(&mut inv) {
                    return Some(block);
                }
                if inv.in_flight.is_empty() {
                    if inv.try_counter < self.options.num_retries && !inv.failed.is_empty() {
                        inv.try_counter += 1;
                        let round = inv.try_counter;
                        let refilled = Self::repopulate_queue(&mut inv);
                        info!(
                            "exhausted block queue, repopulating {refilled} failed blocks for retry round {round}"
                        );
                        continue;
                    }
                    // drained for good: nothing pending, in flight, or left to retry
                    inv.running = false;
                    drop(inv);
                    info!("exhausted block queue, shutting down service");
                    self.serialize_status(false);
                    let _ = self.shutdown_tx.send(true);
                    return None;
                }
            }
            tokio::time::sleep(self.options.check_interval).await;
        }
    }

    /// Accept or reject a worker's completion report.
    ///
    /// Rejection means the block was no longer in flight, typically because
    /// the sweeper expired it first. Rejected confirms change nothing, so a
    /// duplicate confirm is harmless.
    pub fn confirm_block(&self, block: &Block) -> bool {
        let mut inv = self.lock();
        match inv.in_flight.iter().position(|candidate| candidate == block) {
            Some(index) => {
                inv.in_flight.remove(index);
                inv.stamps.remove(index);
                inv.processed.push(*block);
                debug!("block {block} was processed properly");
                true
            }
            None => {
                debug!("block {block} is not in flight, rejecting confirm");
                false
            }
        }
    }

    /// One sweeper scan: demote every in-flight block over the time limit
    /// to the failed list. Returns how many were demoted.
    pub fn sweep_expired(&self) -> usize {
        let mut inv = self.lock();
        let now = Instant::now();
        debug!("checking progress list with {} blocks", inv.stamps.len());
        let expired: Vec<usize> = inv
            .stamps
            .iter()
            .enumerate()
            .filter(|(_, stamp)| now.duration_since(**stamp) > self.options.time_limit)
            .map(|(index, _)| index)
            .collect();
        if !expired.is_empty() {
            info!("found {} blocks over the time limit", expired.len());
        }
        // walk back to front so earlier indices stay valid
        for &index in expired.iter().rev() {
            let block = inv.in_flight.remove(index);
            inv.stamps.remove(index);
            inv.failed.push(block);
        }
        expired.len()
    }

    /// Persist the failed/processed/in-progress lists, if a prefix is
    /// configured. Called once on either shutdown path.
    pub fn serialize_status(&self, from_interrupt: bool) {
        if from_interrupt {
            info!("serializing status after interrupt");
        } else {
            info!("serializing status after regular shutdown");
        }
        let snapshot = {
            let inv = self.lock();
            StatusSnapshot::capture(&inv)
        };
        if let Some(prefix) = &self.options.out_prefix {
            if let Err(err) = status::write_status(&snapshot, prefix) {
                error!("failed to serialize status: {err}");
            }
        }
    }

    /// Stop the service: mark the inventory stopped and signal every task.
    /// Waiters in `request_block` observe the flag and return `None`.
    pub fn shutdown(&self) {
        {
            let mut inv = self.lock();
            inv.running = false;
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Retry controller: move the whole failed list back into pending and
    /// clear it. The list lands reversed at the back of the LIFO so blocks
    /// pop in their original failure order.
    fn repopulate_queue(inv: &mut Inventory) -> usize {
        let refill = std::mem::take(&mut inv.failed);
        let count = refill.len();
        inv.pending.extend(refill.into_iter().rev());
        count
    }

    fn dispatch_next(inv: &mut Inventory) -> Option<Block> {
        let block = inv.pending.pop()?;
        inv.in_flight.push(block);
        inv.stamps.push(Instant::now());
        debug!("returning block offsets: {block}");
        Some(block)
    }

    fn lock(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::time::sleep;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn blocks(n: u64) -> Vec<Block> {
        (0..n).map(|z| Block([z, 0, 0])).collect()
    }

    fn dispatcher_with(
        blocks: Vec<Block>,
        time_limit: Duration,
        check_interval: Duration,
        num_retries: u32,
    ) -> Dispatcher {
        Dispatcher::new(
            Inventory::from_blocks(blocks),
            DispatchOptions {
                time_limit,
                check_interval,
                num_retries,
                out_prefix: None,
            },
        )
    }

    /// Pairwise disjointness and completeness of the four sets.
    fn assert_invariants(dispatcher: &Dispatcher, total: usize) {
        let inv = dispatcher.lock();
        let mut seen = HashSet::new();
        for block in inv
            .pending
            .iter()
            .chain(&inv.in_flight)
            .chain(&inv.processed)
            .chain(&inv.failed)
        {
            assert!(seen.insert(*block), "block {block} appears in two sets");
        }
        assert_eq!(seen.len(), total, "blocks went missing");
        assert_eq!(inv.in_flight.len(), inv.stamps.len());
    }

    #[tokio::test]
    async fn test_dispatch_follows_file_order() {
        let dispatcher = dispatcher_with(blocks(3), ms(10_000), ms(10), 2);

        assert_eq!(dispatcher.request_block().await, Some(Block([0, 0, 0])));
        assert_eq!(dispatcher.request_block().await, Some(Block([1, 0, 0])));
        assert_eq!(dispatcher.request_block().await, Some(Block([2, 0, 0])));
        assert_invariants(&dispatcher, 3);
    }

    #[tokio::test]
    async fn test_confirm_accepts_in_flight_block_exactly_once() {
        let dispatcher = dispatcher_with(blocks(1), ms(10_000), ms(10), 2);
        let block = dispatcher.request_block().await.unwrap();

        assert!(dispatcher.confirm_block(&block));
        // duplicate confirm is rejected and changes nothing
        assert!(!dispatcher.confirm_block(&block));

        let stats = dispatcher.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_invariants(&dispatcher, 1);
    }

    #[tokio::test]
    async fn test_confirm_unknown_block_rejected() {
        let dispatcher = dispatcher_with(blocks(1), ms(10_000), ms(10), 2);
        assert!(!dispatcher.confirm_block(&Block([9, 9, 9])));
        assert_eq!(dispatcher.stats().processed, 0);
    }

    #[tokio::test]
    async fn test_sweep_moves_expired_blocks_to_failed() {
        let dispatcher = dispatcher_with(blocks(2), ms(25), ms(10), 2);
        let first = dispatcher.request_block().await.unwrap();
        let _second = dispatcher.request_block().await.unwrap();
        assert!(dispatcher.confirm_block(&first));

        sleep(ms(60)).await;
        assert_eq!(dispatcher.sweep_expired(), 1);

        let stats = dispatcher.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_invariants(&dispatcher, 2);
    }

    #[tokio::test]
    async fn test_sweep_ignores_fresh_blocks() {
        let dispatcher = dispatcher_with(blocks(1), ms(10_000), ms(10), 2);
        let _block = dispatcher.request_block().await.unwrap();
        assert_eq!(dispatcher.sweep_expired(), 0);
        assert_eq!(dispatcher.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_sweep_demotes_in_descending_index_order() {
        let dispatcher = dispatcher_with(blocks(2), ms(10), ms(10), 2);
        let first = dispatcher.request_block().await.unwrap();
        let second = dispatcher.request_block().await.unwrap();

        sleep(ms(40)).await;
        assert_eq!(dispatcher.sweep_expired(), 2);

        let inv = dispatcher.lock();
        assert_eq!(inv.failed, vec![second, first]);
    }

    #[tokio::test]
    async fn test_retry_round_replays_failed_in_failure_order() {
        let dispatcher = dispatcher_with(blocks(3), ms(10), ms(10), 1);
        for _ in 0..3 {
            dispatcher.request_block().await.unwrap();
        }
        sleep(ms(40)).await;
        assert_eq!(dispatcher.sweep_expired(), 3);
        // one scan fails them back to front: [2,0,0], [1,0,0], [0,0,0]
        assert_eq!(dispatcher.stats().failed, 3);

        assert_eq!(dispatcher.request_block().await, Some(Block([2, 0, 0])));
        assert_eq!(dispatcher.request_block().await, Some(Block([1, 0, 0])));
        assert_eq!(dispatcher.request_block().await, Some(Block([0, 0, 0])));

        let stats = dispatcher.stats();
        assert_eq!(stats.try_counter, 1);
        assert_eq!(stats.failed, 0);
        assert_invariants(&dispatcher, 3);
    }

    #[tokio::test]
    async fn test_retry_rounds_are_bounded() {
        let dispatcher = dispatcher_with(blocks(1), ms(10), ms(10), 0);
        let block = dispatcher.request_block().await.unwrap();
        sleep(ms(40)).await;
        assert_eq!(dispatcher.sweep_expired(), 1);

        // no retries left: the next request shuts the service down
        assert_eq!(dispatcher.request_block().await, None);
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.stats().failed, 1);
        assert_eq!(dispatcher.lock().failed, vec![block]);
    }

    #[tokio::test]
    async fn test_block_failing_every_round_ends_failed() {
        let dispatcher = dispatcher_with(blocks(1), ms(10), ms(10), 1);

        // first dispatch expires
        let block = dispatcher.request_block().await.unwrap();
        sleep(ms(40)).await;
        assert_eq!(dispatcher.sweep_expired(), 1);

        // retry round 1 hands it out again, and it expires again
        assert_eq!(dispatcher.request_block().await, Some(block));
        assert_eq!(dispatcher.stats().try_counter, 1);
        sleep(ms(40)).await;
        assert_eq!(dispatcher.sweep_expired(), 1);

        // rounds are spent: the next request shuts the service down
        assert_eq!(dispatcher.request_block().await, None);
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.lock().failed, vec![block]);
        assert_invariants(&dispatcher, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_shuts_down_immediately() {
        let dispatcher = dispatcher_with(Vec::new(), ms(10_000), ms(10), 2);

        assert_eq!(dispatcher.request_block().await, None);
        assert!(!dispatcher.is_running());
        assert!(*dispatcher.shutdown_signal().borrow());

        // stopped service keeps answering None
        assert_eq!(dispatcher.request_block().await, None);
    }

    #[tokio::test]
    async fn test_drain_wait_sees_confirm_then_shuts_down() {
        let dispatcher = dispatcher_with(blocks(1), ms(10_000), ms(10), 2);
        let block = dispatcher.request_block().await.unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.request_block().await })
        };

        sleep(ms(40)).await;
        assert!(dispatcher.confirm_block(&block));

        // drained with nothing to retry: the waiter gets None
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_drain_wait_picks_up_sweeper_refill() {
        let dispatcher = dispatcher_with(blocks(1), ms(30), ms(10), 1);
        let block = dispatcher.request_block().await.unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.request_block().await })
        };

        // the waiter polls while this expires the block
        sleep(ms(60)).await;
        assert_eq!(dispatcher.sweep_expired(), 1);

        assert_eq!(waiter.await.unwrap(), Some(block));
        let stats = dispatcher.stats();
        assert_eq!(stats.try_counter, 1);
        assert_eq!(stats.failed, 0);
        assert_invariants(&dispatcher, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_distinct_blocks() {
        let dispatcher = dispatcher_with(blocks(2), ms(10_000), ms(10), 2);
        let (first, second) = tokio::join!(dispatcher.request_block(), dispatcher.request_block());

        let first = first.unwrap();
        let second = second.unwrap();
        assert_ne!(first, second);
        assert_eq!(dispatcher.stats().in_flight, 2);
        assert_invariants(&dispatcher, 2);
    }

    #[tokio::test]
    async fn test_serialize_status_round_trips_nonempty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("status_");
        let dispatcher = Dispatcher::new(
            Inventory::from_blocks(blocks(3)),
            DispatchOptions {
                time_limit: ms(10),
                check_interval: ms(10),
                num_retries: 2,
                out_prefix: Some(prefix.clone()),
            },
        );

        let done = dispatcher.request_block().await.unwrap();
        assert!(dispatcher.confirm_block(&done));
        let lost = dispatcher.request_block().await.unwrap();
        sleep(ms(40)).await;
        assert_eq!(dispatcher.sweep_expired(), 1);
        let held = dispatcher.request_block().await.unwrap();

        dispatcher.serialize_status(false);

        let read = |name: &str| -> Vec<Block> {
            let path = crate::status::status_path(&prefix, name);
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
        };
        assert_eq!(read(crate::status::PROCESSED_BLOCKS_FILE), vec![done]);
        assert_eq!(read(crate::status::FAILED_BLOCKS_FILE), vec![lost]);
        assert_eq!(read(crate::status::INPROGRESS_BLOCKS_FILE), vec![held]);
    }

    #[tokio::test]
    async fn test_serialize_status_without_prefix_is_a_no_op() {
        let dispatcher = dispatcher_with(blocks(1), ms(10_000), ms(10), 2);
        let _block = dispatcher.request_block().await.unwrap();
        // interrupt path with no prefix configured: logs only
        dispatcher.serialize_status(true);
        assert_eq!(dispatcher.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let dispatcher = dispatcher_with(blocks(1), ms(10_000), ms(10), 2);
        let _block = dispatcher.request_block().await.unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.request_block().await })
        };

        sleep(ms(30)).await;
        dispatcher.shutdown();

        assert_eq!(waiter.await.unwrap(), None);
        assert!(*dispatcher.shutdown_signal().borrow());
    }
}
