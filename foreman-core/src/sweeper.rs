//! Timeout sweeper
//!
//! Long-lived background task: sleep one check interval, demote every
//! in-flight block over the time limit, repeat. It makes no other
//! decisions; retries and shutdown belong to the dispatcher.

use tracing::debug;

use crate::dispatcher::Dispatcher;

/// Run the sweep loop until shutdown is signalled.
pub async fn run(dispatcher: Dispatcher) {
    let mut shutdown = dispatcher.shutdown_signal();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(dispatcher.options().check_interval) => {
                dispatcher.sweep_expired();
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("sweeper stopped");
}
