//! Background maintenance task.
//!
//! A single dedicated thread that blocks on a condition variable for its
//! period or an early wakeup from shutdown, and decommits cold unlocked
//! blocks until residency trends toward `min_pool`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::bufferpool::pool::PoolShared;

pub(crate) fn run(shared: Arc<PoolShared>) {
    info!("maintenance task starting");
    while !shared.is_shutdown() {
        shared.wait_or_shutdown(shared.maintenance_period());
        if shared.is_shutdown() {
            break;
        }

        let target = shared.low_water_blocks();
        loop {
            if shared.resident_blocks() <= target {
                break;
            }
            let released = shared.free_unlocked(true);
            if released == 0 {
                // Nothing left on the unlocked list; locked/fixed blocks
                // make up the rest of residency and aren't evictable.
                break;
            }
            debug!(released, target, "maintenance sweep released blocks");
        }
    }
    info!("maintenance task exiting");
}
