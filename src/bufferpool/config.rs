//! Pool configuration.
//!
//! A plain data struct with a `Default` impl, built up through a consuming
//! builder rather than constructed with a long positional argument list.

use std::time::Duration;

/// Tunables recognized by [`crate::bufferpool::pool::BufferPool::open_with_config`].
///
/// `min_pool`/`max_pool` default to the backing file's size when left
/// unset: the whole file fits, and no eviction is needed unless the caller
/// asks for a tighter ceiling.
#[derive(Clone, Debug)]
pub struct BufferPoolConfig {
    /// Low-water target, in bytes, the maintenance task decommits toward.
    pub min_pool: Option<u64>,
    /// Hard ceiling, in bytes, on resident blocks before eviction is forced.
    pub max_pool: Option<u64>,
    /// How often the background maintenance task wakes to sweep.
    pub maintenance_period: Duration,
    /// When false, skips list maintenance entirely (micro-benchmark mode).
    pub enable_adaptive_lists: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            min_pool: None,
            max_pool: None,
            maintenance_period: Duration::from_secs(30),
            enable_adaptive_lists: true,
        }
    }
}

/// Consuming builder for [`BufferPoolConfig`].
#[derive(Clone, Debug, Default)]
pub struct BufferPoolBuilder {
    config: BufferPoolConfig,
}

impl BufferPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_pool(mut self, bytes: u64) -> Self {
        self.config.min_pool = Some(bytes);
        self
    }

    pub fn max_pool(mut self, bytes: u64) -> Self {
        self.config.max_pool = Some(bytes);
        self
    }

    pub fn maintenance_period(mut self, period: Duration) -> Self {
        self.config.maintenance_period = period;
        self
    }

    pub fn enable_adaptive_lists(mut self, enabled: bool) -> Self {
        self.config.enable_adaptive_lists = enabled;
        self
    }

    pub fn build(self) -> BufferPoolConfig {
        self.config
    }
}
