mod defaults;

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::{OtaruError, Result};
use defaults::*;

/// Tunables of the cached blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache entries kept open before idle ones are closed.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// A dirty entry not written to for this long is due for writeback.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// A dirty entry not synced for this long is due for writeback even while
    /// it keeps receiving writes.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_inactive_close_timeout_ms")]
    pub inactive_close_timeout_ms: u64,
    #[serde(default = "default_num_sync_workers")]
    pub num_sync_workers: usize,
    #[serde(default = "default_sync_grace_period_ms")]
    pub sync_grace_period_ms: u64,
    /// Copy granularity when streaming a backend blob into the cache.
    #[serde(default = "default_invalidate_block_size")]
    pub invalidate_block_size: usize,
    /// Cache size (bytes) above which the auto reduce task kicks in. 0 disables.
    #[serde(default)]
    pub auto_reduce_high_watermark: i64,
    /// Cache size the auto reduce task shrinks down to.
    #[serde(default)]
    pub auto_reduce_low_watermark: i64,
    #[serde(default = "default_auto_reduce_period_ms")]
    pub auto_reduce_period_ms: u64,
    /// Interval between version cache snapshots. 0 disables them.
    #[serde(default = "default_save_state_period_ms")]
    pub save_state_period_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            write_timeout_ms: default_write_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            inactive_close_timeout_ms: default_inactive_close_timeout_ms(),
            num_sync_workers: default_num_sync_workers(),
            sync_grace_period_ms: default_sync_grace_period_ms(),
            invalidate_block_size: default_invalidate_block_size(),
            auto_reduce_high_watermark: 0,
            auto_reduce_low_watermark: 0,
            auto_reduce_period_ms: default_auto_reduce_period_ms(),
            save_state_period_ms: default_save_state_period_ms(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(OtaruError::Config(
                "cache.max_entries must be at least 1".into(),
            ));
        }
        if self.num_sync_workers == 0 {
            return Err(OtaruError::Config(
                "cache.num_sync_workers must be at least 1".into(),
            ));
        }
        if self.invalidate_block_size == 0 {
            return Err(OtaruError::Config(
                "cache.invalidate_block_size must be positive".into(),
            ));
        }
        if self.auto_reduce_high_watermark < 0 || self.auto_reduce_low_watermark < 0 {
            return Err(OtaruError::Config(format!(
                "cache auto reduce watermarks must be non-negative, got high={} low={}",
                self.auto_reduce_high_watermark, self.auto_reduce_low_watermark
            )));
        }
        if self.auto_reduce_enabled()
            && self.auto_reduce_low_watermark >= self.auto_reduce_high_watermark
        {
            return Err(OtaruError::Config(format!(
                "cache.auto_reduce_low_watermark ({}) must be below the high watermark ({})",
                self.auto_reduce_low_watermark, self.auto_reduce_high_watermark
            )));
        }
        Ok(())
    }

    pub fn auto_reduce_enabled(&self) -> bool {
        self.auto_reduce_high_watermark > 0
    }

    pub fn write_timeout(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.write_timeout_ms as i64)
    }

    pub fn sync_timeout(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.sync_timeout_ms as i64)
    }

    pub fn inactive_close_timeout(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.inactive_close_timeout_ms as i64)
    }

    pub fn sync_grace_period(&self) -> Duration {
        Duration::from_millis(self.sync_grace_period_ms)
    }

    pub fn auto_reduce_period(&self) -> Duration {
        Duration::from_millis(self.auto_reduce_period_ms)
    }

    pub fn save_state_enabled(&self) -> bool {
        self.save_state_period_ms > 0
    }

    pub fn save_state_period(&self) -> Duration {
        Duration::from_millis(self.save_state_period_ms)
    }
}
