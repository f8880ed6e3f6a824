pub(super) fn default_max_entries() -> usize {
    128
}

pub(super) fn default_write_timeout_ms() -> u64 {
    3_000
}

pub(super) fn default_sync_timeout_ms() -> u64 {
    300_000 // 5 min
}

pub(super) fn default_inactive_close_timeout_ms() -> u64 {
    10_000
}

pub(super) fn default_num_sync_workers() -> usize {
    10
}

pub(super) fn default_sync_grace_period_ms() -> u64 {
    1_000
}

pub(super) fn default_invalidate_block_size() -> usize {
    32 * 1024 // 32 KiB
}

pub(super) fn default_auto_reduce_period_ms() -> u64 {
    10_000
}

pub(super) fn default_save_state_period_ms() -> u64 {
    30_000
}
