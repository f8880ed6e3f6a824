use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use otaru_types::flags::OpenFlags;

use crate::clock::{Clock, NEVER};

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    last_used: DateTime<Utc>,
    read_count: u64,
    write_count: u64,
}

impl Default for UsageEntry {
    fn default() -> Self {
        Self {
            last_used: NEVER,
            read_count: 0,
            write_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageStatsView {
    pub num_entries: usize,
}

/// Per-blob access recency, used to pick victims when shrinking the cache.
pub struct UsageStats {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, UsageEntry>>,
}

impl UsageStats {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe_open(&self, blobpath: &str, flags: OpenFlags) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        let e = entries.entry(blobpath.to_string()).or_default();
        if flags.is_read_allowed() {
            e.read_count += 1;
        }
        if flags.is_write_allowed() {
            e.write_count += 1;
        }
        e.last_used = now;
    }

    pub fn observe_remove_blob(&self, blobpath: &str) {
        self.entries.lock().unwrap().remove(blobpath);
    }

    /// Seed with blobs already present in the cache. They count as never used.
    pub fn import_blob_list(&self, blobpaths: &[String]) {
        let mut entries = self.entries.lock().unwrap();
        for bp in blobpaths {
            entries.insert(bp.clone(), UsageEntry::default());
        }
    }

    /// Every known blob path, least recently used first.
    pub fn find_least_used(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let mut bps: Vec<(&String, DateTime<Utc>)> =
            entries.iter().map(|(bp, e)| (bp, e.last_used)).collect();
        bps.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        bps.into_iter().map(|(bp, _)| bp.clone()).collect()
    }

    pub fn view(&self) -> UsageStatsView {
        UsageStatsView {
            num_entries: self.entries.lock().unwrap().len(),
        }
    }
}
