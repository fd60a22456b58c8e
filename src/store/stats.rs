//! Per-operation store counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::metrics::Counter;

#[derive(Debug, Default)]
pub struct StoreStats {
    pub get_success: Counter,
    pub get_fail: Counter,
    pub set_success: Counter,
    pub set_fail: Counter,
    pub delete_success: Counter,
    pub delete_fail: Counter,
    pub update_success: Counter,
    pub update_fail: Counter,
    pub create_success: Counter,
    pub create_fail: Counter,
    pub compare_and_swap_success: Counter,
    pub compare_and_swap_fail: Counter,
    pub compare_and_delete_success: Counter,
    pub compare_and_delete_fail: Counter,
    pub expire_count: Counter,
    watchers: AtomicU64,
}

/// JSON shape served at `/v2/stats/store`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatsSnapshot {
    pub gets_success: u64,
    pub gets_fail: u64,
    pub sets_success: u64,
    pub sets_fail: u64,
    pub delete_success: u64,
    pub delete_fail: u64,
    pub update_success: u64,
    pub update_fail: u64,
    pub create_success: u64,
    pub create_fail: u64,
    pub compare_and_swap_success: u64,
    pub compare_and_swap_fail: u64,
    pub compare_and_delete_success: u64,
    pub compare_and_delete_fail: u64,
    pub expire_count: u64,
    pub watchers: u64,
}

impl StoreStats {
    pub fn set_watchers(&self, n: usize) {
        self.watchers.store(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            gets_success: self.get_success.get(),
            gets_fail: self.get_fail.get(),
            sets_success: self.set_success.get(),
            sets_fail: self.set_fail.get(),
            delete_success: self.delete_success.get(),
            delete_fail: self.delete_fail.get(),
            update_success: self.update_success.get(),
            update_fail: self.update_fail.get(),
            create_success: self.create_success.get(),
            create_fail: self.create_fail.get(),
            compare_and_swap_success: self.compare_and_swap_success.get(),
            compare_and_swap_fail: self.compare_and_swap_fail.get(),
            compare_and_delete_success: self.compare_and_delete_success.get(),
            compare_and_delete_fail: self.compare_and_delete_fail.get(),
            expire_count: self.expire_count.get(),
            watchers: self.watchers.load(Ordering::Relaxed),
        }
    }
}

/// Bump the success or failure counter of a pair for one operation.
pub(crate) fn tally<T, E>(success: &Counter, fail: &Counter, result: &Result<T, E>) {
    if result.is_ok() {
        success.inc();
    } else {
        fail.inc();
    }
}
