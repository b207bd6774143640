//! Memory admission control
//!
//! The check is advisory: nothing is reserved, so concurrent callers can both
//! pass it before either instance consumes memory.

use serde::Serialize;
use tracing::debug;

use crate::error::{ProvisionError, Result};
use crate::hypervisor::{Hypervisor, MemoryStats};

/// Default share of host memory that may be handed out, in percent.
pub const DEFAULT_THRESHOLD: u8 = 90;

/// Bytes kept in reserve: `total − total × threshold / 100`.
pub fn reserve(total: u64, threshold: u8) -> u64 {
    let threshold = u128::from(threshold.min(100));
    let total = u128::from(total);
    (total - total * threshold / 100) as u64
}

/// Whether `requested` bytes fit while leaving more than the reserve free.
pub fn admits(stats: &MemoryStats, requested: u64, threshold: u8) -> bool {
    let remaining = i128::from(stats.free) - i128::from(requested);
    remaining > i128::from(reserve(stats.total, threshold))
}

/// Result of a host-wide availability query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    /// Whether free memory is above the reserve.
    pub available: bool,
    /// Free bytes.
    pub free_memory: u64,
    /// Total bytes.
    pub total_memory: u64,
    /// Threshold in percent.
    pub threshold: u8,
}

/// Reads live memory counters and applies the admission rule.
#[derive(Debug, Clone, Copy)]
pub struct CapacityAdvisor<'a> {
    conn: &'a dyn Hypervisor,
    threshold: u8,
}

impl<'a> CapacityAdvisor<'a> {
    /// Advisor with the given utilization threshold in percent.
    pub fn new(conn: &'a dyn Hypervisor, threshold: u8) -> Self {
        Self { conn, threshold }
    }

    /// Whether `requested` bytes may be allocated.
    pub fn can_allocate(&self, requested: u64) -> Result<bool> {
        let stats = self.conn.memory_stats()?;
        let ok = admits(&stats, requested, self.threshold);
        debug!(
            "Admission for {} bytes: free={} total={} threshold={}% -> {}",
            requested, stats.free, stats.total, self.threshold, ok
        );
        Ok(ok)
    }

    /// Like [`CapacityAdvisor::can_allocate`] but fails with `CapacityExceeded`.
    pub fn ensure_can_allocate(&self, requested: u64) -> Result<()> {
        let stats = self.conn.memory_stats()?;
        if admits(&stats, requested, self.threshold) {
            return Ok(());
        }
        Err(ProvisionError::CapacityExceeded {
            requested,
            free: stats.free,
            reserve: reserve(stats.total, self.threshold),
        })
    }

    /// Whether the host currently has memory above the reserve.
    pub fn availability(&self) -> Result<Availability> {
        let stats = self.conn.memory_stats()?;
        Ok(Availability {
            available: stats.free > reserve(stats.total, self.threshold),
            free_memory: stats.free,
            total_memory: stats.total,
            threshold: self.threshold,
        })
    }
}
