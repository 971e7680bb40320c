/// Distributed Rate Limiter - fleet-wide ceiling on concurrent sandboxes
///
/// **Core Responsibility:**
/// Hand out execution slots from one counter shared by every worker.
///
/// **Guarantee:**
/// Across all workers, `used` never exceeds `limit` and never drops below
/// zero. Both bounds are enforced inside the store's atomic operations,
/// never by a client-side read-then-write.
use anyhow::{Context, Result};
use arbiter_common::redis::{SLOTS_LIMIT_KEY, SLOTS_USED_KEY};
use arbiter_common::store::{slot_usage, SlotUsage};
use arbiter_common::CoordinationStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Write the ceiling. Every worker does this at startup; the last one wins.
    pub async fn initialize(&self, limit: i64) -> Result<()> {
        self.store
            .set(SLOTS_LIMIT_KEY, &limit.to_string())
            .await
            .context("Failed to set slot limit")?;
        tracing::info!(limit, "Slot limit initialized");
        Ok(())
    }

    /// Take a slot if one is free. A `holder` record (key, value) is written
    /// in the same atomic step, so a slot is never held without one.
    pub async fn acquire(&self, holder: Option<(&str, &str)>) -> Result<bool> {
        self.store
            .increment_bounded(SLOTS_USED_KEY, SLOTS_LIMIT_KEY, holder)
            .await
            .context("Failed to acquire slot")
    }

    /// Give a slot back. Releasing more than was acquired leaves the counter at 0.
    pub async fn release(&self) -> Result<()> {
        let used = self
            .store
            .decrement_floored(SLOTS_USED_KEY)
            .await
            .context("Failed to release slot")?;
        tracing::debug!(used, "Slot released");
        Ok(())
    }

    pub async fn usage(&self) -> Result<SlotUsage> {
        slot_usage(self.store.as_ref()).await
    }
}
