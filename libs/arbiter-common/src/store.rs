use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::redis::{SLOTS_LIMIT_KEY, SLOTS_USED_KEY};

/// Coordination store shared by every worker process.
///
/// Each method is a single atomic operation on the store. Workers never
/// talk to each other directly; all cross-process state (slot counter,
/// session heartbeats) goes through here.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set without expiry
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Overwrite `key` only if it already exists.
    /// Returns whether the value was written.
    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only if it still holds `expected`.
    /// Returns whether this call performed the delete.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Increment `counter_key` only if it is below the integer stored at
    /// `limit_key` (missing keys read as 0). When it increments and `holder`
    /// is given, the holder's key is set to its value in the same step.
    /// Returns whether it incremented.
    async fn increment_bounded(
        &self,
        counter_key: &str,
        limit_key: &str,
        holder: Option<(&str, &str)>,
    ) -> Result<bool>;

    /// Decrement `counter_key`, never going below zero. Returns the new value.
    async fn decrement_floored(&self, counter_key: &str) -> Result<i64>;

    /// All keys starting with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Fleet-wide slot counter and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUsage {
    pub used: i64,
    pub limit: i64,
}

pub async fn slot_usage(store: &dyn CoordinationStore) -> Result<SlotUsage> {
    Ok(SlotUsage {
        used: read_count(store, SLOTS_USED_KEY).await?,
        limit: read_count(store, SLOTS_LIMIT_KEY).await?,
    })
}

/// Integer stored at `key`; missing reads as 0
pub async fn read_count(store: &dyn CoordinationStore, key: &str) -> Result<i64> {
    let value = store
        .get(key)
        .await
        .with_context(|| format!("Failed to read {}", key))?;
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Non-numeric value at {}: {:?}", key, raw)),
        None => Ok(0),
    }
}
