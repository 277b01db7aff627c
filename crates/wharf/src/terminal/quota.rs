//! Per-user concurrent session quotas.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::error::{WharfError, WharfResult};

/// Limit value meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Counts live sessions per user against a configurable limit.
///
/// Counters are never persisted; they start at zero and follow the live
/// sessions of this process.
#[derive(Debug)]
pub struct QuotaTracker {
    default_limit: AtomicI64,
    overrides: DashMap<String, i64>,
    counts: DashMap<String, Arc<AtomicUsize>>,
}

impl QuotaTracker {
    pub fn new(default_limit: i64, overrides: HashMap<String, i64>) -> WharfResult<Self> {
        check_limit(default_limit)?;
        for limit in overrides.values() {
            check_limit(*limit)?;
        }
        Ok(Self {
            default_limit: AtomicI64::new(default_limit),
            overrides: overrides.into_iter().collect(),
            counts: DashMap::new(),
        })
    }

    /// Effective limit for a user.
    pub fn limit_for(&self, user_id: &str) -> i64 {
        self.overrides
            .get(user_id)
            .map(|l| *l)
            .unwrap_or_else(|| self.default_limit.load(Ordering::SeqCst))
    }

    pub fn default_limit(&self) -> i64 {
        self.default_limit.load(Ordering::SeqCst)
    }

    pub fn set_default_limit(&self, limit: i64) -> WharfResult<()> {
        check_limit(limit)?;
        self.default_limit.store(limit, Ordering::SeqCst);
        Ok(())
    }

    /// Set (`Some`) or clear (`None`) a user's override.
    pub fn set_user_limit(&self, user_id: &str, limit: Option<i64>) -> WharfResult<()> {
        match limit {
            Some(limit) => {
                check_limit(limit)?;
                self.overrides.insert(user_id.to_string(), limit);
            }
            None => {
                self.overrides.remove(user_id);
            }
        }
        Ok(())
    }

    fn counter(&self, user_id: &str) -> Arc<AtomicUsize> {
        self.counts
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// Take one slot for `user_id`, failing if the user is at the limit.
    pub fn reserve(&self, user_id: &str) -> WharfResult<()> {
        let limit = self.limit_for(user_id);
        let counter = self.counter(user_id);
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if limit != UNLIMITED && current as i64 >= limit {
                    None
                } else {
                    Some(current + 1)
                }
            })
            .map(|_| ())
            .map_err(|_| WharfError::QuotaExceeded {
                user_id: user_id.to_string(),
                limit,
            })
    }

    /// Give a slot back.
    pub fn release(&self, user_id: &str) {
        if let Some(counter) = self.counts.get(user_id) {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        }
    }

    /// Slots currently held by a user.
    pub fn active(&self, user_id: &str) -> usize {
        self.counts
            .get(user_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Users holding more slots than their current limit allows, with the
    /// number of slots over.
    pub fn over_limit(&self) -> Vec<(String, usize)> {
        self.counts
            .iter()
            .filter_map(|entry| {
                let limit = self.limit_for(entry.key());
                let active = entry.value().load(Ordering::SeqCst);
                if limit != UNLIMITED && active as i64 > limit {
                    Some((entry.key().clone(), active - limit as usize))
                } else {
                    None
                }
            })
            .collect()
    }
}

fn check_limit(limit: i64) -> WharfResult<()> {
    if limit < UNLIMITED {
        return Err(WharfError::validation(format!(
            "session limit must be -1 (unlimited) or greater, got {limit}"
        )));
    }
    Ok(())
}
