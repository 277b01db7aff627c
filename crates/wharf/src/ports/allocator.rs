//! Host port pool.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;

/// Hands out host ports from a fixed range.
///
/// Allocation walks the range from a rotating cursor so a port that was just
/// released is not handed out again immediately.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    inner: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    in_use: BTreeSet<u16>,
    cursor: u16,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let cursor = *range.start();
        Self {
            range,
            inner: Mutex::new(PoolState {
                in_use: BTreeSet::new(),
                cursor,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // The pool holds plain data; a panic mid-update cannot leave it torn.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Take the next free port, `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<u16> {
        let mut state = self.state();
        let start = *self.range.start();
        let end = *self.range.end();
        let size = usize::from(end - start) + 1;

        let mut candidate = state.cursor.clamp(start, end);
        for _ in 0..size {
            if !state.in_use.contains(&candidate) {
                state.in_use.insert(candidate);
                state.cursor = if candidate == end { start } else { candidate + 1 };
                return Some(candidate);
            }
            candidate = if candidate == end { start } else { candidate + 1 };
        }
        None
    }

    /// Take a specific port if it is in range and free.
    pub fn reserve(&self, port: u16) -> bool {
        if !self.range.contains(&port) {
            return false;
        }
        self.state().in_use.insert(port)
    }

    /// Return a port to the pool. Returns `false` if it was not taken.
    pub fn release(&self, port: u16) -> bool {
        self.state().in_use.remove(&port)
    }

    pub fn in_use(&self) -> usize {
        self.state().in_use.len()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.state().in_use.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_release() {
        let pool = PortAllocator::new(5000..=5002);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!((a, b, c), (5000, 5001, 5002));
        assert_eq!(pool.allocate(), None);

        assert!(pool.release(b));
        assert!(!pool.release(b));
        assert_eq!(pool.allocate(), Some(5001));
    }

    #[test]
    fn test_released_port_is_not_reused_first() {
        let pool = PortAllocator::new(6000..=6009);
        let first = pool.allocate().unwrap();
        pool.release(first);
        assert_ne!(pool.allocate(), Some(first));
    }

    #[test]
    fn test_reserve_specific_port() {
        let pool = PortAllocator::new(7000..=7005);
        assert!(pool.reserve(7003));
        assert!(!pool.reserve(7003));
        assert!(!pool.reserve(8000));
        assert!(pool.is_allocated(7003));
    }

    #[test]
    fn test_range_ending_at_u16_max() {
        let pool = PortAllocator::new(65534..=65535);
        assert_eq!(pool.allocate(), Some(65534));
        assert_eq!(pool.allocate(), Some(65535));
        assert_eq!(pool.allocate(), None);
    }
}
