//! RTP port allocation.
//!
//! Per RFC 3550 §11, RTP uses even ports (RTCP takes the odd port above).
//! The pool hands out even ports from a fixed range and takes them back
//! when a session ends. Port churn is low compared to packet rates, so a
//! single mutex guards every operation.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LoadgenError, Result};

/// Returned by [`PortPool::acquire`] when no port is free.
pub const NO_PORT: u16 = 0;

/// Thread-safe allocator of unique, even-numbered ports in `[start, end)`.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// Create a pool covering every even port in `[start, end)`.
    ///
    /// `start` is rounded up and `end` rounded down to even values. Port 0
    /// is [`NO_PORT`], so the range never begins below 2.
    pub fn new(start: u16, end: u16) -> Self {
        let start = ((u32::from(start) + 1) & !1).max(2);
        let end = u32::from(end) & !1;

        let free: BTreeSet<u16> = (start..end).step_by(2).map(|p| p as u16).collect();
        // `start` can only exceed u16 when the caller passed 65535.
        let start = start.min(end) as u16;
        let end = end as u16;

        tracing::debug!(start, end, ports = free.len(), "port pool initialized");

        Self {
            start,
            end,
            free: Mutex::new(free),
        }
    }

    /// The effective `[start, end)` range after rounding.
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Number of ports currently available.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Take a free port, or [`NO_PORT`] if the pool is exhausted.
    pub fn acquire(&self) -> u16 {
        match self.free.lock().pop_first() {
            Some(port) => {
                tracing::trace!(port, "port acquired");
                port
            }
            None => {
                tracing::debug!("port pool exhausted");
                NO_PORT
            }
        }
    }

    /// Return a port to the pool.
    ///
    /// Releasing a port that is already free, odd, or outside the range is
    /// logged and ignored.
    pub fn release(&self, port: u16) {
        if port == NO_PORT {
            return;
        }
        if port % 2 != 0 || port < self.start || port >= self.end {
            tracing::warn!(port, start = self.start, end = self.end, "released port does not belong to pool");
            return;
        }

        let mut free = self.free.lock();
        if !free.insert(port) {
            tracing::warn!(port, "port released to pool but it is already free");
            return;
        }
        tracing::trace!(port, free = free.len(), "port released");
    }

    /// Acquire a port wrapped in a guard that releases it on drop.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease> {
        match self.acquire() {
            NO_PORT => Err(LoadgenError::PortExhausted),
            port => Ok(PortLease {
                pool: Arc::clone(self),
                port,
            }),
        }
    }
}

/// A port borrowed from a [`PortPool`], returned when dropped.
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn rounds_bounds_to_even() {
        let pool = PortPool::new(10001, 10011);
        assert_eq!(pool.range(), (10002, 10010));
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn zero_start_never_hands_out_sentinel() {
        let pool = Arc::new(PortPool::new(0, 10));
        assert_eq!(pool.range(), (2, 10));
        assert_eq!(pool.free_count(), 4);

        let lease = pool.lease().unwrap();
        assert_eq!(lease.port(), 2);
        assert_eq!(pool.free_count(), 3);
        drop(lease);
        assert_eq!(pool.free_count(), 4);

        let pool = PortPool::new(0, 1);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.range(), (0, 0));
    }

    #[test]
    fn acquired_ports_are_even_and_in_range() {
        let pool = PortPool::new(20000, 20020);
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let port = pool.acquire();
            assert_ne!(port, NO_PORT);
            assert_eq!(port % 2, 0);
            assert!((20000..20020).contains(&port));
            assert!(seen.insert(port), "duplicate port {port}");
        }
    }

    #[test]
    fn exhaustion_returns_sentinel() {
        let pool = PortPool::new(30000, 30007);
        let capacity = pool.free_count();
        assert_eq!(capacity, 3);

        let granted = (0..capacity).map(|_| pool.acquire()).filter(|&p| p != NO_PORT).count();
        assert_eq!(granted, capacity);
        assert_eq!(pool.acquire(), NO_PORT);
        assert_eq!(pool.acquire(), NO_PORT);
    }

    #[test]
    fn empty_range() {
        let pool = PortPool::new(5000, 5000);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.acquire(), NO_PORT);

        let pool = PortPool::new(65535, 65535);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn duplicate_release_is_noop() {
        let pool = PortPool::new(40000, 40004);
        let port = pool.acquire();
        pool.release(port);
        pool.release(port);
        assert_eq!(pool.free_count(), 2);

        // never allocated, still free
        pool.release(40002);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn foreign_ports_ignored() {
        let pool = PortPool::new(40000, 40004);
        pool.release(NO_PORT);
        pool.release(40001);
        pool.release(50000);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn lease_releases_on_drop() {
        let pool = Arc::new(PortPool::new(6000, 6002));
        {
            let lease = pool.lease().unwrap();
            assert_eq!(lease.port(), 6000);
            assert!(matches!(pool.lease(), Err(LoadgenError::PortExhausted)));
        }
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn concurrent_acquire_release_never_duplicates() {
        let pool = Arc::new(PortPool::new(10000, 10064));
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let port = pool.acquire();
                        if port == NO_PORT {
                            thread::yield_now();
                            continue;
                        }
                        assert!(in_use.lock().insert(port), "port {port} handed out twice");
                        thread::yield_now();
                        assert!(in_use.lock().remove(&port));
                        pool.release(port);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.free_count(), 32);
    }
}
