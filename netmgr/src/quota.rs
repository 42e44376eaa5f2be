//! Connection admission control.
//!
//! A [`Quota`] bounds the number of concurrently accepted connections on a
//! listener. Attaching either succeeds (possibly over the soft limit, which
//! callers may treat as "serve but shed early"), fails outright, or, when a
//! callback is supplied, defers: the callback fires with a guard as soon as
//! another holder releases.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::result::NetError;

type Waiter = Box<dyn FnOnce(QuotaGuard) + Send>;

pub struct Quota {
    max: usize,
    soft: usize,
    used: AtomicUsize,
    waiting: Mutex<VecDeque<Waiter>>,
}

impl Quota {
    /// A quota admitting at most `max` concurrent holders.
    pub fn new(max: usize) -> Arc<Quota> {
        Self::with_soft(max, max)
    }

    /// A quota with a lower soft limit: attaches between `soft` and `max`
    /// succeed but report [`NetError::SoftQuota`].
    pub fn with_soft(max: usize, soft: usize) -> Arc<Quota> {
        assert!(max >= 1 && soft <= max);
        Arc::new(Quota {
            max,
            soft,
            used: AtomicUsize::new(0),
            waiting: Mutex::new(VecDeque::new()),
        })
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Attach without a callback.
    pub fn try_attach(self: &Arc<Quota>) -> Result<QuotaGuard, NetError> {
        // Hold the waiter lock so releases cannot interleave between the
        // capacity check and the increment.
        let _waiting = self.waiting.lock();
        let used = self.used.load(Ordering::Acquire);
        if used >= self.max {
            return Err(NetError::Quota);
        }
        self.used.store(used + 1, Ordering::Release);
        Ok(QuotaGuard {
            quota: self.clone(),
            soft: used + 1 > self.soft,
        })
    }

    /// Attach, or defer: when the quota is full, `cb` is queued and will be
    /// invoked with a guard once capacity frees up. Returns the guard when
    /// attachment is immediate, the quota error when deferred.
    pub fn attach_cb(
        self: &Arc<Quota>,
        cb: impl FnOnce(QuotaGuard) + Send + 'static,
    ) -> Result<QuotaGuard, NetError> {
        let mut waiting = self.waiting.lock();
        let used = self.used.load(Ordering::Acquire);
        if used >= self.max {
            waiting.push_back(Box::new(cb));
            return Err(NetError::Quota);
        }
        self.used.store(used + 1, Ordering::Release);
        Ok(QuotaGuard {
            quota: self.clone(),
            soft: used + 1 > self.soft,
        })
    }

    fn release(self: &Arc<Quota>) {
        let next = {
            let mut waiting = self.waiting.lock();
            let used = self.used.load(Ordering::Acquire);
            debug_assert!(used > 0);
            match waiting.pop_front() {
                Some(waiter) => {
                    // Hand the slot straight to the waiter.
                    Some((
                        waiter,
                        QuotaGuard {
                            quota: self.clone(),
                            soft: used > self.soft,
                        },
                    ))
                }
                None => {
                    self.used.store(used - 1, Ordering::Release);
                    None
                }
            }
        };

        if let Some((waiter, guard)) = next {
            waiter(guard);
        }
    }
}

/// Holds one admission slot; releasing it (by drop) admits a deferred
/// waiter if one is queued.
pub struct QuotaGuard {
    quota: Arc<Quota>,
    soft: bool,
}

impl QuotaGuard {
    /// Whether this attach exceeded the soft limit.
    pub fn over_soft(&self) -> bool {
        self.soft
    }
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.quota.release();
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("soft", &self.soft)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_hard_limit() {
        let quota = Quota::new(2);
        let g1 = quota.try_attach().unwrap();
        let _g2 = quota.try_attach().unwrap();
        assert_eq!(quota.try_attach().unwrap_err(), NetError::Quota);
        assert_eq!(quota.used(), 2);

        drop(g1);
        assert_eq!(quota.used(), 1);
        let _g3 = quota.try_attach().unwrap();
    }

    #[test]
    fn test_soft_limit_flag() {
        let quota = Quota::with_soft(3, 1);
        let g1 = quota.try_attach().unwrap();
        assert!(!g1.over_soft());
        let g2 = quota.try_attach().unwrap();
        assert!(g2.over_soft());
    }

    #[test]
    fn test_deferred_callback_fires_on_release() {
        let quota = Quota::new(1);
        let g1 = quota.try_attach().unwrap();

        let (tx, rx) = mpsc::channel();
        let err = quota
            .attach_cb(move |guard| {
                tx.send(guard).unwrap();
            })
            .unwrap_err();
        assert_eq!(err, NetError::Quota);
        assert!(rx.try_recv().is_err());

        drop(g1);
        let guard = rx.recv().unwrap();
        assert_eq!(quota.used(), 1);
        drop(guard);
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn test_concurrent_attaches_never_exceed_max() {
        let quota = Quota::new(4);
        let mut threads = Vec::new();
        for _ in 0..8 {
            let quota = quota.clone();
            threads.push(std::thread::spawn(move || {
                let mut held = 0usize;
                for _ in 0..1000 {
                    if let Ok(guard) = quota.try_attach() {
                        assert!(quota.used() <= 4);
                        held += 1;
                        drop(guard);
                    }
                }
                held
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(quota.used(), 0);
    }
}
