//! Transaction watchdog.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default deadline for a transaction before its watchdog aborts it.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A cancellable deadline attached to a transaction.
///
/// The watchdog is cooperative: it has no timer thread. Every suspension
/// point of the owning transaction checks it, and the first check past the
/// deadline fires it - exactly once - after which the transaction is
/// aborted and the timeout surfaces to the caller. Terminal transitions
/// cancel the deadline.
#[derive(Debug)]
pub(crate) struct Watchdog {
    deadline: Mutex<Option<Instant>>,
    fired: AtomicBool,
}

impl Watchdog {
    /// Creates a watchdog armed `timeout` from now, or disarmed for `None`.
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: Mutex::new(timeout.map(|t| Instant::now() + t)),
            fired: AtomicBool::new(false),
        }
    }

    /// Disarms the deadline.
    pub(crate) fn cancel(&self) {
        *self.deadline.lock() = None;
    }

    /// Whether the deadline has passed and the watchdog has not yet fired.
    pub(crate) fn expired(&self) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return false;
        }
        self.deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Claims the right to fire. Returns true for exactly one caller.
    pub(crate) fn mark_fired(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_never_expires() {
        let watchdog = Watchdog::new(None);
        assert!(!watchdog.expired());
    }

    #[test]
    fn expires_after_deadline() {
        let watchdog = Watchdog::new(Some(Duration::ZERO));
        assert!(watchdog.expired());
    }

    #[test]
    fn cancel_disarms() {
        let watchdog = Watchdog::new(Some(Duration::ZERO));
        watchdog.cancel();
        assert!(!watchdog.expired());
    }

    #[test]
    fn fires_exactly_once() {
        let watchdog = Watchdog::new(Some(Duration::ZERO));
        assert!(watchdog.expired());
        assert!(watchdog.mark_fired());
        assert!(!watchdog.mark_fired());
        assert!(!watchdog.expired());
    }

    #[test]
    fn future_deadline_not_expired() {
        let watchdog = Watchdog::new(Some(Duration::from_secs(60)));
        assert!(!watchdog.expired());
    }
}
