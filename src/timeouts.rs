//! The timeout registry.
//!
//! The reactor owns a single [`Timeouts`] value and checks it periodically.
//! Entries are kept sorted by expiration time. Since new entries usually
//! expire later than everything already present, insertion scans from the
//! tail and is amortized constant in the common case.
//!
//! Cancellation works through a shared atomic flag rather than by removing
//! the entry: [`TimeoutHandle::cancel`] can be called from any thread, and
//! a fired entry re-checks the flag immediately before running its task.
//! This makes cancellation win even when the entry has already been handed
//! to an executor but has not run yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

//------------ Task ----------------------------------------------------------

/// A task run when a timeout expires.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

//------------ TimeoutHandle -------------------------------------------------

/// A handle for cancelling a scheduled timeout.
#[derive(Clone, Debug)]
pub(crate) struct TimeoutHandle {
    /// Shared with the entry; once set, the task never runs.
    cancelled: Arc<AtomicBool>,
}

impl TimeoutHandle {
    /// Cancels the timeout.
    ///
    /// After this returns, the task is guaranteed not to run, even if the
    /// entry was already dispatched but not yet executed.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

//------------ Timeouts ------------------------------------------------------

/// An entry in the registry.
struct Entry {
    /// Absolute expiration time.
    at: Instant,

    /// Cancellation flag shared with the entry's [`TimeoutHandle`].
    cancelled: Arc<AtomicBool>,

    /// The task to run on expiration.
    task: Task,
}

/// An ordered collection of pending expirations.
pub(crate) struct Timeouts {
    /// Entries in non-decreasing `at` order.
    entries: Vec<Entry>,
}

impl Timeouts {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Timeouts {
            entries: Vec::new(),
        }
    }

    /// Returns the number of entries, including cancelled ones.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Schedules `task` to run once `delay` has elapsed after `now`.
    pub fn schedule(
        &mut self,
        now: Instant,
        delay: Duration,
        task: Task,
    ) -> TimeoutHandle {
        self.schedule_at(now + delay, task)
    }

    /// Schedules `task` to run at the absolute time `at`.
    pub fn schedule_at(&mut self, at: Instant, task: Task) -> TimeoutHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            at,
            cancelled: cancelled.clone(),
            task,
        };
        // Scan from the tail; almost always the new entry goes last.
        let idx = self
            .entries
            .iter()
            .rposition(|other| other.at <= at)
            .map_or(0, |idx| idx + 1);
        self.entries.insert(idx, entry);
        TimeoutHandle { cancelled }
    }

    /// Removes all entries expired by `now` and returns them for firing.
    ///
    /// Scanning stops at the first unexpired entry; since the collection is
    /// time-ordered, nothing behind it can be expired either. The expired
    /// prefix is removed in one bulk trim.
    pub fn check(&mut self, now: Instant) -> Vec<Fired> {
        let split = self
            .entries
            .iter()
            .position(|entry| entry.at > now)
            .unwrap_or(self.entries.len());
        self.entries
            .drain(..split)
            .map(|entry| Fired {
                cancelled: entry.cancelled,
                task: entry.task,
            })
            .collect()
    }
}

//------------ Fired ---------------------------------------------------------

/// An expired entry taken out of the registry.
///
/// The cancellation flag is checked at the start of execution, so a cancel
/// that lands between [`Timeouts::check`] and [`Fired::run`] still wins.
pub(crate) struct Fired {
    /// Cancellation flag shared with the entry's [`TimeoutHandle`].
    cancelled: Arc<AtomicBool>,

    /// The task to run.
    task: Task,
}

impl Fired {
    /// Runs the task unless the entry was cancelled.
    pub fn run(self) {
        if !self.cancelled.load(Ordering::Acquire) {
            (self.task)()
        }
    }

    /// Converts into a plain task for dispatch to an executor.
    pub fn into_task(self) -> Task {
        Box::new(move || self.run())
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(hits: &Arc<AtomicUsize>) -> Task {
        let hits = hits.clone();
        Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_in_expiration_order() {
        let now = Instant::now();
        let mut timeouts = Timeouts::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for (label, millis) in [(1u8, 30u64), (2, 10), (3, 20)] {
            let order = order.clone();
            timeouts.schedule(
                now,
                Duration::from_millis(millis),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        // Nothing has expired yet.
        assert!(timeouts.check(now).is_empty());
        assert_eq!(timeouts.len(), 3);

        // Only the two earliest are expired at +25ms.
        for fired in timeouts.check(now + Duration::from_millis(25)) {
            fired.run();
        }
        assert_eq!(*order.lock().unwrap(), [2, 3]);
        assert_eq!(timeouts.len(), 1);

        for fired in timeouts.check(now + Duration::from_millis(100)) {
            fired.run();
        }
        assert_eq!(*order.lock().unwrap(), [2, 3, 1]);
        assert_eq!(timeouts.len(), 0);
    }

    #[test]
    fn cancelled_entry_never_runs() {
        let now = Instant::now();
        let mut timeouts = Timeouts::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle =
            timeouts.schedule(now, Duration::ZERO, counter_task(&hits));
        handle.cancel();
        for fired in timeouts.check(now + Duration::from_millis(1)) {
            fired.run();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_wins_after_dispatch() {
        // Cancel between check() and run(): the entry has already been
        // taken out of the registry, as if dispatched to an executor.
        let now = Instant::now();
        let mut timeouts = Timeouts::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle =
            timeouts.schedule(now, Duration::ZERO, counter_task(&hits));
        let mut fired = timeouts.check(now + Duration::from_millis(1));
        assert_eq!(fired.len(), 1);
        handle.cancel();
        fired.pop().unwrap().run();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn out_of_order_insertion_stays_sorted() {
        let now = Instant::now();
        let mut timeouts = Timeouts::new();
        let hits = Arc::new(AtomicUsize::new(0));
        timeouts.schedule(now, Duration::from_millis(50), counter_task(&hits));
        timeouts.schedule(now, Duration::from_millis(5), counter_task(&hits));

        // The early entry must be reachable without passing the late one.
        let fired = timeouts.check(now + Duration::from_millis(10));
        assert_eq!(fired.len(), 1);
        for f in fired {
            f.run();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timeouts.len(), 1);
    }
}
