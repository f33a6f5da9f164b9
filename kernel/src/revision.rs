// Revision Tracking
//
// The local tracker records how far this process has applied the log; the
// remote tracker records how far the log itself is known to reach. Gates
// compare the two.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::log::{EventLog, LogError, Revision};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("local revision {local} did not reach {target} within {waited:?}")]
    TimedOut {
        local: Revision,
        target: Revision,
        waited: Duration,
    },

    #[error("wait for revision {target} was interrupted")]
    Interrupted { target: Revision },
}

#[derive(Debug, Default)]
struct TrackerState {
    revision: Revision,
    /// First revision that could not be applied, while it stays unapplied.
    gap: Option<Revision>,
    interrupted: bool,
}

/// Revision fully applied to this process's policy store.
///
/// Written only by the component applying events; never decreases.
#[derive(Debug, Default)]
pub struct LocalRevisionTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl LocalRevisionTracker {
    pub fn new(initial: Revision) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                revision: initial,
                ..TrackerState::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> Revision {
        self.lock().revision
    }

    /// Move forward to `revision`. Lower values are ignored.
    ///
    /// Returns whether the tracker moved.
    pub fn advance(&self, revision: Revision) -> bool {
        let mut state = self.lock();
        if state.gap == Some(revision) {
            state.gap = None;
        }
        if revision <= state.revision {
            return false;
        }
        state.revision = revision;
        self.changed.notify_all();
        true
    }

    /// Record that `revision` was not applied. The earliest gap wins.
    pub fn mark_gap(&self, revision: Revision) {
        let mut state = self.lock();
        state.gap = Some(state.gap.map_or(revision, |gap| gap.min(revision)));
    }

    /// The unapplied revision, if the local state is no longer a
    /// contiguous prefix of the log.
    pub fn gap(&self) -> Option<Revision> {
        self.lock().gap
    }

    /// Block until the tracker reaches `target` or `timeout` elapses.
    pub fn wait_for(&self, target: Revision, timeout: Duration) -> Result<Revision, WaitError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.lock();

        loop {
            if state.interrupted {
                return Err(WaitError::Interrupted { target });
            }
            if state.revision >= target {
                return Ok(state.revision);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut {
                    local: state.revision,
                    target,
                    waited: now - started,
                });
            }

            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Fail every current and future wait. Used when the process stops.
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.changed.notify_all();
    }
}

/// Latest revision known to exist in the log.
///
/// Refreshed on demand; may be stale between refreshes.
pub struct RemoteTailTracker {
    log: Arc<dyn EventLog>,
    known: AtomicU64,
}

impl RemoteTailTracker {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            known: AtomicU64::new(0),
        }
    }

    /// Record a revision observed from an append acknowledgement.
    pub fn observe(&self, revision: Revision) {
        self.known.fetch_max(revision, Ordering::SeqCst);
    }

    pub fn cached(&self) -> Revision {
        self.known.load(Ordering::SeqCst)
    }

    /// Ask the log for its tail, waiting at most `timeout`.
    pub fn refresh(&self, timeout: Duration) -> Result<Revision, LogError> {
        let tail = self.log.tail(timeout)?;
        Ok(self.known.fetch_max(tail, Ordering::SeqCst).max(tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{InMemoryEventLog, PolicyEvent};
    use crate::state::NodeId;
    use std::thread;

    #[test]
    fn advance_is_monotonic() {
        let tracker = LocalRevisionTracker::new(0);
        for revision in [1, 3, 2, 7, 5] {
            tracker.advance(revision);
        }
        assert_eq!(tracker.current(), 7);
        assert!(!tracker.advance(6));
    }

    #[test]
    fn wait_returns_once_another_thread_advances() {
        let tracker = Arc::new(LocalRevisionTracker::new(41));
        let writer = Arc::clone(&tracker);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.advance(42);
        });

        assert_eq!(tracker.wait_for(42, Duration::from_secs(5)), Ok(42));
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_after_roughly_the_timeout() {
        let tracker = LocalRevisionTracker::new(1);
        let started = Instant::now();

        let err = tracker.wait_for(2, Duration::from_millis(50)).unwrap_err();

        assert!(matches!(err, WaitError::TimedOut { local: 1, target: 2, .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn interrupt_fails_waiters() {
        let tracker = Arc::new(LocalRevisionTracker::new(0));
        let waiter = Arc::clone(&tracker);
        let handle = thread::spawn(move || waiter.wait_for(10, Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        tracker.interrupt();

        assert_eq!(
            handle.join().unwrap(),
            Err(WaitError::Interrupted { target: 10 })
        );
    }

    #[test]
    fn gap_clears_only_when_that_revision_is_applied() {
        let tracker = LocalRevisionTracker::new(4);
        tracker.mark_gap(5);
        tracker.advance(6);
        assert_eq!(tracker.gap(), Some(5));

        tracker.advance(5);
        assert_eq!(tracker.gap(), None);
    }

    #[test]
    fn tail_tracker_never_moves_backwards() {
        let log = Arc::new(InMemoryEventLog::new());
        let tail = RemoteTailTracker::new(log.clone());
        tail.observe(9);

        let batch = vec![PolicyEvent::NodeDeleted { id: NodeId(1) }.encode().unwrap()];
        log.append(batch).unwrap();

        assert_eq!(tail.refresh(Duration::from_millis(10)).unwrap(), 9);
        assert_eq!(tail.cached(), 9);
    }
}
