use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Tracks the pending participants of a flow: its goroutine-like tasks and
/// its not yet finished inbound streams.
///
/// The flow is done once the set becomes idle.
#[derive(Default)]
pub(crate) struct PendingSet {
    /// Map from pending participant to its name.
    ///
    /// Used to report what a flow is still waiting on. Should not be used for
    /// checking whether a specific participant is pending.
    pending: Mutex<HashMap<u64, Cow<'static, str>>>,
    /// Count of the total pending participants.
    ///
    /// Keeping this outside the mutex allows for fast checking of the current
    /// count.
    pending_count: AtomicUsize,
    next_key: AtomicU64,
    idle: Notify,
}

impl std::fmt::Debug for PendingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("PendingSet")
            .field("pending", &pending)
            .field("pending_count", &self.pending_count)
            .finish()
    }
}

/// One participant of a [PendingSet].
///
/// Completes exactly once, either explicitly or when dropped.
pub(crate) struct PendingParticipant {
    pending_set: Arc<PendingSet>,
    key: u64,
    is_complete: AtomicBool,
}

impl PendingSet {
    pub fn add_pending(self: &Arc<Self>, name: impl Into<Cow<'static, str>>) -> PendingParticipant {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let previous = self.pending.lock().insert(key, name.into());
        debug_assert_eq!(previous, None, "Duplicate participant added to pending set");
        self.pending_count.fetch_add(1, Ordering::Release);

        PendingParticipant {
            pending_set: self.clone(),
            key,
            is_complete: AtomicBool::new(false),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Names of the participants still pending, sorted.
    pub fn describe(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pending.lock().values().map(|n| n.to_string()).collect();
        names.sort();
        names
    }

    /// Waits until no participant is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for PendingParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingParticipant")
            .field("key", &self.key)
            .field("complete", &self.is_complete)
            .finish_non_exhaustive()
    }
}

impl PendingParticipant {
    /// Record this participant completed.
    pub fn complete(&self) {
        let previous = self.is_complete.fetch_or(true, Ordering::AcqRel);
        debug_assert!(!previous, "Participant already completed");
        if previous {
            return;
        }

        let name = self.pending_set.pending.lock().remove(&self.key);
        let remaining = self.pending_set.pending_count.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(
            "Completed {}. {remaining} remaining.",
            name.as_deref().unwrap_or("participant")
        );
        if remaining == 0 {
            self.pending_set.idle.notify_waiters();
        }
    }

    /// Return true if this participant is completed.
    pub fn is_complete(&self) -> bool {
        self.is_complete.load(Ordering::Acquire)
    }
}

impl Drop for PendingParticipant {
    fn drop(&mut self) {
        if !self.is_complete() {
            self.complete();
        }
    }
}

/// Spawns `future` as a participant of `pending`, completing it when the
/// future finishes or panics.
pub(crate) fn spawn_participant<F>(
    pending: &Arc<PendingSet>,
    name: impl Into<Cow<'static, str>>,
    future: F,
) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let participant = pending.add_pending(name);
    tokio::spawn(async move {
        let _participant = participant;
        future.await
    })
}
