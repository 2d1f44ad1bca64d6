//! Buffer-until-precondition queue used by both candidate paths
//!
//! Local candidates buffer until the local accept/initiate has been sent;
//! remote candidates buffer until an engine with peer credentials exists.
//! In both cases the queue drains completely the moment the precondition
//! holds, and every item appears in exactly one flush.

/// A queue that holds items until marked ready, then passes them through.
///
/// `push_with` returns the batch to deliver now: empty while buffering,
/// the pushed items (deduplicated) once ready. `mark_ready` drains
/// everything accumulated so far in one batch.
#[derive(Debug)]
pub(crate) struct TrickleQueue<T> {
    pending: Vec<T>,
    seen: Vec<T>,
    ready: bool,
}

impl<T: Clone> TrickleQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::new(),
            seen: Vec::new(),
            ready: false,
        }
    }

    /// Queue or pass through a batch, deduplicating with `same`.
    ///
    /// Items equal (under `same`) to anything previously pushed are
    /// dropped, so the accumulated set delivered at `mark_ready` is
    /// duplicate-free even when the remote repeats itself across
    /// messages.
    pub(crate) fn push_with<F>(&mut self, items: impl IntoIterator<Item = T>, same: F) -> Vec<T>
    where
        F: Fn(&T, &T) -> bool,
    {
        let mut out = Vec::new();
        for item in items {
            if self.seen.iter().any(|s| same(s, &item)) {
                continue;
            }
            self.seen.push(item.clone());
            if self.ready {
                out.push(item);
            } else {
                self.pending.push(item);
            }
        }
        out
    }

    /// Mark the precondition satisfied and drain everything buffered.
    ///
    /// Idempotent: a second call returns an empty batch.
    pub(crate) fn mark_ready(&mut self) -> Vec<T> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }
}

impl<T: Clone> Default for TrickleQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
