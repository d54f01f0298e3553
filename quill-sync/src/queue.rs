//! Pending change queue.
//!
//! Collects change descriptions that arrive while a session is in flight.
//! Entries are never dropped silently: the queue is either coalesced into the
//! next scheduled sync or discarded only after the working copy is confirmed
//! clean.

use quill_core::PendingChange;

#[derive(Debug, Default, Clone)]
pub struct PendingChangeQueue {
    changes: Vec<PendingChange>,
}

impl PendingChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.changes.push(PendingChange::new(message));
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingChange> {
        self.changes.iter()
    }

    /// Put previously taken changes back ahead of anything queued since.
    pub fn restore(&mut self, mut changes: Vec<PendingChange>) {
        changes.append(&mut self.changes);
        self.changes = changes;
    }

    /// Remove and return every queued change, oldest first.
    pub fn take(&mut self) -> Vec<PendingChange> {
        std::mem::take(&mut self.changes)
    }
}

/// Collapse queued changes into one commit message: the message itself for a
/// single entry, `"changes to N files"` otherwise. `None` for an empty slice.
pub fn coalesce(changes: &[PendingChange]) -> Option<String> {
    match changes {
        [] => None,
        [single] => Some(single.message.clone()),
        many => Some(format!("changes to {} files", many.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_change_is_kept_verbatim() {
        let mut queue = PendingChangeQueue::new();
        queue.push("edited GEN.codex");
        let changes = queue.take();
        assert_eq!(coalesce(&changes).as_deref(), Some("edited GEN.codex"));
        assert!(queue.is_empty());
    }

    #[test]
    fn many_changes_collapse_to_a_count() {
        let mut queue = PendingChangeQueue::new();
        for book in ["GEN", "EXO", "LEV"] {
            queue.push(format!("edited {book}.codex"));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(
            coalesce(&queue.take()).as_deref(),
            Some("changes to 3 files")
        );
    }

    #[test]
    fn restored_changes_stay_ahead_of_newer_ones() {
        let mut queue = PendingChangeQueue::new();
        queue.push("older");
        let taken = queue.take();
        queue.push("newer");
        queue.restore(taken);
        let messages: Vec<_> = queue.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["older", "newer"]);
    }

    #[test]
    fn empty_queue_has_nothing_to_coalesce() {
        assert_eq!(coalesce(&[]), None);
    }

    #[test]
    fn take_preserves_arrival_order() {
        let mut queue = PendingChangeQueue::new();
        queue.push("first");
        queue.push("second");
        let messages: Vec<_> = queue.take().into_iter().map(|c| c.message).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
