//! Session operations that failed and are waiting to be replayed.
//!
//! Entries drain by priority, then age. Minutes for one session collapse into
//! a single entry, so increments for a session can never overtake each other.
//! While an increment for a session is on the wire, everything else for that
//! session waits here.

use std::collections::HashMap;

use crate::models::{Priority, SessionPatch};

#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Increment {
        session_id: String,
        task_id: String,
        minutes: u32,
        /// Minutes earned in a focus mode count toward the task.
        focus: bool,
    },
    Close {
        session_id: String,
        patch: SessionPatch,
    },
}

impl PendingOp {
    pub fn session_id(&self) -> &str {
        match self {
            PendingOp::Increment { session_id, .. } | PendingOp::Close { session_id, .. } => {
                session_id
            }
        }
    }

    fn default_priority(&self) -> Priority {
        match self {
            PendingOp::Close { .. } => Priority::High,
            PendingOp::Increment { .. } => Priority::Normal,
        }
    }
}

/// An entry taken out of the queue. Hand it back with
/// [`SyncRetryQueue::restore`] if replaying it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOp {
    pub op: PendingOp,
    pub priority: Priority,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct SyncRetryQueue {
    entries: Vec<QueuedOp>,
    next_seq: u64,
    in_flight: HashMap<String, usize>,
}

impl SyncRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_increment(&self, session_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| is_increment_for(&entry.op, session_id))
    }

    /// True while minutes for `session_id` are queued here or on the wire.
    /// New minutes for the session must then be pushed behind them.
    pub fn holds_increments(&self, session_id: &str) -> bool {
        self.has_increment(session_id) || self.in_flight.contains_key(session_id)
    }

    /// Note an increment for `session_id` handed to the store.
    pub fn begin_increment(&mut self, session_id: &str) {
        *self.in_flight.entry(session_id.to_string()).or_insert(0) += 1;
    }

    /// Note that an increment handed to the store has settled.
    pub fn end_increment(&mut self, session_id: &str) {
        if let Some(count) = self.in_flight.get_mut(session_id) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(session_id);
            }
        }
    }

    /// Minutes waiting to be reported for `session_id`.
    pub fn pending_minutes(&self, session_id: &str) -> u32 {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.op {
                PendingOp::Increment {
                    session_id: id,
                    minutes,
                    ..
                } if id == session_id => Some(*minutes),
                _ => None,
            })
            .sum()
    }

    pub fn push(&mut self, op: PendingOp) {
        let priority = op.default_priority();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert(QueuedOp { op, priority, seq });
    }

    /// Put back an entry that could not be replayed. It keeps its original age.
    pub fn restore(&mut self, entry: QueuedOp) {
        self.insert(entry);
    }

    pub fn pop_next(&mut self) -> Option<QueuedOp> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| (entry.priority.rank(), entry.seq))
            .map(|(index, _)| index)?;
        Some(self.entries.remove(index))
    }

    /// Like [`pop_next`](Self::pop_next), skipping sessions that still have an
    /// increment on the wire. A popped increment is marked as on the wire.
    pub fn pop_ready(&mut self) -> Option<QueuedOp> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !self.in_flight.contains_key(entry.op.session_id()))
            .min_by_key(|(_, entry)| (entry.priority.rank(), entry.seq))
            .map(|(index, _)| index)?;
        let entry = self.entries.remove(index);
        if let PendingOp::Increment { session_id, .. } = &entry.op {
            self.begin_increment(session_id);
        }
        Some(entry)
    }

    fn insert(&mut self, incoming: QueuedOp) {
        let session_id = incoming.op.session_id().to_string();
        match incoming.op {
            PendingOp::Increment { minutes, .. } => {
                if let Some(existing) = self
                    .entries
                    .iter_mut()
                    .find(|entry| is_increment_for(&entry.op, &session_id))
                {
                    if let PendingOp::Increment {
                        minutes: queued, ..
                    } = &mut existing.op
                    {
                        *queued += minutes;
                    }
                    existing.seq = existing.seq.min(incoming.seq);
                    existing.priority = min_priority(existing.priority, incoming.priority);
                    return;
                }
            }
            PendingOp::Close { .. } => {
                // Queued minutes for the session go out before its close.
                for entry in self.entries.iter_mut() {
                    if is_increment_for(&entry.op, &session_id) {
                        entry.priority = Priority::High;
                        entry.seq = entry.seq.min(incoming.seq);
                    }
                }
                if let Some(existing) = self.entries.iter_mut().find(|entry| {
                    matches!(&entry.op, PendingOp::Close { session_id: id, .. } if *id == session_id)
                }) {
                    existing.op = incoming.op;
                    return;
                }
            }
        }
        self.entries.push(incoming);
    }
}

fn is_increment_for(op: &PendingOp, session_id: &str) -> bool {
    matches!(op, PendingOp::Increment { session_id: id, .. } if id == session_id)
}

fn min_priority(a: Priority, b: Priority) -> Priority {
    if a.rank() <= b.rank() {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;
    use chrono::Utc;

    fn increment(session_id: &str, minutes: u32) -> PendingOp {
        PendingOp::Increment {
            session_id: session_id.into(),
            task_id: "task-1".into(),
            minutes,
            focus: true,
        }
    }

    fn close(session_id: &str) -> PendingOp {
        PendingOp::Close {
            session_id: session_id.into(),
            patch: SessionPatch::closed(SessionStatus::Switched, Utc::now()),
        }
    }

    #[test]
    fn increments_for_one_session_coalesce() {
        let mut queue = SyncRetryQueue::new();
        queue.push(increment("s1", 1));
        queue.push(increment("s2", 1));
        queue.push(increment("s1", 1));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_minutes("s1"), 2);
        assert_eq!(queue.pop_next().unwrap().op, increment("s1", 2));
    }

    #[test]
    fn closes_drain_before_unrelated_increments() {
        let mut queue = SyncRetryQueue::new();
        queue.push(increment("s1", 1));
        queue.push(close("s2"));

        assert_eq!(queue.pop_next().unwrap().op.session_id(), "s2");
        assert_eq!(queue.pop_next().unwrap().op.session_id(), "s1");
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn a_session_reports_minutes_before_it_closes() {
        let mut queue = SyncRetryQueue::new();
        queue.push(close("s0"));
        queue.push(increment("s1", 3));
        queue.push(close("s1"));

        let order: Vec<PendingOp> = std::iter::from_fn(|| queue.pop_next().map(|entry| entry.op)).collect();
        assert_eq!(order[0].session_id(), "s0");
        assert_eq!(order[1], increment("s1", 3));
        assert!(matches!(order[2], PendingOp::Close { .. }));
    }

    #[test]
    fn restored_entries_keep_their_age() {
        let mut queue = SyncRetryQueue::new();
        queue.push(increment("s1", 1));
        queue.push(increment("s2", 1));

        let first = queue.pop_next().unwrap();
        queue.push(increment("s1", 1));
        queue.restore(first);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_next().unwrap().op, increment("s1", 2));
    }

    #[test]
    fn sessions_with_minutes_on_the_wire_wait() {
        let mut queue = SyncRetryQueue::new();
        queue.begin_increment("s1");
        assert!(queue.holds_increments("s1"));
        assert!(!queue.holds_increments("s2"));

        queue.push(increment("s1", 1));
        queue.push(close("s1"));
        queue.push(increment("s2", 1));
        assert_eq!(queue.pop_ready().unwrap().op, increment("s2", 1));
        assert!(queue.pop_ready().is_none());
        queue.end_increment("s2");

        queue.end_increment("s1");
        assert_eq!(queue.pop_ready().unwrap().op, increment("s1", 1));
        assert!(queue.holds_increments("s1"));
        assert!(queue.pop_ready().is_none());

        queue.end_increment("s1");
        assert!(matches!(queue.pop_ready().unwrap().op, PendingOp::Close { .. }));
        assert!(!queue.holds_increments("s1"));
    }

    #[test]
    fn repeated_closes_collapse() {
        let mut queue = SyncRetryQueue::new();
        queue.push(close("s1"));
        queue.push(close("s1"));
        assert_eq!(queue.len(), 1);
    }
}
