//! Four-tier ready queue with FIFO ordering inside each tier.
//!
//! Tiers are strict: the queue never yields a lower-tier task while a
//! higher tier holds one. Within a tier, ordering is by enqueue time with
//! task-id tiebreak so replays are deterministic. Aging promotes entries
//! that have waited too long, one tier per pass, never past Critical.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use super::{Priority, TaskId};

const TIER_COUNT: usize = 4;

/// A queued ready task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    /// Priority the task was submitted with.
    pub base_priority: Priority,
    /// Current priority after aging promotions.
    pub effective_priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn ordering_key(&self) -> (DateTime<Utc>, &TaskId) {
        (self.enqueued_at, &self.task_id)
    }
}

/// Strict-tier FIFO queue of ready tasks.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    tiers: [VecDeque<QueueEntry>; TIER_COUNT],
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the task's priority tier.
    pub fn push(&mut self, task_id: TaskId, priority: Priority, now: DateTime<Utc>) {
        let entry = QueueEntry {
            task_id,
            base_priority: priority,
            effective_priority: priority,
            enqueued_at: now,
        };
        self.insert_ordered(entry);
    }

    /// Insert keeping (enqueued_at, task_id) order within the tier.
    fn insert_ordered(&mut self, entry: QueueEntry) {
        let tier = &mut self.tiers[entry.effective_priority.tier()];
        let pos = tier
            .iter()
            .position(|e| e.ordering_key() > entry.ordering_key())
            .unwrap_or(tier.len());
        tier.insert(pos, entry);
    }

    /// Return an entry to the head of its tier after a declined assignment.
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.tiers[entry.effective_priority.tier()].push_front(entry);
    }

    /// Pop the highest-priority entry, FIFO within its tier.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Next entry without removing it.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.tiers.iter().find_map(VecDeque::front)
    }

    /// Remove a task wherever it is queued; returns whether it was present.
    pub fn remove(&mut self, task_id: &TaskId) -> bool {
        for tier in &mut self.tiers {
            if let Some(pos) = tier.iter().position(|e| e.task_id == *task_id) {
                tier.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tiers
            .iter()
            .any(|t| t.iter().any(|e| e.task_id == *task_id))
    }

    /// Promote every entry waiting longer than `threshold` by one tier.
    ///
    /// Returns the promoted task ids. Aging never demotes.
    pub fn age(&mut self, now: DateTime<Utc>, threshold: std::time::Duration) -> Vec<TaskId> {
        let threshold = match ChronoDuration::from_std(threshold) {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };

        let mut promoted = Vec::new();
        // Tier 0 is Critical; nothing above it.
        for tier_idx in 1..TIER_COUNT {
            let mut kept = VecDeque::new();
            while let Some(mut entry) = self.tiers[tier_idx].pop_front() {
                if now - entry.enqueued_at > threshold {
                    entry.effective_priority = entry.effective_priority.promoted();
                    debug!(
                        task_id = %entry.task_id,
                        tier = entry.effective_priority.tier(),
                        "Aged task promoted"
                    );
                    promoted.push(entry.task_id.clone());
                    self.insert_ordered(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            self.tiers[tier_idx] = kept;
        }
        promoted
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Entry count per tier, Critical first.
    pub fn tier_depths(&self) -> [usize; TIER_COUNT] {
        [
            self.tiers[0].len(),
            self.tiers[1].len(),
            self.tiers[2].len(),
            self.tiers[3].len(),
        ]
    }

    pub fn clear(&mut self) {
        for tier in &mut self.tiers {
            tier.clear();
        }
    }
}
