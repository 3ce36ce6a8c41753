//! Consensus sessions: bounded votes over a proposal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::worker::WorkerId;

/// Session lifecycle. Terminal states are final: no vote can alter them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Pending,
    Approved,
    Rejected,
    /// Deadline passed before the vote threshold was reached.
    TimedOut,
}

impl ConsensusStatus {
    pub fn is_terminal(&self) -> bool {
        *self != Self::Pending
    }
}

/// One worker's vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub value: bool,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Final tally of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub status: ConsensusStatus,
    pub votes_for: usize,
    pub votes_against: usize,
    /// Voters over active workers at finalization.
    pub participation: f64,
    /// Positive voters over active workers at finalization.
    pub consensus: f64,
}

/// A vote over one proposal among the active workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSession {
    pub id: String,
    pub topic: String,
    pub proposal: serde_json::Value,
    pub requester: WorkerId,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub votes: HashMap<WorkerId, ConsensusVote>,
    pub status: ConsensusStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ConsensusOutcome>,
}

impl ConsensusSession {
    pub fn new(
        requester: WorkerId,
        topic: impl Into<String>,
        proposal: serde_json::Value,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("consensus-{}", uuid::Uuid::new_v4()),
            topic: topic.into(),
            proposal,
            requester,
            created_at: now,
            deadline,
            votes: HashMap::new(),
            status: ConsensusStatus::Pending,
            outcome: None,
        }
    }

    /// Record a vote, finalizing immediately once enough workers voted.
    ///
    /// Rejected on terminal sessions and on repeat voters.
    pub fn cast(
        &mut self,
        voter: WorkerId,
        vote: ConsensusVote,
        threshold: f64,
        active_workers: usize,
    ) -> Result<ConsensusStatus> {
        if self.status.is_terminal() {
            return Err(OrchestratorError::invalid_state(
                "pending consensus session",
                format!("{} is {:?}", self.id, self.status),
            ));
        }
        if self.votes.contains_key(&voter) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "worker {voter} already voted in session {}",
                self.id
            )));
        }

        self.votes.insert(voter, vote);

        let needed = threshold * active_workers as f64;
        if self.votes.len() as f64 >= needed {
            self.finalize(threshold, active_workers);
        }
        Ok(self.status)
    }

    /// Tally the session. Approval requires positive voters to reach the
    /// threshold fraction of active workers.
    pub fn finalize(&mut self, threshold: f64, active_workers: usize) {
        let votes_for = self.votes.values().filter(|v| v.value).count();
        let votes_against = self.votes.len() - votes_for;
        let active = active_workers.max(1) as f64;
        let consensus = votes_for as f64 / active;

        self.status = if consensus >= threshold {
            ConsensusStatus::Approved
        } else {
            ConsensusStatus::Rejected
        };
        self.outcome = Some(ConsensusOutcome {
            status: self.status,
            votes_for,
            votes_against,
            participation: self.votes.len() as f64 / active,
            consensus,
        });
    }

    /// Deadline expiry without the vote threshold.
    pub fn expire(&mut self, active_workers: usize) {
        if self.status.is_terminal() {
            return;
        }
        let votes_for = self.votes.values().filter(|v| v.value).count();
        let active = active_workers.max(1) as f64;
        self.status = ConsensusStatus::TimedOut;
        self.outcome = Some(ConsensusOutcome {
            status: ConsensusStatus::TimedOut,
            votes_for,
            votes_against: self.votes.len() - votes_for,
            participation: self.votes.len() as f64 / active,
            consensus: votes_for as f64 / active,
        });
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Remove a departed worker's vote; only meaningful while pending.
    pub fn retract_vote(&mut self, voter: &WorkerId) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.votes.remove(voter).is_some()
    }
}
