//! Shared-knowledge store: vote-merged observations, consensus, learning.
//!
//! Workers publish key/value observations with a confidence; peers that
//! re-share a key affirm it, and confidence scales with the fraction of
//! active workers behind the entry. Capacity is bounded: when the store
//! overflows, the least-trusted (then oldest) entries go first. Entries
//! are mirrored into the KV adapter under `knowledge:<key>`.

pub mod consensus;
pub mod learning;

pub use consensus::{ConsensusOutcome, ConsensusSession, ConsensusStatus, ConsensusVote};
pub use learning::{Experience, LearnReport, LearnedPattern, PatternBank, PatternKind};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::store::{KvStore, KNOWLEDGE_PREFIX};
use crate::worker::WorkerId;

/// Confidence attached to solutions published through `learn`.
const LEARNED_SOLUTION_CONFIDENCE: f64 = 0.7;

/// One shared observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub author: WorkerId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Vote-scaled trust in [0,1].
    pub confidence: f64,
    /// Highest caller-supplied confidence observed for this key.
    base_confidence: f64,
    pub votes: HashSet<WorkerId>,
}

impl KnowledgeEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => now - self.created_at > chrono::Duration::milliseconds(ttl as i64),
            None => false,
        }
    }

    /// `base * |votes| / max(1, active)`; with a single author and a
    /// single active worker this is exactly the supplied confidence.
    fn recompute(&mut self, active_workers: usize) {
        let ratio = self.votes.len() as f64 / active_workers.max(1) as f64;
        self.confidence = (self.base_confidence * ratio).clamp(0.0, 1.0);
    }
}

/// What a periodic sweep removed or finalized.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub expired_keys: Vec<String>,
    pub timed_out_sessions: Vec<String>,
}

struct KnowledgeInner {
    entries: HashMap<String, KnowledgeEntry>,
    sessions: HashMap<String, ConsensusSession>,
    active_workers: HashSet<WorkerId>,
    bank: PatternBank,
}

/// The shared store, safe for concurrent workers.
pub struct KnowledgeStore {
    inner: Mutex<KnowledgeInner>,
    kv: Arc<dyn KvStore>,
    max_entries: usize,
    consensus_threshold: f64,
}

impl KnowledgeStore {
    pub fn new(kv: Arc<dyn KvStore>, max_entries: usize, consensus_threshold: f64) -> Self {
        Self {
            inner: Mutex::new(KnowledgeInner {
                entries: HashMap::new(),
                sessions: HashMap::new(),
                active_workers: HashSet::new(),
                bank: PatternBank::new(),
            }),
            kv,
            max_entries,
            consensus_threshold,
        }
    }

    /// Make a worker's votes count toward confidences.
    pub fn register_worker(&self, worker: WorkerId) {
        let mut inner = self.inner.lock();
        if inner.active_workers.insert(worker) {
            let active = inner.active_workers.len();
            for entry in inner.entries.values_mut() {
                entry.recompute(active);
            }
        }
    }

    /// Remove a worker: its affirmations disappear from every entry and
    /// every open session, and confidences are recomputed.
    pub fn unregister_worker(&self, worker: &WorkerId) {
        let mut inner = self.inner.lock();
        if !inner.active_workers.remove(worker) {
            return;
        }
        let active = inner.active_workers.len();
        for entry in inner.entries.values_mut() {
            entry.votes.remove(worker);
            entry.recompute(active);
        }
        for session in inner.sessions.values_mut() {
            session.retract_vote(worker);
        }
    }

    pub fn active_worker_count(&self) -> usize {
        self.inner.lock().active_workers.len()
    }

    /// Publish or affirm an observation.
    ///
    /// A fresh key is created with the author as its single vote. An
    /// existing key gains the author's vote; its value is replaced only
    /// when the incoming confidence strictly exceeds the stored one.
    pub async fn share(
        &self,
        worker: &WorkerId,
        key: &str,
        value: serde_json::Value,
        confidence: f64,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<KnowledgeEntry> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "confidence {confidence} outside [0,1]"
            )));
        }

        let (snapshot, evicted) = {
            let mut inner = self.inner.lock();
            let active = inner.active_workers.len();

            let live = inner
                .entries
                .get(key)
                .map(|e| !e.is_expired(now))
                .unwrap_or(false);

            if live {
                let entry = inner.entries.get_mut(key).expect("checked above");
                entry.votes.insert(worker.clone());
                if confidence > entry.confidence {
                    entry.value = value;
                    entry.created_at = now;
                    entry.base_confidence = entry.base_confidence.max(confidence);
                    if ttl.is_some() {
                        entry.ttl_ms = ttl.map(|t| t.as_millis() as u64);
                    }
                }
                entry.recompute(active);
                debug!(key, votes = entry.votes.len(), "Knowledge affirmed");
            } else {
                let mut entry = KnowledgeEntry {
                    key: key.to_string(),
                    value,
                    author: worker.clone(),
                    created_at: now,
                    ttl_ms: ttl.map(|t| t.as_millis() as u64),
                    confidence,
                    base_confidence: confidence,
                    votes: HashSet::from([worker.clone()]),
                };
                entry.recompute(active);
                inner.entries.insert(key.to_string(), entry);
                debug!(key, "Knowledge created");
            }

            let snapshot = inner.entries.get(key).cloned().expect("entry just written");
            let evicted = Self::evict_overflow(&mut inner, self.max_entries);
            (snapshot, evicted)
        };

        self.mirror_set(&snapshot).await;
        for key in &evicted {
            self.mirror_delete(key).await;
        }
        Ok(snapshot)
    }

    /// Read a live value; expired entries are removed on access.
    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Option<serde_json::Value> {
        enum Hit {
            Live(serde_json::Value),
            Expired,
            Missing,
        }

        let hit = {
            let mut inner = self.inner.lock();
            let hit = match inner.entries.get(key) {
                Some(entry) if entry.is_expired(now) => Hit::Expired,
                Some(entry) => Hit::Live(entry.value.clone()),
                None => Hit::Missing,
            };
            if matches!(hit, Hit::Expired) {
                inner.entries.remove(key);
            }
            hit
        };

        match hit {
            Hit::Live(value) => Some(value),
            Hit::Expired => {
                self.mirror_delete(key).await;
                None
            }
            Hit::Missing => None,
        }
    }

    /// Linear scan of live entries whose key matches the pattern.
    pub fn search(&self, pattern: &str, now: DateTime<Utc>) -> Result<Vec<KnowledgeEntry>> {
        let re = Regex::new(pattern)
            .map_err(|e| OrchestratorError::InvalidArgument(format!("bad pattern: {e}")))?;
        let inner = self.inner.lock();
        let mut matches: Vec<KnowledgeEntry> = inner
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .filter(|e| re.is_match(&e.key))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matches)
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Drop the least-trusted entries until the store fits its bound.
    /// Ties on confidence fall to the oldest entry.
    fn evict_overflow(inner: &mut KnowledgeInner, max_entries: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while inner.entries.len() > max_entries {
            let victim = inner
                .entries
                .values()
                .min_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|e| e.key.clone());
            match victim {
                Some(key) => {
                    inner.entries.remove(&key);
                    info!(key, "Knowledge entry evicted under memory pressure");
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    /// Remove expired entries and time out past-deadline sessions.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = {
            let mut inner = self.inner.lock();
            let expired_keys: Vec<String> = inner
                .entries
                .values()
                .filter(|e| e.is_expired(now))
                .map(|e| e.key.clone())
                .collect();
            for key in &expired_keys {
                inner.entries.remove(key);
            }

            let active = inner.active_workers.len();
            let mut timed_out_sessions = Vec::new();
            for session in inner.sessions.values_mut() {
                if !session.status.is_terminal() && session.is_past_deadline(now) {
                    session.expire(active);
                    timed_out_sessions.push(session.id.clone());
                }
            }

            SweepReport {
                expired_keys,
                timed_out_sessions,
            }
        };

        for key in &report.expired_keys {
            self.mirror_delete(key).await;
        }
        report
    }

    /// Open a vote among active workers.
    pub fn request_consensus(
        &self,
        requester: &WorkerId,
        topic: &str,
        proposal: serde_json::Value,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> String {
        let session = ConsensusSession::new(requester.clone(), topic, proposal, deadline, now);
        let id = session.id.clone();
        info!(session_id = %id, topic, "Consensus requested");
        self.inner.lock().sessions.insert(id.clone(), session);
        id
    }

    /// Cast a vote; finalizes the session once enough workers have voted.
    pub fn vote(
        &self,
        worker: &WorkerId,
        session_id: &str,
        value: bool,
        confidence: f64,
        reason: Option<String>,
    ) -> Result<ConsensusStatus> {
        let mut inner = self.inner.lock();
        let active = inner.active_workers.len();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))?;
        session.cast(
            worker.clone(),
            ConsensusVote {
                value,
                confidence,
                reason,
            },
            self.consensus_threshold,
            active,
        )
    }

    pub fn consensus_result(&self, session_id: &str) -> Result<ConsensusSession> {
        self.inner
            .lock()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id}")))
    }

    /// Absorb an experience into the pattern bank; successful solutions
    /// are also published as `solution:<problem>` knowledge.
    pub async fn learn(
        &self,
        worker: &WorkerId,
        experience: Experience,
        now: DateTime<Utc>,
    ) -> Result<LearnReport> {
        let patterns = {
            let mut inner = self.inner.lock();
            inner.bank.absorb(&experience, now)
        };

        let mut report = LearnReport {
            patterns,
            shared_key: None,
        };

        if experience.success {
            if let Some(solution) = &experience.solution {
                let key = format!("solution:{}", PatternBank::normalize(&experience.problem));
                self.share(
                    worker,
                    &key,
                    serde_json::json!({
                        "solution": solution,
                        "task_type": experience.task_type,
                        "duration_ms": experience.duration_ms,
                    }),
                    LEARNED_SOLUTION_CONFIDENCE,
                    None,
                    now,
                )
                .await?;
                report.shared_key = Some(key);
            }
        }
        Ok(report)
    }

    pub fn pattern(&self, key: &str) -> Option<LearnedPattern> {
        self.inner.lock().bank.get(key).cloned()
    }

    pub fn frequent_patterns(&self, limit: usize) -> Vec<LearnedPattern> {
        self.inner
            .lock()
            .bank
            .most_frequent(limit)
            .into_iter()
            .cloned()
            .collect()
    }

    async fn mirror_set(&self, entry: &KnowledgeEntry) {
        if let Ok(bytes) = serde_json::to_vec(entry) {
            let ttl = entry.ttl_ms.map(Duration::from_millis);
            let key = format!("{KNOWLEDGE_PREFIX}{}", entry.key);
            let _ = self.kv.set(&key, bytes, ttl).await;
        }
    }

    async fn mirror_delete(&self, key: &str) {
        let _ = self.kv.delete(&format!("{KNOWLEDGE_PREFIX}{key}")).await;
    }
}
