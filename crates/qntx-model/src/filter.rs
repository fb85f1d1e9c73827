use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::attestation::Attestation;

/// A structural predicate. An empty required set means "wildcard" (always
/// passes); a non-empty one must intersect the attestation's corresponding
/// (lower-cased) token sequence. See §3/§4.C1.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Filter {
    pub subjects: BTreeSet<String>,
    pub predicates: BTreeSet<String>,
    pub contexts: BTreeSet<String>,
    pub actors: BTreeSet<String>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

impl Filter {
    /// Construct a filter from already lower-cased required sets. Raw,
    /// possibly mixed-case input should go through [`crate::query::parse`]
    /// instead, which lower-cases each token before inserting it here.
    pub fn new(
        subjects: BTreeSet<String>,
        predicates: BTreeSet<String>,
        contexts: BTreeSet<String>,
        actors: BTreeSet<String>,
        time_start: Option<DateTime<Utc>>,
        time_end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            subjects,
            predicates,
            contexts,
            actors,
            time_start,
            time_end,
        }
    }

    /// Matches everything: empty required sets, no time window.
    pub fn wildcard() -> Self {
        Self::default()
    }

    /// Structural match (§4.C1): every non-empty required set must intersect
    /// the attestation's corresponding lower-cased sequence, AND the
    /// timestamp must fall in the half-open `[time_start, time_end)` window.
    pub fn matches(&self, attestation: &Attestation) -> bool {
        has_overlap(&self.subjects, &attestation.subjects)
            && has_overlap(&self.predicates, &attestation.predicates)
            && has_overlap(&self.contexts, &attestation.contexts)
            && has_overlap(&self.actors, &attestation.actors)
            && self.in_window(attestation.timestamp)
    }

    fn in_window(&self, ts: DateTime<Utc>) -> bool {
        if let Some(start) = self.time_start {
            if ts < start {
                return false;
            }
        }
        if let Some(end) = self.time_end {
            if ts >= end {
                return false;
            }
        }
        true
    }

    /// Raises `time_start` to at least `watermark`, used by the edge-cursor
    /// manager (§4.C8) to prevent replay across restart. Never lowers it.
    pub fn lift_time_start(&mut self, watermark: DateTime<Utc>) {
        self.time_start = Some(match self.time_start {
            Some(existing) if existing > watermark => existing,
            _ => watermark,
        });
    }
}

/// Empty required set is an unconditional pass; otherwise set-membership
/// with lower-cased actual tokens against the (already lower-cased) required
/// set.
fn has_overlap(required: &BTreeSet<String>, actual: &[String]) -> bool {
    if required.is_empty() {
        return true;
    }
    actual
        .iter()
        .any(|token| required.contains(&token.to_lowercase()))
}
