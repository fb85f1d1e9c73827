use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::value::Value;

/// An immutable, timestamped fact. Created once, never mutated; callers that
/// need to hand an attestation across a dispatch boundary get a defensive
/// clone via [`Attestation::deep_clone`] rather than a shared reference.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Attestation {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub subjects: Vec<String>,
    pub predicates: Vec<String>,
    pub contexts: Vec<String>,
    pub actors: Vec<String>,
    pub attributes: BTreeMap<String, Value>,
}

impl Attestation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        subjects: Vec<String>,
        predicates: Vec<String>,
        contexts: Vec<String>,
        actors: Vec<String>,
        attributes: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            source: source.into(),
            subjects,
            predicates,
            contexts,
            actors,
            attributes,
        }
    }

    /// Value-copy `id`/`timestamp`/`source`, shallow-clone the token
    /// sequences, and key-by-key copy `attributes`. Matches §4.C9 step 5's
    /// description of the snapshot handed to the dispatcher: every field is
    /// independently owned, so the dispatcher's copy can outlive the
    /// attestation that triggered it without borrowing from the caller.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Build the text used for semantic matching (§4.C5 "Attestation text
    /// extraction"): string attributes and string members of list attributes
    /// first (walked in sorted-key order, see SPEC_FULL.md §9), falling back
    /// to predicates, then subjects, then contexts when there are no string
    /// attributes at all.
    pub fn semantic_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for value in self.attributes.values() {
            collect_strings(value, &mut parts);
        }

        if !parts.is_empty() {
            return parts.join(" ");
        }

        let fallback: Vec<&str> = self
            .predicates
            .iter()
            .chain(self.subjects.iter())
            .chain(self.contexts.iter())
            .map(|s| s.as_str())
            .collect();
        fallback.join(" ")
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Text(s) => out.push(s.as_str()),
        Value::List(items) => {
            for item in items {
                if let Value::Text(s) = item {
                    out.push(s.as_str());
                }
            }
        }
        _ => {}
    }
}
