//! qntx-match
//!
//! Structural-AND-semantic match evaluation (§4.C5). Pure apart from the
//! embedding calls it awaits; never touches a lock itself — the caller
//! (qntx-engine) holds the read lock for the structural/cache lookups and
//! schedules any cache write this function signals via `computed_embedding`.

use qntx_embedding::{compute_similarity, Embedding, EmbeddingProvider};
use qntx_model::{Attestation, Watcher};

/// Result of evaluating one `(attestation, watcher)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub similarity: f32,
    /// Set when this evaluation computed the watcher's query embedding for
    /// the first time (lazy attach). The caller is responsible for
    /// scheduling its insertion into the cache under the write lock — never
    /// synchronously while holding the read lock used for evaluation
    /// (§4.C4, §5).
    pub computed_embedding: Option<Embedding>,
}

impl MatchOutcome {
    fn non_match() -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            computed_embedding: None,
        }
    }

    fn structural_only() -> Self {
        Self {
            matched: true,
            similarity: 0.0,
            computed_embedding: None,
        }
    }
}

/// Evaluate one attestation against one watcher, following §4.C5's five
/// numbered steps.
pub async fn evaluate(
    attestation: &Attestation,
    watcher: &Watcher,
    cached_query_embedding: Option<&Embedding>,
    provider: Option<&dyn EmbeddingProvider>,
) -> MatchOutcome {
    // Step 1: structural filter. A watcher with no filter at all has no
    // structural predicate and this step is skipped entirely.
    if let Some(filter) = &watcher.filter {
        if !filter.matches(attestation) {
            return MatchOutcome::non_match();
        }
    }

    // Step 2: no semantic query means the structural match is the whole
    // story.
    if !watcher.has_semantic_query() {
        return MatchOutcome::structural_only();
    }

    // Step 3/4: obtain the watcher's query embedding, from cache or lazily.
    let mut computed_embedding = None;
    let query_embedding = match cached_query_embedding {
        Some(cached) => cached.clone(),
        None => {
            let Some(provider) = provider else {
                tracing::debug!(
                    watcher_id = %watcher.id,
                    "no cached query embedding and no provider attached; treating as non-match"
                );
                return MatchOutcome::non_match();
            };
            let query_text = watcher.semantic_query.as_deref().unwrap_or_default();
            match provider.generate(query_text).await {
                Ok(embedding) => {
                    computed_embedding = Some(embedding.clone());
                    embedding
                }
                Err(error) => {
                    tracing::debug!(
                        watcher_id = %watcher.id,
                        %error,
                        "embedding generation failed for watcher query text"
                    );
                    return MatchOutcome::non_match();
                }
            }
        }
    };

    // Step 5: score. Empty attestation text short-circuits without calling
    // the embedder.
    let text = attestation.semantic_text();
    if text.is_empty() {
        return MatchOutcome {
            matched: false,
            similarity: 0.0,
            computed_embedding,
        };
    }

    let Some(provider) = provider else {
        tracing::debug!(
            watcher_id = %watcher.id,
            "no embedding provider attached to score attestation text"
        );
        return MatchOutcome {
            matched: false,
            similarity: 0.0,
            computed_embedding,
        };
    };

    let attestation_embedding = match provider.generate(&text).await {
        Ok(embedding) => embedding,
        Err(error) => {
            tracing::debug!(
                attestation_id = %attestation.id,
                %error,
                "embedding generation failed for attestation text"
            );
            return MatchOutcome {
                matched: false,
                similarity: 0.0,
                computed_embedding,
            };
        }
    };

    let similarity = compute_similarity(&query_embedding, &attestation_embedding);
    let matched = similarity >= watcher.effective_threshold();

    MatchOutcome {
        matched,
        similarity,
        computed_embedding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qntx_embedding::EmbeddingError;
    use qntx_model::{ActionData, Filter, WatcherCounters};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    struct ScriptedProvider {
        // text -> embedding
        responses: Mutex<std::collections::HashMap<String, Embedding>>,
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn generate(&self, text: &str) -> Result<Embedding, EmbeddingError> {
            self.responses
                .lock()
                .unwrap()
                .get(text)
                .cloned()
                .ok_or(EmbeddingError::Unavailable)
        }
    }

    fn attestation_with_text(text: &str) -> Attestation {
        let mut attrs = BTreeMap::new();
        attrs.insert("note".to_string(), qntx_model::Value::Text(text.to_string()));
        Attestation::new(
            "a1",
            chrono::Utc::now(),
            "test",
            vec![],
            vec![],
            vec![],
            vec![],
            attrs,
        )
    }

    fn semantic_watcher(query: &str, threshold: f32) -> Watcher {
        Watcher {
            id: "w1".into(),
            enabled: true,
            raw_query: None,
            filter: None,
            semantic_query: Some(query.to_string()),
            semantic_threshold: threshold,
            action_data: ActionData::SemanticOnly,
            max_fires_per_minute: 6,
            counters: WatcherCounters::default(),
        }
    }

    #[tokio::test]
    async fn structural_miss_short_circuits_without_semantic_scoring() {
        let watcher = Watcher {
            filter: Some(Filter::new(
                BTreeSet::from(["carol".to_string()]),
                BTreeSet::new(),
                BTreeSet::new(),
                BTreeSet::new(),
                None,
                None,
            )),
            ..semantic_watcher("quantum indeterminacy", 0.3)
        };
        let attestation = attestation_with_text("hello");
        let outcome = evaluate(&attestation, &watcher, None, None).await;
        assert_eq!(outcome, MatchOutcome::non_match());
    }

    #[tokio::test]
    async fn no_semantic_query_is_structural_only_match() {
        let watcher = Watcher {
            semantic_query: None,
            filter: Some(Filter::wildcard()),
            ..semantic_watcher("unused", 0.3)
        };
        let attestation = attestation_with_text("hello");
        let outcome = evaluate(&attestation, &watcher, None, None).await;
        assert!(outcome.matched);
        assert_eq!(outcome.similarity, 0.0);
    }

    #[tokio::test]
    async fn semantic_threshold_boundary_scenario_s5() {
        let mut responses = std::collections::HashMap::new();
        responses.insert(
            "quantum indeterminacy".to_string(),
            Embedding(vec![1.0, 0.0]),
        );
        // cos(angle) chosen so similarity rounds to 0.31 for A, 0.29 for B.
        responses.insert("attestation a".to_string(), Embedding(vec![0.31, (1.0 - 0.31f32 * 0.31).sqrt()]));
        responses.insert("attestation b".to_string(), Embedding(vec![0.29, (1.0 - 0.29f32 * 0.29).sqrt()]));
        let provider = ScriptedProvider {
            responses: Mutex::new(responses),
        };

        let watcher = semantic_watcher("quantum indeterminacy", 0.3);

        let a = attestation_with_text("attestation a");
        let outcome_a = evaluate(&a, &watcher, None, Some(&provider)).await;
        assert!((outcome_a.similarity - 0.31).abs() < 1e-4);
        assert!(outcome_a.matched);

        let b = attestation_with_text("attestation b");
        let outcome_b = evaluate(&b, &watcher, None, Some(&provider)).await;
        assert!((outcome_b.similarity - 0.29).abs() < 1e-4);
        assert!(!outcome_b.matched);
    }

    #[tokio::test]
    async fn lazy_query_embedding_is_signaled_back_for_caching() {
        let mut responses = std::collections::HashMap::new();
        responses.insert("q".to_string(), Embedding(vec![1.0, 0.0]));
        responses.insert("text".to_string(), Embedding(vec![1.0, 0.0]));
        let provider = ScriptedProvider {
            responses: Mutex::new(responses),
        };
        let watcher = semantic_watcher("q", 0.3);
        let attestation = attestation_with_text("text");

        let outcome = evaluate(&attestation, &watcher, None, Some(&provider)).await;
        assert!(outcome.computed_embedding.is_some());
        assert!(outcome.matched);
    }

    #[tokio::test]
    async fn empty_attestation_text_is_non_match_without_calling_embedder() {
        let watcher = semantic_watcher("q", 0.3);
        let attestation = Attestation::new(
            "a1",
            chrono::Utc::now(),
            "test",
            vec![],
            vec![],
            vec![],
            vec![],
            BTreeMap::new(),
        );
        // No provider at all: if the embedder were called this would panic
        // via Unavailable; it must never be reached because text is empty
        // only after the query embedding is resolved. Use a cached query
        // embedding so we reach the attestation-text step.
        let cached = Embedding(vec![1.0, 0.0]);
        let outcome = evaluate(&attestation, &watcher, Some(&cached), None).await;
        assert_eq!(outcome.matched, false);
        assert_eq!(outcome.similarity, 0.0);
    }
}
