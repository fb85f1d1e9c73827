use chrono::{DateTime, Utc};

use crate::filter::Filter;

pub const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.3;

/// A composition-edge descriptor carried by `code`-kind watchers that
/// participate in the edge-cursor manager (§4.C8).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompositionEdge {
    pub composition_id: String,
    pub source_glyph_id: String,
    pub target_glyph_id: String,
    pub target_glyph_type: String,
}

impl CompositionEdge {
    pub fn cursor_key(&self) -> (String, String, String) {
        (
            self.composition_id.clone(),
            self.source_glyph_id.clone(),
            self.target_glyph_id.clone(),
        )
    }
}

/// The closed sum type of actions a watcher can fire (§9 "Polymorphic action
/// dispatch" design note — parsed once at load time, not dispatched via a
/// runtime string table).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionData {
    Code {
        content: String,
        glyph_id: Option<String>,
        composition: Option<CompositionEdge>,
    },
    Prompt {
        template: String,
        glyph_id: String,
    },
    Webhook {
        url: String,
    },
    SemanticOnly,
}

impl ActionData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActionData::Code { .. } => "code",
            ActionData::Prompt { .. } => "prompt",
            ActionData::Webhook { .. } => "webhook",
            ActionData::SemanticOnly => "semantic_only",
        }
    }

    pub fn composition_edge(&self) -> Option<&CompositionEdge> {
        match self {
            ActionData::Code { composition, .. } => composition.as_ref(),
            _ => None,
        }
    }
}

/// Operator-facing counters and error state, mutated only through
/// `WatcherStore::record_fire` / `record_error` (§4.C2).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WatcherCounters {
    pub fire_count: u64,
    pub error_count: u64,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_errored_at: Option<DateTime<Utc>>,
}

/// A user-declared subscription: a predicate (structural and/or semantic)
/// plus an action to run on match. See §3.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Watcher {
    pub id: String,
    pub enabled: bool,
    pub raw_query: Option<String>,
    pub filter: Option<Filter>,
    pub semantic_query: Option<String>,
    pub semantic_threshold: f32,
    pub action_data: ActionData,
    pub max_fires_per_minute: u32,
    pub counters: WatcherCounters,
}

impl Watcher {
    /// `semantic_threshold if > 0 else 0.3` (§3).
    pub fn effective_threshold(&self) -> f32 {
        if self.semantic_threshold > 0.0 {
            self.semantic_threshold
        } else {
            DEFAULT_SEMANTIC_THRESHOLD
        }
    }

    pub fn has_semantic_query(&self) -> bool {
        self.semantic_query.as_deref().is_some_and(|s| !s.is_empty())
    }
}
