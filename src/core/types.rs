//! Core types shared across OpenRecall
//!
//! A [`Turn`] is the durable unit: one user/assistant exchange, its embedding
//! and an open metadata document. [`NewTurn`] is what callers hand to `save`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier of a persisted turn
pub type TurnId = Uuid;

/// Open metadata document attached to a turn.
///
/// Free-form apart from the reserved fingerprint keys [`Metadata::CONTENT_HASH`]
/// and [`Metadata::TIME_AWARE_HASH`], which the store stamps on save.
/// Tool-call records conventionally live under [`Metadata::TOOL_CALLS`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    /// Fingerprint of the normalized turn text
    pub const CONTENT_HASH: &'static str = "contentHash";
    /// Fingerprint salted with the hour bucket
    pub const TIME_AWARE_HASH: &'static str = "timeAwareHash";
    /// Tool-call records
    pub const TOOL_CALLS: &'static str = "toolCalls";

    /// Create empty metadata
    pub fn new() -> Self {
        Metadata(Map::new())
    }

    /// Whether `key` is one of the fingerprint keys owned by the store
    pub fn is_reserved(key: &str) -> bool {
        key == Self::CONTENT_HASH || key == Self::TIME_AWARE_HASH
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Check for a key
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of top-level keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the document is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Stored content fingerprint
    pub fn content_hash(&self) -> Option<&str> {
        self.0.get(Self::CONTENT_HASH).and_then(Value::as_str)
    }

    /// Stored time-bucketed fingerprint
    pub fn time_aware_hash(&self) -> Option<&str> {
        self.0.get(Self::TIME_AWARE_HASH).and_then(Value::as_str)
    }

    /// Tool-call records, empty when absent
    pub fn tool_calls(&self) -> &[Value] {
        self.0
            .get(Self::TOOL_CALLS)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Additive deep merge of `patch` into `self`.
    ///
    /// Objects merge recursively, arrays gain the elements they lack, scalars
    /// are replaced by scalars. A value whose shape differs from the patch's is
    /// kept as is. Nothing already present is removed, and the reserved
    /// fingerprint keys are never touched.
    pub fn merge_additive(&mut self, patch: &Metadata) {
        for (key, value) in &patch.0 {
            if Self::is_reserved(key) {
                continue;
            }
            match self.0.get_mut(key) {
                Some(existing) => merge_value(existing, value),
                None => {
                    self.0.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Whether every non-reserved field of `self` is already present in `other`.
    ///
    /// This is the "no new information" test used by the dedup guard: nested
    /// objects must be covered key by key, every array element must appear in
    /// the other array, scalars must be equal and nulls are ignored.
    pub fn is_covered_by(&self, other: &Metadata) -> bool {
        self.0.iter().all(|(key, value)| {
            if Self::is_reserved(key) || value.is_null() {
                return true;
            }
            match other.0.get(key) {
                Some(existing) => value_covered(value, existing),
                None => false,
            }
        })
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Metadata(map)
    }
}

impl From<Metadata> for Value {
    fn from(metadata: Metadata) -> Self {
        Value::Object(metadata.0)
    }
}

impl TryFrom<Value> for Metadata {
    type Error = crate::Error;

    fn try_from(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(map) => Ok(Metadata(map)),
            Value::Null => Ok(Metadata::new()),
            other => Err(crate::Error::Validation(format!(
                "metadata must be a JSON object, got {}",
                other
            ))),
        }
    }
}

fn merge_value(existing: &mut Value, incoming: &Value) {
    match (existing, incoming) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(patch)) => {
            for item in patch {
                if !base.contains(item) {
                    base.push(item.clone());
                }
            }
        }
        (_, Value::Null) => {}
        (slot @ Value::Null, value) => *slot = value.clone(),
        // Shapes never change: a structured value on either side keeps the existing one
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => {}
        (slot, value) => *slot = value.clone(),
    }
}

fn value_covered(candidate: &Value, existing: &Value) -> bool {
    match (candidate, existing) {
        (Value::Null, _) => true,
        (Value::Object(c), Value::Object(e)) => c.iter().all(|(k, v)| {
            v.is_null() || e.get(k).map_or(false, |ev| value_covered(v, ev))
        }),
        (Value::Array(c), Value::Array(e)) => c
            .iter()
            .all(|item| e.iter().any(|ev| value_covered(item, ev))),
        (c, e) => c == e,
    }
}

/// A turn as submitted by a caller, before it has an id or timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTurn {
    /// Optional session grouping
    pub session_id: Option<String>,
    /// What the user said
    pub user_input: String,
    /// What the assistant answered
    pub assistant_response: String,
    /// Vector of the configured dimension
    pub embedding: Vec<f32>,
    /// Caller-supplied metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewTurn {
    /// Create a new turn with no session and empty metadata
    pub fn new(
        user_input: impl Into<String>,
        assistant_response: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        NewTurn {
            session_id: None,
            user_input: user_input.into(),
            assistant_response: assistant_response.into(),
            embedding,
            metadata: Metadata::new(),
        }
    }

    /// Set the session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Text used for embedding the turn
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.user_input, &self.assistant_response)
    }
}

/// Text representation of an exchange, used when embedding it
pub fn embedding_text(user_input: &str, assistant_response: &str) -> String {
    match (user_input.trim(), assistant_response.trim()) {
        ("", a) => format!("Assistant: {}", a),
        (u, "") => format!("User: {}", u),
        (u, a) => format!("User: {}\nAssistant: {}", u, a),
    }
}

/// A persisted turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique id, immutable
    pub id: TurnId,
    /// Optional session grouping
    pub session_id: Option<String>,
    /// What the user said
    pub user_input: String,
    /// What the assistant answered
    pub assistant_response: String,
    /// Vector of the configured dimension
    pub embedding: Vec<f32>,
    /// Open metadata, always carrying the fingerprints
    pub metadata: Metadata,
    /// When the turn was created
    pub created_at: DateTime<Utc>,
    /// Last metadata enrichment
    pub updated_at: DateTime<Utc>,
}

impl Turn {
    /// Materialize a submitted turn with a fresh id
    pub fn from_new(new: NewTurn, now: DateTime<Utc>) -> Self {
        Turn {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            user_input: new.user_input,
            assistant_response: new.assistant_response,
            embedding: new.embedding,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Text passed to the compressor for this turn
    pub fn chunk_text(&self) -> String {
        embedding_text(&self.user_input, &self.assistant_response)
    }
}

/// A turn with its cosine similarity to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTurn {
    /// The matching turn
    pub turn: Turn,
    /// Cosine similarity (1 - cosine distance)
    pub score: f32,
}
