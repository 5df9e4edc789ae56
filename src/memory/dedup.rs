//! Dedup guard: content fingerprints and the session-scoped lookback check
//!
//! Two fingerprints are stamped on every saved turn:
//! - `contentHash`: SHA-256 of the normalized user + assistant text
//! - `timeAwareHash`: the same content salted with its UTC hour bucket
//!
//! A candidate is skipped only when it has a session, a turn in that session
//! within the lookback window carries either fingerprint, and the candidate's
//! metadata adds nothing the match does not already have. The lookup and the
//! later insert are separate round trips, so two concurrent near-duplicates
//! may both be admitted.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::core::storage::{DuplicateProbe, TurnBackend};
use crate::core::types::{NewTurn, TurnId};
use crate::error::{Error, Result};
use crate::resilience::ResiliencePolicy;

/// Fingerprints of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    pub content_hash: String,
    pub time_aware_hash: String,
}

impl Fingerprints {
    /// Fingerprint an exchange as of `now`
    pub fn compute(user_input: &str, assistant_response: &str, now: DateTime<Utc>) -> Self {
        let normalized = normalize(user_input, assistant_response);
        Fingerprints {
            content_hash: sha256_hex(&normalized),
            time_aware_hash: sha256_hex(&format!("{}\n{}", time_bucket(now), normalized)),
        }
    }
}

/// Trim, collapse internal whitespace and lowercase each side, joined by a newline
pub fn normalize(user_input: &str, assistant_response: &str) -> String {
    fn clean(text: &str) -> String {
        text.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
    format!("{}\n{}", clean(user_input), clean(assistant_response))
}

/// UTC hour bucket, `YYYY-MM-DDTHH`
pub fn time_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H").to_string()
}

fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Result of a dedup check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// No session, dedup disabled or no recent match
    Proceed,
    /// A recent match already holds everything the candidate carries
    Skip { existing: TurnId },
    /// A recent match exists but the candidate brings new metadata
    NewInformation { matched: TurnId },
}

impl DedupDecision {
    /// Whether the write should be suppressed
    pub fn is_skip(&self) -> bool {
        matches!(self, DedupDecision::Skip { .. })
    }
}

/// Suppresses redundant writes within a session
#[derive(Clone)]
pub struct DedupGuard {
    backend: Arc<dyn TurnBackend>,
    policy: ResiliencePolicy,
    enabled: bool,
    lookback: Duration,
}

impl DedupGuard {
    /// Create a guard reading through `backend` under `policy`
    pub fn new(backend: Arc<dyn TurnBackend>, policy: ResiliencePolicy, config: &DedupConfig) -> Self {
        DedupGuard {
            backend,
            policy,
            enabled: config.enabled,
            lookback: config.lookback,
        }
    }

    /// Lookback window
    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Whether `candidate` should be skipped, looking back `lookback` from `now`
    pub async fn should_skip(
        &self,
        candidate: &NewTurn,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let fingerprints =
            Fingerprints::compute(&candidate.user_input, &candidate.assistant_response, now);
        Ok(self
            .decide(candidate, &fingerprints, lookback, now)
            .await?
            .is_skip())
    }

    /// Check `candidate` against the configured window
    pub async fn check(
        &self,
        candidate: &NewTurn,
        fingerprints: &Fingerprints,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        if !self.enabled {
            return Ok(DedupDecision::Proceed);
        }
        self.decide(candidate, fingerprints, self.lookback, now).await
    }

    async fn decide(
        &self,
        candidate: &NewTurn,
        fingerprints: &Fingerprints,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<DedupDecision> {
        let Some(session_id) = candidate.session_id.as_deref() else {
            debug!("No session id, dedup check skipped");
            return Ok(DedupDecision::Proceed);
        };

        let lookback = chrono::Duration::from_std(lookback)
            .map_err(|e| Error::Config(format!("dedup lookback out of range: {}", e)))?;
        let probe = DuplicateProbe {
            session_id: session_id.to_string(),
            content_hash: fingerprints.content_hash.clone(),
            time_aware_hash: fingerprints.time_aware_hash.clone(),
            since: now - lookback,
        };

        let matches = self
            .policy
            .call("store.find_duplicates", || self.backend.find_duplicates(&probe))
            .await?;

        let Some(latest) = matches.first() else {
            return Ok(DedupDecision::Proceed);
        };

        if let Some(covering) = matches
            .iter()
            .find(|m| candidate.metadata.is_covered_by(&m.metadata))
        {
            info!(
                session_id,
                existing = %covering.id,
                "Duplicate turn within lookback window, skipping write"
            );
            return Ok(DedupDecision::Skip {
                existing: covering.id,
            });
        }

        info!(
            session_id,
            matched = %latest.id,
            "New information overrode dedup"
        );
        Ok(DedupDecision::NewInformation { matched: latest.id })
    }
}
