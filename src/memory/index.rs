//! Similarity index: cosine ranking and an IVF-style approximate index
//!
//! Backends produce scored candidates; [`rank`] applies the floor, orders by
//! descending similarity with recency as the tie-break and truncates. The
//! [`IvfIndex`] narrows the candidate set for approximate search. Candidates it
//! yields are still scored exactly and ranked here, so every approximate hit
//! carries its exact score and clears the floor. Only recall suffers: with a
//! tight limit, a probed turn may stand in for a better one in an unprobed list.

use std::collections::HashMap;

use crate::core::types::{ScoredTurn, TurnId};

/// Similarities closer than this are considered equal
pub const SCORE_EPSILON: f32 = 1e-6;

/// Cosine similarity `(a·b)/(|a||b|)`; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// Cosine distance `1 - similarity`
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

// Quantize so epsilon ties still form a total order for sorting.
fn score_bucket(score: f32) -> i64 {
    (score as f64 / SCORE_EPSILON as f64).round() as i64
}

/// Drop candidates under `floor`, order them and keep at most `limit`.
pub fn rank(mut candidates: Vec<ScoredTurn>, limit: usize, floor: f32) -> Vec<ScoredTurn> {
    candidates.retain(|c| c.score >= floor);
    candidates.sort_by(|a, b| {
        score_bucket(b.score)
            .cmp(&score_bucket(a.score))
            .then_with(|| b.turn.created_at.cmp(&a.turn.created_at))
    });
    candidates.truncate(limit);
    candidates
}

/// Inverted-file index over turn embeddings.
///
/// The first `lists` vectors seed the centroids; later vectors join the list of
/// their most similar centroid. A query probes the `probes` closest lists.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    lists: usize,
    centroids: Vec<Vec<f32>>,
    members: Vec<Vec<TurnId>>,
    assignment: HashMap<TurnId, usize>,
}

impl IvfIndex {
    /// Create an empty index with at most `lists` inverted lists
    pub fn new(lists: usize) -> Self {
        IvfIndex {
            lists: lists.max(1),
            centroids: Vec::new(),
            members: Vec::new(),
            assignment: HashMap::new(),
        }
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.assignment.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.assignment.is_empty()
    }

    /// Index a vector under `id`
    pub fn insert(&mut self, id: TurnId, embedding: &[f32]) {
        if self.assignment.contains_key(&id) {
            return;
        }

        let list = if self.centroids.len() < self.lists {
            self.centroids.push(embedding.to_vec());
            self.members.push(Vec::new());
            self.centroids.len() - 1
        } else {
            self.nearest_lists(embedding, 1).first().copied().unwrap_or(0)
        };

        self.members[list].push(id);
        self.assignment.insert(id, list);
    }

    /// Drop `id` from its list
    pub fn remove(&mut self, id: &TurnId) {
        if let Some(list) = self.assignment.remove(id) {
            self.members[list].retain(|m| m != id);
        }
    }

    /// Ids in the `probes` lists closest to `query`
    pub fn candidates(&self, query: &[f32], probes: usize) -> Vec<TurnId> {
        self.nearest_lists(query, probes.max(1))
            .into_iter()
            .flat_map(|list| self.members[list].iter().copied())
            .collect()
    }

    fn nearest_lists(&self, query: &[f32], n: usize) -> Vec<usize> {
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(query, c)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.into_iter().take(n).map(|(i, _)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{NewTurn, Turn};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn scored(embedding: Vec<f32>, query: &[f32], age_secs: i64) -> ScoredTurn {
        let turn = Turn::from_new(
            NewTurn::new("q", "a", embedding),
            Utc::now() - Duration::seconds(age_secs),
        );
        let score = cosine_similarity(&turn.embedding, query);
        ScoredTurn { turn, score }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_distance(&[2.0, 0.0], &[5.0, 0.0])).abs() < 1e-6);
    }

    #[test]
    fn test_rank_orders_by_similarity() {
        let query = [0.9, 0.1, 0.0];
        let candidates = vec![
            scored(vec![0.0, 0.0, 1.0], &query, 0),
            scored(vec![0.0, 1.0, 0.0], &query, 0),
            scored(vec![1.0, 0.0, 0.0], &query, 0),
        ];

        let ranked = rank(candidates, 2, 0.0);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].turn.embedding, vec![1.0, 0.0, 0.0]);
        assert_eq!(ranked[1].turn.embedding, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_rank_breaks_ties_by_recency() {
        let query = [1.0, 0.0];
        let older = scored(vec![1.0, 0.0], &query, 600);
        let newer = scored(vec![2.0, 0.0], &query, 5);
        let newer_id = newer.turn.id;

        let ranked = rank(vec![older, newer], 10, 0.0);
        assert_eq!(ranked[0].turn.id, newer_id);
    }

    #[test]
    fn test_rank_applies_floor() {
        let query = [1.0, 0.0];
        let ranked = rank(
            vec![scored(vec![1.0, 0.0], &query, 0), scored(vec![1.0, 1.0], &query, 0)],
            10,
            0.8,
        );
        assert_eq!(ranked.len(), 1);
        assert!(ranked[0].score >= 0.8);
    }

    #[test]
    fn test_ivf_probes_nearest_list() {
        let mut index = IvfIndex::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        index.insert(a, &[1.0, 0.0]);
        index.insert(b, &[0.0, 1.0]);
        index.insert(c, &[0.9, 0.1]);

        let near_x = index.candidates(&[1.0, 0.05], 1);
        assert!(near_x.contains(&a) && near_x.contains(&c));
        assert!(!near_x.contains(&b));
        assert_eq!(index.candidates(&[1.0, 0.05], 2).len(), 3);

        index.remove(&c);
        assert_eq!(index.len(), 2);
        assert!(!index.candidates(&[1.0, 0.0], 2).contains(&c));
    }
}
