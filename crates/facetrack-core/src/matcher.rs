//! Embedding comparison against a set of references.

use crate::types::Embedding;

/// Default maximum Euclidean distance for two embeddings to be the same face.
/// Lower is stricter.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

/// A reference accepted by a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<K> {
    /// Caller-supplied key of the matched reference.
    pub key: K,
    pub distance: f32,
}

/// Strategy for comparing a candidate embedding against keyed references.
pub trait Matcher {
    fn distance(&self, candidate: &Embedding, reference: &Embedding) -> f32;

    /// Return the first reference, in iteration order, whose distance to
    /// `candidate` is within `tolerance`.
    ///
    /// When the tolerance windows of several references overlap, the earlier
    /// one wins even if a later one is closer.
    fn first_match<'a, K, I>(&self, candidate: &Embedding, references: I, tolerance: f32) -> Option<Match<K>>
    where
        I: IntoIterator<Item = (K, &'a Embedding)>,
    {
        references.into_iter().find_map(|(key, reference)| {
            let distance = self.distance(candidate, reference);
            (distance <= tolerance).then_some(Match { key, distance })
        })
    }
}

/// Euclidean distance matcher, the convention of dlib-style face encoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, candidate: &Embedding, reference: &Embedding) -> f32 {
        candidate.euclidean_distance(reference)
    }
}

/// Index of the first reference within `tolerance` of `candidate`.
pub fn best_match<'a, I>(candidate: &Embedding, references: I, tolerance: f32) -> Option<usize>
where
    I: IntoIterator<Item = &'a Embedding>,
{
    EuclideanMatcher
        .first_match(candidate, references.into_iter().enumerate(), tolerance)
        .map(|m| m.key)
}
