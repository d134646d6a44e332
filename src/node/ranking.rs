//! Best-variant dispatch.
//!
//! Several node variants can often describe the same bytes: a load command is
//! always a "generic" load command, and usually also something more specific.
//! A [`Registry`] holds explicitly registered [`Candidate`]s. Each one scores
//! the raw input (0 = cannot represent it, larger = more specific) and the
//! highest score is built.
//!
//! Equal scores are resolved by registration order: the candidate registered
//! first wins. Callers that want to override a built-in variant register one
//! that scores higher.

use std::fmt;

use crate::error::{Error, Result};

/// One registered variant.
pub struct Candidate<P, T> {
    /// Name used in logs and diagnostics
    pub name: &'static str,
    /// Scores the input; 0 rejects it
    pub rank: fn(&P) -> u32,
    /// Builds the variant from the input
    pub build: fn(&P) -> Result<T>,
}

impl<P, T> Candidate<P, T> {
    /// Creates a candidate.
    pub const fn new(name: &'static str, rank: fn(&P) -> u32, build: fn(&P) -> Result<T>) -> Self {
        Self { name, rank, build }
    }
}

impl<P, T> Clone for Candidate<P, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, T> Copy for Candidate<P, T> {}

impl<P, T> fmt::Debug for Candidate<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate").field("name", &self.name).finish()
    }
}

/// An ordered set of candidates for one kind of input.
pub struct Registry<P, T> {
    what: &'static str,
    candidates: Vec<Candidate<P, T>>,
}

impl<P, T> Registry<P, T> {
    /// Creates an empty registry. `what` names the input kind in errors.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            candidates: Vec::new(),
        }
    }

    /// Appends a candidate.
    pub fn register(&mut self, candidate: Candidate<P, T>) -> &mut Self {
        self.candidates.push(candidate);
        self
    }

    /// Returns the registered candidates in registration order.
    pub fn candidates(&self) -> &[Candidate<P, T>] {
        &self.candidates
    }

    /// Returns the highest-scoring candidate and its score.
    pub fn best(&self, input: &P) -> Option<(&Candidate<P, T>, u32)> {
        let mut best: Option<(&Candidate<P, T>, u32)> = None;
        for candidate in &self.candidates {
            let score = (candidate.rank)(input);
            if score == 0 {
                continue;
            }
            // Strictly greater keeps the earliest registration on ties.
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }
        best
    }

    /// Builds the highest-scoring variant.
    pub fn instantiate(&self, input: &P) -> Result<T> {
        let (candidate, score) = self
            .best(input)
            .ok_or(Error::NoMatchingVariant { what: self.what })?;
        tracing::trace!("{}: selected '{}' (score {})", self.what, candidate.name, score);
        (candidate.build)(input)
    }
}

impl<P, T> Clone for Registry<P, T> {
    fn clone(&self) -> Self {
        Self {
            what: self.what,
            candidates: self.candidates.clone(),
        }
    }
}

impl<P, T> fmt::Debug for Registry<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("what", &self.what)
            .field(
                "candidates",
                &self.candidates.iter().map(|c| c.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Shape {
        Generic,
        Square,
        Custom,
    }

    fn registry() -> Registry<u32, Shape> {
        let mut registry = Registry::new("shape");
        registry
            .register(Candidate::new("generic", |_| 1, |_| Ok(Shape::Generic)))
            .register(Candidate::new(
                "square",
                |n| if n % 4 == 0 { 10 } else { 0 },
                |_| Ok(Shape::Square),
            ));
        registry
    }

    #[test]
    fn test_highest_score_wins() {
        let registry = registry();
        assert_eq!(registry.instantiate(&8).unwrap(), Shape::Square);
        assert_eq!(registry.instantiate(&7).unwrap(), Shape::Generic);
    }

    #[test]
    fn test_ties_go_to_first_registered() {
        let mut registry = registry();
        registry.register(Candidate::new("custom", |_| 10, |_| Ok(Shape::Custom)));
        assert_eq!(registry.instantiate(&8).unwrap(), Shape::Square);
        assert_eq!(registry.instantiate(&7).unwrap(), Shape::Custom);

        registry.register(Candidate::new("override", |_| 11, |_| Ok(Shape::Generic)));
        assert_eq!(registry.instantiate(&8).unwrap(), Shape::Generic);
    }

    #[test]
    fn test_no_candidate() {
        let mut registry: Registry<u32, Shape> = Registry::new("shape");
        registry.register(Candidate::new("never", |_| 0, |_| Ok(Shape::Generic)));
        let err = registry.instantiate(&1).unwrap_err();
        assert!(matches!(err, Error::NoMatchingVariant { what: "shape" }));
    }
}
