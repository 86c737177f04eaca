use crate::config::Number;
use crate::search::RetrievalResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    RefuseEmpty,
    RefuseLowConfidence,
}

/// Refuses when even the closest chunk is too far from the query.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceGate {
    threshold: Number,
}

impl ConfidenceGate {
    pub fn new(threshold: Number) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Number {
        self.threshold
    }

    pub fn decide(&self, result: &RetrievalResult) -> GateDecision {
        let Some(min_distance) = result.min_distance() else {
            return GateDecision::RefuseEmpty;
        };
        tracing::info!(
            distances = ?result.distances(),
            min_distance,
            threshold = self.threshold,
            "confidence gate"
        );
        // NaN never counts as confident
        if !min_distance.is_finite() || min_distance > self.threshold {
            GateDecision::RefuseLowConfidence
        } else {
            GateDecision::Proceed
        }
    }
}
