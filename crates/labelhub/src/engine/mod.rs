//! Learning engine contracts.
//!
//! The orchestration layer only needs `fit`/`predict_proba` from a model and
//! `select` from a query strategy. A handful of small built-in implementations
//! keep worker and experiment processes self-contained.

pub mod metrics;
pub mod model;
pub mod strategy;

pub use model::{GaussianNaiveBayes, Model, ModelKind, NearestCentroid};
pub use strategy::{QueryStrategy, QueryStrategyConfig, SelectContext, UncertaintyMeasure};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("model is not fitted")]
    NotFitted,
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("expected {expected} features, got {actual}")]
    FeatureWidth { expected: usize, actual: usize },
    #[error("{features} feature rows but {targets} targets")]
    LengthMismatch { features: usize, targets: usize },
    #[error("class index {class} out of range for {classes} classes")]
    ClassOutOfRange { class: usize, classes: usize },
    #[error("{strategy} requires exactly {required} classes, got {actual}")]
    ClassCount {
        strategy: &'static str,
        required: usize,
        actual: usize,
    },
}

/// Index of the largest value. Ties go to the lowest index.
pub fn argmax(row: &[f64]) -> usize {
    let mut best = 0;
    for (idx, value) in row.iter().enumerate() {
        if *value > row[best] {
            best = idx;
        }
    }
    best
}

pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[0.9]), 0);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn euclidean_distance() {
        assert_eq!(euclidean(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(euclidean(&[1.5], &[1.5]), 0.0);
    }
}
