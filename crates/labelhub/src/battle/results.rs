//! Immutable outcome of one finished battle side.

use serde::{Deserialize, Serialize};

use crate::dataset::{LabelId, SampleId};

/// Per-iteration bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    /// Fit time in seconds.
    pub time: f64,
    /// `labeled / (labeled + unlabeled)` after this iteration's query.
    pub percentage_labeled: f64,
    /// Samples queried in this iteration.
    pub sample_ids: Vec<SampleId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScores {
    pub accuracy: f64,
    pub f1: f64,
    pub recall: f64,
    pub precision: f64,
    pub f1_auc: f64,
    /// Mean distance of the query batch to the labeled pool before the query.
    pub avg_distance_labeled: f64,
    /// Mean distance of the query batch to the unlabeled pool before the query.
    pub avg_distance_unlabeled: f64,
}

/// Everything one experiment produced. Created once at completion.
///
/// Prediction tables are indexed `[iteration][row][class]`; rows follow
/// `test_sample_ids` for `raw_predictions` and the classification-boundary
/// raster for `cb_predictions`. Class columns follow `classes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub raw_predictions: Vec<Vec<Vec<f64>>>,
    pub cb_predictions: Vec<Vec<Vec<f64>>>,
    pub metric_scores: Vec<MetricScores>,
    pub initially_labeled: Vec<SampleId>,
    pub test_sample_ids: Vec<SampleId>,
    /// Class column of the true label, per test sample.
    pub correct_label_as_idx: Vec<usize>,
    pub meta_data: Vec<MetaData>,
    pub classes: Vec<LabelId>,
}

impl ExperimentResults {
    pub fn iterations(&self) -> usize {
        self.meta_data.len()
    }

    /// Samples queried up to and including `iteration`.
    pub fn queried_until(&self, iteration: usize) -> impl Iterator<Item = SampleId> + '_ {
        self.meta_data
            .iter()
            .take(iteration + 1)
            .flat_map(|m| m.sample_ids.iter().copied())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Results whose iterations queried exactly `batches`.
    pub fn with_batches(batches: &[&[u64]]) -> ExperimentResults {
        let total: usize = batches.iter().map(|b| b.len()).sum();
        let mut labeled = 0;
        let meta_data = batches
            .iter()
            .map(|batch| {
                labeled += batch.len();
                MetaData {
                    time: 0.001,
                    percentage_labeled: labeled as f64 / total.max(1) as f64,
                    sample_ids: batch.iter().copied().map(SampleId).collect(),
                }
            })
            .collect();
        let metric_scores = batches
            .iter()
            .map(|_| MetricScores {
                accuracy: 1.0,
                f1: 1.0,
                recall: 1.0,
                precision: 1.0,
                f1_auc: 0.0,
                avg_distance_labeled: 0.0,
                avg_distance_unlabeled: 0.0,
            })
            .collect();
        ExperimentResults {
            raw_predictions: vec![vec![vec![1.0, 0.0]]; batches.len()],
            cb_predictions: vec![vec![vec![0.5, 0.5]]; batches.len()],
            metric_scores,
            initially_labeled: vec![SampleId(1)],
            test_sample_ids: vec![SampleId(2)],
            correct_label_as_idx: vec![0],
            meta_data,
            classes: vec![LabelId(1), LabelId(2)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queried_until_is_cumulative() {
        let results = fixtures::with_batches(&[&[10, 11], &[12], &[13]]);
        assert_eq!(results.iterations(), 3);
        assert_eq!(
            results.queried_until(1).collect::<Vec<_>>(),
            vec![SampleId(10), SampleId(11), SampleId(12)]
        );
        assert_eq!(results.queried_until(9).count(), 4);
    }

    #[test]
    fn results_survive_json() {
        let results = fixtures::with_batches(&[&[10], &[11]]);
        let json = serde_json::to_string(&results).unwrap();
        let back: ExperimentResults = serde_json::from_str(&json).unwrap();
        assert_eq!(back, results);
    }
}
