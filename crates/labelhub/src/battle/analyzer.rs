//! Side-by-side comparison of a finished battle.

use std::collections::HashSet;
use std::sync::OnceLock;

use serde::Serialize;

use super::results::{ExperimentResults, MetricScores};
use crate::bridge::protocol::Side;
use crate::config::AlBattleConfig;
use crate::dataset::{DatasetId, SampleId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationMetrics {
    pub iteration: usize,
    /// Indexed by side; `None` once that side has stopped.
    pub scores: [Option<MetricScores>; 2],
    pub percentage_labeled: [Option<f64>; 2],
    pub time: [Option<f64>; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BattleMetrics {
    pub iterations: Vec<IterationMetrics>,
    /// Jaccard index of the two sides' cumulative query sets per iteration.
    pub percentage_similar: Vec<f64>,
}

/// A finished battle. Built once when both sides completed, or when loading
/// a persisted battle.
#[derive(Debug)]
pub struct BattleAnalyzer {
    config: AlBattleConfig,
    dataset_id: DatasetId,
    cb_sample: Vec<Vec<f64>>,
    results: [ExperimentResults; 2],
    metrics: OnceLock<BattleMetrics>,
}

impl BattleAnalyzer {
    pub fn new(
        config: AlBattleConfig,
        dataset_id: DatasetId,
        cb_sample: Vec<Vec<f64>>,
        results: [ExperimentResults; 2],
    ) -> Self {
        Self {
            config,
            dataset_id,
            cb_sample,
            results,
            metrics: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &AlBattleConfig {
        &self.config
    }

    pub fn dataset_id(&self) -> DatasetId {
        self.dataset_id
    }

    pub fn cb_sample(&self) -> &[Vec<f64>] {
        &self.cb_sample
    }

    pub fn results(&self, side: Side) -> &ExperimentResults {
        &self.results[side.index()]
    }

    pub fn metrics(&self) -> &BattleMetrics {
        self.metrics.get_or_init(|| self.compute())
    }

    fn compute(&self) -> BattleMetrics {
        let [one, two] = &self.results;
        let len = one.iterations().max(two.iterations());
        let pick = |i: usize| {
            self.results.each_ref().map(|r| r.meta_data.get(i).map(|m| m.percentage_labeled))
        };

        let iterations = (0..len)
            .map(|i| IterationMetrics {
                iteration: i,
                scores: self.results.each_ref().map(|r| r.metric_scores.get(i).cloned()),
                percentage_labeled: pick(i),
                time: self.results.each_ref().map(|r| r.meta_data.get(i).map(|m| m.time)),
            })
            .collect();

        let mut queried: [HashSet<SampleId>; 2] = Default::default();
        let percentage_similar = (0..len)
            .map(|i| {
                for (set, results) in queried.iter_mut().zip(&self.results) {
                    if let Some(meta) = results.meta_data.get(i) {
                        set.extend(meta.sample_ids.iter().copied());
                    }
                }
                let union = queried[0].union(&queried[1]).count();
                if union == 0 {
                    1.0
                } else {
                    queried[0].intersection(&queried[1]).count() as f64 / union as f64
                }
            })
            .collect();

        BattleMetrics {
            iterations,
            percentage_similar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::results::fixtures;
    use crate::config::ExperimentConfig;

    fn analyzer(one: &[&[u64]], two: &[&[u64]]) -> BattleAnalyzer {
        BattleAnalyzer::new(
            AlBattleConfig::new(ExperimentConfig::default(), ExperimentConfig::default()),
            DatasetId(1),
            vec![vec![0.0, 0.0]],
            [fixtures::with_batches(one), fixtures::with_batches(two)],
        )
    }

    #[test]
    fn similarity_uses_cumulative_query_sets() {
        let analyzer = analyzer(&[&[1, 2], &[3, 4]], &[&[1, 3], &[2, 5]]);
        let metrics = analyzer.metrics();

        // {1,2} vs {1,3}: 1/3; {1,2,3,4} vs {1,2,3,5}: 3/5
        assert_eq!(metrics.percentage_similar.len(), 2);
        assert!((metrics.percentage_similar[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((metrics.percentage_similar[1] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn shorter_side_is_padded() {
        let analyzer = analyzer(&[&[1], &[2], &[3]], &[&[1]]);
        let metrics = analyzer.metrics();

        assert_eq!(metrics.iterations.len(), 3);
        assert!(metrics.iterations[2].scores[0].is_some());
        assert!(metrics.iterations[2].scores[1].is_none());
        assert_eq!(metrics.iterations[2].percentage_labeled[1], None);
        assert_eq!(metrics.percentage_similar.len(), 3);
        assert!(metrics.percentage_similar.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn empty_battle_is_fully_similar() {
        let analyzer = analyzer(&[&[]], &[&[]]);
        assert_eq!(analyzer.metrics().percentage_similar, vec![1.0]);
    }

    #[test]
    fn metrics_are_memoized() {
        let analyzer = analyzer(&[&[1]], &[&[2]]);
        assert!(std::ptr::eq(analyzer.metrics(), analyzer.metrics()));
        assert_eq!(analyzer.results(Side::Two).meta_data[0].sample_ids, vec![SampleId(2)]);
    }
}
