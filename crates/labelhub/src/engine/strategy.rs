//! Query strategies: pick the next batch of samples to label.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use super::model::{Model, NearestCentroid};
use super::{EngineError, argmax, euclidean};

/// Everything a strategy may look at. All indices are internal ids into
/// `features`/`labels`.
pub struct SelectContext<'a> {
    pub features: &'a [Vec<f64>],
    /// Class index per sample, `None` while unlabeled.
    pub labels: &'a [Option<usize>],
    pub labeled: &'a [usize],
    pub unlabeled: &'a [usize],
    pub model: &'a dyn Model,
}

pub trait QueryStrategy: Send {
    fn name(&self) -> &'static str;

    /// Returns `min(batch_size, unlabeled.len())` distinct unlabeled indices.
    fn select(
        &mut self,
        ctx: &SelectContext<'_>,
        batch_size: usize,
    ) -> Result<Vec<usize>, EngineError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertaintyMeasure {
    #[default]
    LeastConfident,
    Margin,
    Entropy,
}

impl UncertaintyMeasure {
    /// Higher means more uncertain.
    fn score(self, proba: &[f64]) -> f64 {
        match self {
            Self::LeastConfident => 1.0 - proba.iter().copied().fold(0.0, f64::max),
            Self::Margin => {
                let mut sorted = proba.to_vec();
                sorted.sort_by(|a, b| b.total_cmp(a));
                let first = sorted.first().copied().unwrap_or(0.0);
                let second = sorted.get(1).copied().unwrap_or(0.0);
                1.0 - (first - second)
            }
            Self::Entropy => entropy(proba),
        }
    }
}

fn entropy(proba: &[f64]) -> f64 {
    proba
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.ln())
        .sum()
}

fn default_neighbors() -> usize {
    5
}

fn default_committee_size() -> usize {
    3
}

fn default_beta() -> f64 {
    1.0
}

/// Declarative strategy configuration, one variant per strategy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryStrategyConfig {
    #[default]
    Random,
    Uncertainty {
        #[serde(default)]
        measure: UncertaintyMeasure,
    },
    GraphDensity {
        #[serde(default = "default_neighbors")]
        neighbors: usize,
    },
    Qbc {
        #[serde(default = "default_committee_size")]
        committee_size: usize,
    },
    /// Binary classification only.
    Bmdr {
        #[serde(default = "default_beta")]
        beta: f64,
    },
}

impl QueryStrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Uncertainty { .. } => "uncertainty",
            Self::GraphDensity { .. } => "graph_density",
            Self::Qbc { .. } => "qbc",
            Self::Bmdr { .. } => "bmdr",
        }
    }

    /// Exact number of classes the strategy supports, if restricted.
    pub fn required_classes(&self) -> Option<usize> {
        match self {
            Self::Bmdr { .. } => Some(2),
            _ => None,
        }
    }

    /// Checks strategy parameters; returns a human readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::GraphDensity { neighbors: 0 } => {
                Err("graph_density needs at least one neighbor".to_string())
            }
            Self::Qbc { committee_size } if *committee_size < 2 => Err(format!(
                "qbc needs a committee of at least 2 members, got {committee_size}"
            )),
            Self::Bmdr { beta } if !beta.is_finite() || *beta < 0.0 => {
                Err(format!("bmdr beta must be a non-negative number, got {beta}"))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self, seed: u64) -> Box<dyn QueryStrategy> {
        match *self {
            Self::Random => Box::new(RandomSampling {
                rng: StdRng::seed_from_u64(seed),
            }),
            Self::Uncertainty { measure } => Box::new(UncertaintySampling { measure }),
            Self::GraphDensity { neighbors } => Box::new(GraphDensity { neighbors }),
            Self::Qbc { committee_size } => Box::new(QueryByCommittee {
                committee_size,
                rng: StdRng::seed_from_u64(seed),
            }),
            Self::Bmdr { beta } => Box::new(Bmdr { beta }),
        }
    }
}

/// Highest-scoring `batch_size` candidates, stable on ties.
fn top_k(candidates: &[usize], scores: Vec<f64>, batch_size: usize) -> Vec<usize> {
    let mut ranked: Vec<(usize, f64)> = candidates.iter().copied().zip(scores).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
        .into_iter()
        .take(batch_size)
        .map(|(idx, _)| idx)
        .collect()
}

fn unlabeled_rows(ctx: &SelectContext<'_>) -> Vec<Vec<f64>> {
    ctx.unlabeled
        .iter()
        .map(|&idx| ctx.features[idx].clone())
        .collect()
}

/// `1 / (1 + mean distance to the k nearest other samples)`.
fn density(features: &[Vec<f64>], idx: usize, k: usize) -> f64 {
    let mut distances: Vec<f64> = features
        .iter()
        .enumerate()
        .filter(|(other, _)| *other != idx)
        .map(|(_, row)| euclidean(&features[idx], row))
        .collect();
    if distances.is_empty() {
        return 1.0;
    }
    distances.sort_by(f64::total_cmp);
    let k = k.min(distances.len());
    let mean = distances[..k].iter().sum::<f64>() / k as f64;
    1.0 / (1.0 + mean)
}

struct RandomSampling {
    rng: StdRng,
}

impl QueryStrategy for RandomSampling {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(
        &mut self,
        ctx: &SelectContext<'_>,
        batch_size: usize,
    ) -> Result<Vec<usize>, EngineError> {
        Ok(ctx
            .unlabeled
            .choose_multiple(&mut self.rng, batch_size)
            .copied()
            .collect())
    }
}

struct UncertaintySampling {
    measure: UncertaintyMeasure,
}

impl QueryStrategy for UncertaintySampling {
    fn name(&self) -> &'static str {
        "uncertainty"
    }

    fn select(
        &mut self,
        ctx: &SelectContext<'_>,
        batch_size: usize,
    ) -> Result<Vec<usize>, EngineError> {
        if ctx.unlabeled.is_empty() {
            return Ok(Vec::new());
        }
        let proba = ctx.model.predict_proba(&unlabeled_rows(ctx))?;
        let scores = proba.iter().map(|p| self.measure.score(p)).collect();
        Ok(top_k(ctx.unlabeled, scores, batch_size))
    }
}

struct GraphDensity {
    neighbors: usize,
}

impl QueryStrategy for GraphDensity {
    fn name(&self) -> &'static str {
        "graph_density"
    }

    fn select(
        &mut self,
        ctx: &SelectContext<'_>,
        batch_size: usize,
    ) -> Result<Vec<usize>, EngineError> {
        let scores = ctx
            .unlabeled
            .iter()
            .map(|&idx| density(ctx.features, idx, self.neighbors))
            .collect();
        Ok(top_k(ctx.unlabeled, scores, batch_size))
    }
}

/// Committee of nearest-centroid models trained on bootstrap resamples of the
/// labeled pool, scored by vote entropy.
struct QueryByCommittee {
    committee_size: usize,
    rng: StdRng,
}

impl QueryStrategy for QueryByCommittee {
    fn name(&self) -> &'static str {
        "qbc"
    }

    fn select(
        &mut self,
        ctx: &SelectContext<'_>,
        batch_size: usize,
    ) -> Result<Vec<usize>, EngineError> {
        if ctx.unlabeled.is_empty() {
            return Ok(Vec::new());
        }
        let training: Vec<(usize, usize)> = ctx
            .labeled
            .iter()
            .filter_map(|&idx| ctx.labels[idx].map(|class| (idx, class)))
            .collect();
        if training.is_empty() {
            return Err(EngineError::EmptyTrainingSet);
        }

        let n_classes = ctx.model.n_classes();
        let rows = unlabeled_rows(ctx);
        let mut votes = vec![vec![0usize; n_classes]; rows.len()];
        for _ in 0..self.committee_size {
            let (x, y): (Vec<Vec<f64>>, Vec<usize>) = (0..training.len())
                .filter_map(|_| training.choose(&mut self.rng))
                .map(|&(idx, class)| (ctx.features[idx].clone(), class))
                .unzip();
            let mut member = NearestCentroid::new(n_classes);
            member.fit(&x, &y)?;
            for (row_votes, proba) in votes.iter_mut().zip(member.predict_proba(&rows)?) {
                row_votes[argmax(&proba)] += 1;
            }
        }

        let scores = votes
            .iter()
            .map(|row| {
                let shares: Vec<f64> = row
                    .iter()
                    .map(|&v| v as f64 / self.committee_size as f64)
                    .collect();
                entropy(&shares)
            })
            .collect();
        Ok(top_k(ctx.unlabeled, scores, batch_size))
    }
}

/// Binary margin uncertainty plus a density term weighted by `beta`.
struct Bmdr {
    beta: f64,
}

impl Bmdr {
    const NEIGHBORS: usize = 5;
}

impl QueryStrategy for Bmdr {
    fn name(&self) -> &'static str {
        "bmdr"
    }

    fn select(
        &mut self,
        ctx: &SelectContext<'_>,
        batch_size: usize,
    ) -> Result<Vec<usize>, EngineError> {
        if ctx.model.n_classes() != 2 {
            return Err(EngineError::ClassCount {
                strategy: "bmdr",
                required: 2,
                actual: ctx.model.n_classes(),
            });
        }
        if ctx.unlabeled.is_empty() {
            return Ok(Vec::new());
        }
        let proba = ctx.model.predict_proba(&unlabeled_rows(ctx))?;
        let scores = ctx
            .unlabeled
            .iter()
            .zip(&proba)
            .map(|(&idx, p)| {
                let margin = 1.0 - (p[0] - p[1]).abs();
                margin + self.beta * density(ctx.features, idx, Self::NEIGHBORS)
            })
            .collect();
        Ok(top_k(ctx.unlabeled, scores, batch_size))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct Pool {
        features: Vec<Vec<f64>>,
        labels: Vec<Option<usize>>,
        labeled: Vec<usize>,
        unlabeled: Vec<usize>,
        model: Box<dyn Model>,
    }

    impl Pool {
        /// Two clusters at 0 and 10 plus one point halfway between them.
        fn new(n_classes: usize) -> Self {
            let features = vec![
                vec![0.0],
                vec![0.2],
                vec![0.4],
                vec![10.0],
                vec![10.2],
                vec![10.4],
                vec![5.0],
                vec![0.3],
                vec![10.3],
            ];
            let labels = vec![
                Some(0),
                Some(0),
                None,
                Some(1),
                Some(1),
                None,
                None,
                None,
                None,
            ];
            let labeled = vec![0, 1, 3, 4];
            let unlabeled = vec![2, 5, 6, 7, 8];

            let mut model: Box<dyn Model> = Box::new(NearestCentroid::new(n_classes));
            let x: Vec<Vec<f64>> = labeled.iter().map(|&i| features[i].clone()).collect();
            let y: Vec<usize> = labeled.iter().map(|&i| labels[i].unwrap()).collect();
            model.fit(&x, &y).unwrap();

            Self {
                features,
                labels,
                labeled,
                unlabeled,
                model,
            }
        }

        fn ctx(&self) -> SelectContext<'_> {
            SelectContext {
                features: &self.features,
                labels: &self.labels,
                labeled: &self.labeled,
                unlabeled: &self.unlabeled,
                model: self.model.as_ref(),
            }
        }
    }

    fn assert_valid_batch(pool: &Pool, selected: &[usize], expected_len: usize) {
        assert_eq!(selected.len(), expected_len);
        let distinct: HashSet<_> = selected.iter().collect();
        assert_eq!(distinct.len(), selected.len());
        assert!(selected.iter().all(|idx| pool.unlabeled.contains(idx)));
    }

    #[test]
    fn every_strategy_returns_distinct_unlabeled_indices() {
        let pool = Pool::new(2);
        let configs = [
            QueryStrategyConfig::Random,
            QueryStrategyConfig::Uncertainty {
                measure: UncertaintyMeasure::Entropy,
            },
            QueryStrategyConfig::GraphDensity { neighbors: 2 },
            QueryStrategyConfig::Qbc { committee_size: 4 },
            QueryStrategyConfig::Bmdr { beta: 0.5 },
        ];
        for config in configs {
            let mut strategy = config.build(7);
            assert_eq!(strategy.name(), config.name());

            let selected = strategy.select(&pool.ctx(), 3).unwrap();
            assert_valid_batch(&pool, &selected, 3);

            let all = strategy.select(&pool.ctx(), 50).unwrap();
            assert_valid_batch(&pool, &all, pool.unlabeled.len());
        }
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let mut pool = Pool::new(2);
        pool.unlabeled.clear();
        for config in [
            QueryStrategyConfig::Random,
            QueryStrategyConfig::Uncertainty {
                measure: UncertaintyMeasure::Margin,
            },
            QueryStrategyConfig::Qbc { committee_size: 2 },
        ] {
            assert!(config.build(1).select(&pool.ctx(), 5).unwrap().is_empty());
        }
    }

    #[test]
    fn uncertainty_picks_the_point_between_clusters() {
        let pool = Pool::new(2);
        for measure in [
            UncertaintyMeasure::LeastConfident,
            UncertaintyMeasure::Margin,
            UncertaintyMeasure::Entropy,
        ] {
            let mut strategy = QueryStrategyConfig::Uncertainty { measure }.build(0);
            assert_eq!(strategy.select(&pool.ctx(), 1).unwrap(), vec![6], "{measure:?}");
        }
    }

    #[test]
    fn graph_density_avoids_the_outlier() {
        let pool = Pool::new(2);
        let mut strategy = QueryStrategyConfig::GraphDensity { neighbors: 2 }.build(0);
        let selected = strategy.select(&pool.ctx(), 4).unwrap();
        assert!(!selected.contains(&6));
    }

    #[test]
    fn random_is_reproducible_for_a_seed() {
        let pool = Pool::new(2);
        let first = QueryStrategyConfig::Random.build(42).select(&pool.ctx(), 3).unwrap();
        let second = QueryStrategyConfig::Random.build(42).select(&pool.ctx(), 3).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bmdr_rejects_multiclass_models() {
        let pool = Pool::new(3);
        let err = QueryStrategyConfig::Bmdr { beta: 1.0 }
            .build(0)
            .select(&pool.ctx(), 1)
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::ClassCount {
                strategy: "bmdr",
                required: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn qbc_needs_labeled_samples() {
        let mut pool = Pool::new(2);
        pool.labeled.clear();
        let err = QueryStrategyConfig::Qbc { committee_size: 3 }
            .build(0)
            .select(&pool.ctx(), 1)
            .unwrap_err();
        assert_eq!(err, EngineError::EmptyTrainingSet);
    }

    #[test]
    fn config_validation() {
        assert!(QueryStrategyConfig::Random.validate().is_ok());
        assert!(
            QueryStrategyConfig::GraphDensity { neighbors: 0 }
                .validate()
                .is_err()
        );
        assert!(
            QueryStrategyConfig::Qbc { committee_size: 1 }
                .validate()
                .is_err()
        );
        assert!(QueryStrategyConfig::Bmdr { beta: -1.0 }.validate().is_err());
        assert_eq!(
            QueryStrategyConfig::Bmdr { beta: 1.0 }.required_classes(),
            Some(2)
        );
        assert_eq!(QueryStrategyConfig::Random.required_classes(), None);
    }

    #[test]
    fn config_is_tagged_by_type() {
        insta::assert_json_snapshot!(
            QueryStrategyConfig::Uncertainty { measure: UncertaintyMeasure::Margin },
            @r#"
        {
          "type": "uncertainty",
          "measure": "margin"
        }
        "#
        );

        let parsed: QueryStrategyConfig =
            serde_json::from_str(r#"{"type": "graph_density"}"#).unwrap();
        assert_eq!(parsed, QueryStrategyConfig::GraphDensity { neighbors: 5 });

        let parsed: QueryStrategyConfig = serde_json::from_str(r#"{"type": "qbc"}"#).unwrap();
        assert_eq!(parsed, QueryStrategyConfig::Qbc { committee_size: 3 });
    }
}
