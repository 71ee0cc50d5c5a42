//! Battle preparation: the labeled-only dataset both sides train on and the
//! classification-boundary raster they predict on.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AlBattleConfig;
use crate::dataset::Dataset;

/// Input shared by both sides of a battle.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBattle {
    pub dataset: Dataset,
    pub cb_sample: Vec<Vec<f64>>,
}

/// Restricts `dataset` to its labeled samples and draws
/// `nbr_of_random_sample` raster points uniformly inside the bounding box of
/// those samples. Deterministic for a given `random_seed`.
pub fn prepare_battle(config: &AlBattleConfig, dataset: &Dataset) -> PreparedBattle {
    let mut dataset = dataset.clone();
    dataset.samples.retain(|s| s.label.is_some());

    let width = dataset.feature_width();
    let mut bounds = vec![(f64::INFINITY, f64::NEG_INFINITY); width];
    for sample in &dataset.samples {
        for (bound, value) in bounds.iter_mut().zip(&sample.features) {
            bound.0 = bound.0.min(*value);
            bound.1 = bound.1.max(*value);
        }
    }

    let mut rng = StdRng::seed_from_u64(config.random_seed);
    let points = config.plot_config.classification_boundaries.nbr_of_random_sample;
    let cb_sample = (0..points)
        .map(|_| {
            bounds
                .iter()
                .map(|&(lo, hi)| {
                    if lo < hi {
                        rng.random_range(lo..=hi)
                    } else if lo.is_finite() {
                        lo
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();

    tracing::debug!(
        dataset_id = %dataset.id,
        samples = dataset.samples.len(),
        points,
        "Battle prepared"
    );
    PreparedBattle { dataset, cb_sample }
}
