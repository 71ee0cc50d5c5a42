//! Classifiers usable by workers and experiments.

use serde::{Deserialize, Serialize};

use super::{EngineError, argmax, euclidean};

/// A probabilistic classifier over dense feature rows.
///
/// Targets are class indices in `0..n_classes()`. Probability rows always have
/// `n_classes()` entries; classes absent from the training data get 0.
pub trait Model: Send + Sync {
    fn n_classes(&self) -> usize;

    fn fit(&mut self, x: &[Vec<f64>], y: &[usize]) -> Result<(), EngineError>;

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, EngineError>;

    fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<usize>, EngineError> {
        Ok(self
            .predict_proba(x)?
            .iter()
            .map(|row| argmax(row))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    GaussianNaiveBayes,
    NearestCentroid,
}

impl ModelKind {
    pub fn build(self, n_classes: usize) -> Box<dyn Model> {
        match self {
            Self::GaussianNaiveBayes => Box::new(GaussianNaiveBayes::new(n_classes)),
            Self::NearestCentroid => Box::new(NearestCentroid::new(n_classes)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GaussianNaiveBayes => "gaussian_naive_bayes",
            Self::NearestCentroid => "nearest_centroid",
        }
    }
}

fn validate_training(x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<usize, EngineError> {
    if x.is_empty() {
        return Err(EngineError::EmptyTrainingSet);
    }
    if x.len() != y.len() {
        return Err(EngineError::LengthMismatch {
            features: x.len(),
            targets: y.len(),
        });
    }
    let width = x[0].len();
    check_width(x, width)?;
    if let Some(&class) = y.iter().find(|&&c| c >= n_classes) {
        return Err(EngineError::ClassOutOfRange {
            class,
            classes: n_classes,
        });
    }
    Ok(width)
}

fn check_width(x: &[Vec<f64>], expected: usize) -> Result<(), EngineError> {
    match x.iter().find(|row| row.len() != expected) {
        Some(row) => Err(EngineError::FeatureWidth {
            expected,
            actual: row.len(),
        }),
        None => Ok(()),
    }
}

/// Softmax restricted to classes seen during fit.
fn masked_softmax(scores: &[f64], seen: &[bool]) -> Vec<f64> {
    let max = scores
        .iter()
        .zip(seen)
        .filter(|(_, s)| **s)
        .map(|(v, _)| *v)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores
        .iter()
        .zip(seen)
        .map(|(v, s)| if *s { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = exps.iter().sum();
    if total > 0.0 && total.is_finite() {
        exps.into_iter().map(|e| e / total).collect()
    } else {
        let n_seen = seen.iter().filter(|s| **s).count().max(1) as f64;
        seen.iter()
            .map(|s| if *s { 1.0 / n_seen } else { 0.0 })
            .collect()
    }
}

fn class_means(x: &[Vec<f64>], y: &[usize], n_classes: usize, width: usize) -> (Vec<usize>, Vec<Vec<f64>>) {
    let mut counts = vec![0usize; n_classes];
    let mut sums = vec![vec![0.0; width]; n_classes];
    for (row, &class) in x.iter().zip(y) {
        counts[class] += 1;
        for (sum, value) in sums[class].iter_mut().zip(row) {
            *sum += value;
        }
    }
    let means = sums
        .into_iter()
        .zip(&counts)
        .map(|(sum, &count)| {
            if count == 0 {
                sum
            } else {
                sum.into_iter().map(|s| s / count as f64).collect()
            }
        })
        .collect();
    (counts, means)
}

#[derive(Debug, Clone)]
struct NaiveBayesParams {
    seen: Vec<bool>,
    log_priors: Vec<f64>,
    means: Vec<Vec<f64>>,
    variances: Vec<Vec<f64>>,
}

/// Gaussian naive Bayes with variance smoothing proportional to the largest
/// feature variance.
#[derive(Debug, Clone)]
pub struct GaussianNaiveBayes {
    n_classes: usize,
    params: Option<NaiveBayesParams>,
}

impl GaussianNaiveBayes {
    const VAR_SMOOTHING: f64 = 1e-9;

    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            params: None,
        }
    }
}

impl Model for GaussianNaiveBayes {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[usize]) -> Result<(), EngineError> {
        let width = validate_training(x, y, self.n_classes)?;
        let n = x.len() as f64;
        let (counts, means) = class_means(x, y, self.n_classes, width);

        let mut variances = vec![vec![0.0; width]; self.n_classes];
        for (row, &class) in x.iter().zip(y) {
            for (j, value) in row.iter().enumerate() {
                let d = value - means[class][j];
                variances[class][j] += d * d;
            }
        }

        let mut max_feature_var: f64 = 0.0;
        for j in 0..width {
            let mean = x.iter().map(|row| row[j]).sum::<f64>() / n;
            let var = x.iter().map(|row| (row[j] - mean).powi(2)).sum::<f64>() / n;
            max_feature_var = max_feature_var.max(var);
        }
        let epsilon = (Self::VAR_SMOOTHING * max_feature_var).max(Self::VAR_SMOOTHING);

        for (class_vars, &count) in variances.iter_mut().zip(&counts) {
            for v in class_vars.iter_mut() {
                *v = if count == 0 { 1.0 } else { *v / count as f64 } + epsilon;
            }
        }

        self.params = Some(NaiveBayesParams {
            seen: counts.iter().map(|&c| c > 0).collect(),
            log_priors: counts
                .iter()
                .map(|&c| if c == 0 { f64::NEG_INFINITY } else { (c as f64 / n).ln() })
                .collect(),
            means,
            variances,
        });
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, EngineError> {
        let params = self.params.as_ref().ok_or(EngineError::NotFitted)?;
        let width = params.means.first().map(Vec::len).unwrap_or(0);
        check_width(x, width)?;

        Ok(x.iter()
            .map(|row| {
                let scores: Vec<f64> = (0..self.n_classes)
                    .map(|c| {
                        if !params.seen[c] {
                            return f64::NEG_INFINITY;
                        }
                        let log_likelihood: f64 = row
                            .iter()
                            .zip(&params.means[c])
                            .zip(&params.variances[c])
                            .map(|((value, mean), var)| {
                                -0.5 * ((2.0 * std::f64::consts::PI * var).ln()
                                    + (value - mean).powi(2) / var)
                            })
                            .sum();
                        params.log_priors[c] + log_likelihood
                    })
                    .collect();
                masked_softmax(&scores, &params.seen)
            })
            .collect())
    }
}

/// Nearest centroid classifier; probabilities are a softmax over negative
/// distances to the class centroids.
#[derive(Debug, Clone)]
pub struct NearestCentroid {
    n_classes: usize,
    centroids: Option<(Vec<bool>, Vec<Vec<f64>>)>,
}

impl NearestCentroid {
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            centroids: None,
        }
    }
}

impl Model for NearestCentroid {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn fit(&mut self, x: &[Vec<f64>], y: &[usize]) -> Result<(), EngineError> {
        let width = validate_training(x, y, self.n_classes)?;
        let (counts, means) = class_means(x, y, self.n_classes, width);
        self.centroids = Some((counts.iter().map(|&c| c > 0).collect(), means));
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, EngineError> {
        let (seen, centroids) = self.centroids.as_ref().ok_or(EngineError::NotFitted)?;
        let width = centroids.first().map(Vec::len).unwrap_or(0);
        check_width(x, width)?;

        Ok(x.iter()
            .map(|row| {
                let scores: Vec<f64> = centroids.iter().map(|c| -euclidean(row, c)).collect();
                masked_softmax(&scores, seen)
            })
            .collect())
    }
}
