//! Classification scores recorded per experiment iteration.
//!
//! Macro averages are taken over the union of labels in `y_true` and `y_pred`;
//! a label with an undefined ratio scores 0.

use std::collections::BTreeSet;

pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Counts {
    tp: usize,
    fp: usize,
    fn_: usize,
}

fn per_label(y_true: &[usize], y_pred: &[usize]) -> Vec<Counts> {
    let labels: BTreeSet<usize> = y_true.iter().chain(y_pred).copied().collect();
    labels
        .into_iter()
        .map(|label| {
            let mut counts = Counts::default();
            for (&t, &p) in y_true.iter().zip(y_pred) {
                match (t == label, p == label) {
                    (true, true) => counts.tp += 1,
                    (false, true) => counts.fp += 1,
                    (true, false) => counts.fn_ += 1,
                    (false, false) => {}
                }
            }
            counts
        })
        .collect()
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn macro_average(y_true: &[usize], y_pred: &[usize], score: impl Fn(&Counts) -> f64) -> f64 {
    let counts = per_label(y_true, y_pred);
    if counts.is_empty() {
        return 0.0;
    }
    counts.iter().map(score).sum::<f64>() / counts.len() as f64
}

pub fn precision_macro(y_true: &[usize], y_pred: &[usize]) -> f64 {
    macro_average(y_true, y_pred, |c| ratio(c.tp, c.tp + c.fp))
}

pub fn recall_macro(y_true: &[usize], y_pred: &[usize]) -> f64 {
    macro_average(y_true, y_pred, |c| ratio(c.tp, c.tp + c.fn_))
}

pub fn f1_macro(y_true: &[usize], y_pred: &[usize]) -> f64 {
    macro_average(y_true, y_pred, |c| ratio(2 * c.tp, 2 * c.tp + c.fp + c.fn_))
}

/// Area under the F1 learning curve up to `idx`, normalised by `idx` so it
/// stays in [0, 1]. The first iteration has no area.
pub fn normalized_f1_auc(f1_history: &[f64], idx: usize) -> f64 {
    if idx == 0 || idx >= f1_history.len() {
        return 0.0;
    }
    let area: f64 = f1_history[..=idx]
        .windows(2)
        .map(|w| (w[0] + w[1]) / 2.0)
        .sum();
    area / idx as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn perfect_predictions() {
        let y = [0, 1, 2, 1];
        assert_eq!(accuracy(&y, &y), 1.0);
        assert_eq!(f1_macro(&y, &y), 1.0);
        assert_eq!(precision_macro(&y, &y), 1.0);
        assert_eq!(recall_macro(&y, &y), 1.0);
    }

    #[test]
    fn macro_scores_average_over_labels() {
        let y_true = [0, 0, 1, 1];
        let y_pred = [0, 1, 1, 1];

        assert!(close(accuracy(&y_true, &y_pred), 0.75));
        // label 0: p=1, r=0.5; label 1: p=2/3, r=1
        assert!(close(precision_macro(&y_true, &y_pred), (1.0 + 2.0 / 3.0) / 2.0));
        assert!(close(recall_macro(&y_true, &y_pred), 0.75));
        assert!(close(f1_macro(&y_true, &y_pred), (2.0 / 3.0 + 0.8) / 2.0));
    }

    #[test]
    fn labels_never_predicted_score_zero() {
        let y_true = [0, 1];
        let y_pred = [0, 0];
        // label 1 has no predictions: precision 0, recall 0
        assert!(close(precision_macro(&y_true, &y_pred), 0.25));
        assert!(close(recall_macro(&y_true, &y_pred), 0.5));
    }

    #[test]
    fn empty_inputs_score_zero() {
        assert_eq!(accuracy(&[], &[]), 0.0);
        assert_eq!(f1_macro(&[], &[]), 0.0);
    }

    #[test]
    fn f1_auc_is_normalised_trapezoid() {
        let history = [0.0, 1.0, 1.0];
        assert_eq!(normalized_f1_auc(&history, 0), 0.0);
        assert!(close(normalized_f1_auc(&history, 1), 0.5));
        assert!(close(normalized_f1_auc(&history, 2), 0.75));
        assert_eq!(normalized_f1_auc(&history, 3), 0.0);
    }
}
