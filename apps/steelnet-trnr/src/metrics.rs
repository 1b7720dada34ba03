//! Classification metrics computed on argmax predictions, plus the
//! inverse-frequency class weights used by the weighted loss.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub f1: f64,
}

impl BatchMetrics {
    pub fn evaluate(loss: f64, y_true: &[i64], y_pred: &[i64]) -> Self {
        Self {
            loss,
            accuracy: accuracy(y_true, y_pred),
            balanced_accuracy: balanced_accuracy(y_true, y_pred),
            f1: weighted_f1(y_true, y_pred),
        }
    }

    /// Field-wise mean over the batches of one epoch.
    pub fn mean(batches: &[BatchMetrics]) -> Self {
        if batches.is_empty() {
            return Self {
                loss: f64::NAN,
                accuracy: f64::NAN,
                balanced_accuracy: f64::NAN,
                f1: f64::NAN,
            };
        }
        let n = batches.len() as f64;
        let sum = batches.iter().fold(Self::default(), |acc, b| Self {
            loss: acc.loss + b.loss,
            accuracy: acc.accuracy + b.accuracy,
            balanced_accuracy: acc.balanced_accuracy + b.balanced_accuracy,
            f1: acc.f1 + b.f1,
        });
        Self {
            loss: sum.loss / n,
            accuracy: sum.accuracy / n,
            balanced_accuracy: sum.balanced_accuracy / n,
            f1: sum.f1 / n,
        }
    }
}

pub fn accuracy(y_true: &[i64], y_pred: &[i64]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let hits = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    hits as f64 / y_true.len() as f64
}

#[derive(Default)]
struct ClassCounts {
    support: usize,
    true_pos: usize,
    false_pos: usize,
}

fn per_class(y_true: &[i64], y_pred: &[i64]) -> BTreeMap<i64, ClassCounts> {
    let mut counts: BTreeMap<i64, ClassCounts> = BTreeMap::new();
    for (&t, &p) in y_true.iter().zip(y_pred) {
        counts.entry(t).or_default().support += 1;
        if t == p {
            counts.entry(t).or_default().true_pos += 1;
        } else {
            counts.entry(p).or_default().false_pos += 1;
        }
    }
    counts
}

/// Mean recall over the classes present in `y_true`.
pub fn balanced_accuracy(y_true: &[i64], y_pred: &[i64]) -> f64 {
    let recalls: Vec<f64> = per_class(y_true, y_pred)
        .values()
        .filter(|c| c.support > 0)
        .map(|c| c.true_pos as f64 / c.support as f64)
        .collect();
    if recalls.is_empty() {
        return 0.0;
    }
    recalls.iter().sum::<f64>() / recalls.len() as f64
}

/// Per-class F1 averaged with true-support weights. Classes that only occur
/// in the predictions count with weight zero.
pub fn weighted_f1(y_true: &[i64], y_pred: &[i64]) -> f64 {
    let counts = per_class(y_true, y_pred);
    let total: usize = counts.values().map(|c| c.support).sum();
    if total == 0 {
        return 0.0;
    }
    let weighted: f64 = counts
        .values()
        .map(|c| {
            let false_neg = c.support - c.true_pos;
            let denom = 2 * c.true_pos + c.false_pos + false_neg;
            let f1 = if denom == 0 {
                0.0
            } else {
                2.0 * c.true_pos as f64 / denom as f64
            };
            f1 * c.support as f64
        })
        .sum();
    weighted / total as f64
}

/// One weight per class: the reciprocal of its example count in `labels`.
pub fn class_weights(labels: &[i64], n_output: i64) -> Result<Vec<f64>> {
    ensure!(n_output > 0, "n_output must be positive, got {n_output}");
    let mut counts = vec![0usize; n_output as usize];
    for &label in labels {
        match counts.get_mut(label as usize) {
            Some(c) if label >= 0 => *c += 1,
            _ => bail!("label {label} is outside 0..{n_output}"),
        }
    }
    counts
        .iter()
        .enumerate()
        .map(|(class, &count)| {
            if count == 0 {
                bail!("class {class} has no validation examples, cannot weight the loss");
            }
            Ok(1.0 / count as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn binary_metrics() {
        let y_true = [0, 0, 1, 1];
        let y_pred = [0, 1, 1, 1];
        assert!(close(accuracy(&y_true, &y_pred), 0.75));
        assert!(close(balanced_accuracy(&y_true, &y_pred), 0.75));
        // class 0: f1 = 2/3, class 1: f1 = 4/5, equal support
        assert!(close(weighted_f1(&y_true, &y_pred), (2.0 / 3.0 + 0.8) / 2.0));
    }

    #[test]
    fn balanced_accuracy_ignores_classes_missing_from_truth() {
        // class 2 is only predicted, never true
        let y_true = [0, 0, 0, 1];
        let y_pred = [0, 0, 2, 1];
        assert!(close(balanced_accuracy(&y_true, &y_pred), (2.0 / 3.0 + 1.0) / 2.0));
    }

    #[test]
    fn weighted_f1_uses_support() {
        let y_true = [0, 0, 0, 1];
        let y_pred = [0, 0, 0, 0];
        // class 0: tp=3 fp=1 fn=0 -> 6/7, class 1: 0
        assert!(close(weighted_f1(&y_true, &y_pred), (6.0 / 7.0) * 0.75));
    }

    #[test]
    fn perfect_predictions() {
        let y = [3, 1, 4, 1, 0];
        assert!(close(accuracy(&y, &y), 1.0));
        assert!(close(balanced_accuracy(&y, &y), 1.0));
        assert!(close(weighted_f1(&y, &y), 1.0));
    }

    #[test]
    fn mean_of_batches() {
        let a = BatchMetrics { loss: 1.0, accuracy: 0.5, balanced_accuracy: 0.5, f1: 0.2 };
        let b = BatchMetrics { loss: 3.0, accuracy: 1.0, balanced_accuracy: 0.0, f1: 0.4 };
        let m = BatchMetrics::mean(&[a, b]);
        assert!(close(m.loss, 2.0));
        assert!(close(m.accuracy, 0.75));
        assert!(close(m.balanced_accuracy, 0.25));
        assert!(close(m.f1, 0.3));
        assert!(BatchMetrics::mean(&[]).loss.is_nan());
    }

    #[test]
    fn inverse_frequency_weights() {
        let w = class_weights(&[0, 0, 1, 2, 2, 2, 2], 3).unwrap();
        assert!(close(w[0], 0.5));
        assert!(close(w[1], 1.0));
        assert!(close(w[2], 0.25));
    }

    #[test]
    fn empty_class_is_an_error() {
        assert!(class_weights(&[0, 0, 2], 3).is_err());
        assert!(class_weights(&[0, 5], 3).is_err());
    }
}
