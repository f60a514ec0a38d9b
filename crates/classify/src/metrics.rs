//! Top-k hits, accuracy and loss over row-major `[N, num_classes]` logits.

use crate::{ClassifyError, ClassifyResult};
use std::fmt;

/// A fraction rendered as a percentage with two decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percent(pub f64);

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.0 * 100.0)
    }
}

fn rows<'a>(
    logits: &'a [f32],
    num_classes: usize,
    targets: &[i32],
) -> ClassifyResult<std::slice::Chunks<'a, f32>> {
    if num_classes == 0 {
        return Err(ClassifyError::Config("num_classes must be positive".into()));
    }
    if logits.len() != targets.len() * num_classes {
        return Err(ClassifyError::Shape(format!(
            "{} logits for {} targets of {num_classes} classes",
            logits.len(),
            targets.len()
        )));
    }
    Ok(logits.chunks(num_classes))
}

/// Index of the largest finite value; the first one wins ties.
pub fn argmax(row: &[f32]) -> Option<usize> {
    row.iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Whether each target is among the `k` largest logits of its row.
///
/// Ties at the boundary count as hits. Out-of-range targets and non-finite
/// target logits never hit.
pub fn in_top_k(
    logits: &[f32],
    num_classes: usize,
    targets: &[i32],
    k: usize,
) -> ClassifyResult<Vec<bool>> {
    Ok(rows(logits, num_classes, targets)?
        .zip(targets)
        .map(|(row, &t)| {
            let Some(target) = usize::try_from(t).ok().and_then(|t| row.get(t).copied()) else {
                return false;
            };
            if !target.is_finite() {
                return false;
            }
            row.iter().filter(|&&v| v > target).count() < k
        })
        .collect())
}

/// Fraction of rows whose target is in the top `k`. Zero rows give zero.
pub fn accuracy(
    logits: &[f32],
    num_classes: usize,
    targets: &[i32],
    k: usize,
) -> ClassifyResult<f64> {
    let hits = in_top_k(logits, num_classes, targets, k)?;
    if hits.is_empty() {
        return Ok(0.0);
    }
    Ok(hits.iter().filter(|&&h| h).count() as f64 / hits.len() as f64)
}

/// Mean softmax cross-entropy against one-hot targets.
pub fn softmax_cross_entropy(
    logits: &[f32],
    num_classes: usize,
    targets: &[i32],
) -> ClassifyResult<f32> {
    let mut total = 0.0f64;
    for (row, &t) in rows(logits, num_classes, targets)?.zip(targets) {
        let target = usize::try_from(t)
            .ok()
            .filter(|&t| t < num_classes)
            .ok_or_else(|| {
                ClassifyError::Config(format!("label {t} outside 0..{num_classes}"))
            })?;
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        let log_sum = row.iter().map(|&v| (v as f64 - max).exp()).sum::<f64>().ln() + max;
        total += log_sum - row[target] as f64;
    }
    if targets.is_empty() {
        return Ok(0.0);
    }
    Ok((total / targets.len() as f64) as f32)
}

/// Running top-1/top-5 hit counts across evaluated batches.
#[derive(Debug, Clone, Default)]
pub struct EvalMetrics {
    top1: Vec<usize>,
    top5: Vec<usize>,
    samples: usize,
}

impl EvalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        logits: &[f32],
        num_classes: usize,
        targets: &[i32],
    ) -> ClassifyResult<()> {
        let count = |k| -> ClassifyResult<usize> {
            Ok(in_top_k(logits, num_classes, targets, k)?
                .into_iter()
                .filter(|&h| h)
                .count())
        };
        let (top1, top5) = (count(1)?, count(5)?);
        self.top1.push(top1);
        self.top5.push(top5);
        self.samples += targets.len();
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.top1.len()
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn top1(&self) -> Percent {
        self.rate(&self.top1)
    }

    pub fn top5(&self) -> Percent {
        self.rate(&self.top5)
    }

    fn rate(&self, history: &[usize]) -> Percent {
        if self.samples == 0 {
            return Percent(0.0);
        }
        Percent(history.iter().sum::<usize>() as f64 / self.samples as f64)
    }
}

impl fmt::Display for EvalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "top1: {}, top5: {}", self.top1(), self.top5())
    }
}
