//! Link-prediction metrics over positive and negative edge scores.

/// Summary metrics for one batch of scored edges.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LinkMetrics {
    pub auc: f64,
    pub average_precision: f64,
    pub accuracy: f64,
    pub f1: f64,
    pub num_pos: usize,
    pub num_neg: usize,
}

impl LinkMetrics {
    /// Compute all metrics from raw logits. Either side empty yields NaN
    /// metrics with the counts preserved.
    pub fn compute(pos_logits: &[f32], neg_logits: &[f32]) -> Self {
        Self {
            auc: roc_auc(pos_logits, neg_logits),
            average_precision: average_precision(pos_logits, neg_logits),
            accuracy: accuracy(pos_logits, neg_logits),
            f1: f1_score(pos_logits, neg_logits),
            num_pos: pos_logits.len(),
            num_neg: neg_logits.len(),
        }
    }

    /// Mean of several summaries, NaN entries skipped. None if every
    /// entry is NaN.
    pub fn mean_accuracy<'a>(all: impl IntoIterator<Item = &'a LinkMetrics>) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for m in all {
            if m.accuracy.is_finite() {
                sum += m.accuracy;
                n += 1;
            }
        }
        (n > 0).then(|| sum / n as f64)
    }
}

/// Area under the ROC curve via the Mann-Whitney U statistic with midrank
/// ties. NaN when either class is empty.
pub fn roc_auc(pos: &[f32], neg: &[f32]) -> f64 {
    if pos.is_empty() || neg.is_empty() {
        return f64::NAN;
    }
    let mut scored: Vec<(f32, bool)> = pos
        .iter()
        .map(|&s| (s, true))
        .chain(neg.iter().map(|&s| (s, false)))
        .collect();
    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Midranks: tied scores share the average of their rank range.
    let n = scored.len();
    let mut rank_sum_pos = 0.0f64;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scored[j + 1].0 == scored[i].0 {
            j += 1;
        }
        let midrank = (i + j) as f64 / 2.0 + 1.0;
        for item in scored.iter().take(j + 1).skip(i) {
            if item.1 {
                rank_sum_pos += midrank;
            }
        }
        i = j + 1;
    }
    let np = pos.len() as f64;
    let nn = neg.len() as f64;
    (rank_sum_pos - np * (np + 1.0) / 2.0) / (np * nn)
}

/// Average precision over the score-descending ranking. NaN when either
/// class is empty.
pub fn average_precision(pos: &[f32], neg: &[f32]) -> f64 {
    if pos.is_empty() || neg.is_empty() {
        return f64::NAN;
    }
    let mut scored: Vec<(f32, bool)> = pos
        .iter()
        .map(|&s| (s, true))
        .chain(neg.iter().map(|&s| (s, false)))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut hits = 0usize;
    let mut sum = 0.0f64;
    for (rank, &(_, is_pos)) in scored.iter().enumerate() {
        if is_pos {
            hits += 1;
            sum += hits as f64 / (rank + 1) as f64;
        }
    }
    sum / pos.len() as f64
}

/// Fraction of edges classified correctly at a sigmoid threshold of 0.5,
/// i.e. logit 0. NaN when no edges at all.
pub fn accuracy(pos: &[f32], neg: &[f32]) -> f64 {
    let total = pos.len() + neg.len();
    if total == 0 {
        return f64::NAN;
    }
    let correct = pos.iter().filter(|&&s| s > 0.0).count()
        + neg.iter().filter(|&&s| s <= 0.0).count();
    correct as f64 / total as f64
}

/// F1 for the positive class at logit threshold 0. NaN when there are no
/// positives.
pub fn f1_score(pos: &[f32], neg: &[f32]) -> f64 {
    if pos.is_empty() {
        return f64::NAN;
    }
    let tp = pos.iter().filter(|&&s| s > 0.0).count() as f64;
    let fp = neg.iter().filter(|&&s| s > 0.0).count() as f64;
    let fn_ = pos.iter().filter(|&&s| s <= 0.0).count() as f64;
    if tp == 0.0 {
        return 0.0;
    }
    let precision = tp / (tp + fp);
    let recall = tp / (tp + fn_);
    2.0 * precision * recall / (precision + recall)
}
