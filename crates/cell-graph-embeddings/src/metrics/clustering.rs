//! Clustering quality metrics over embedding rows.
//!
//! Both metrics take row-major embeddings and one integer label per row.
//! Fewer than two clusters, or a cluster count equal to the sample count,
//! is degenerate and yields NaN.

use std::collections::BTreeMap;

/// Clustering summary for one embedding matrix.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusteringMetrics {
    pub calinski_harabasz: f64,
    pub davies_bouldin: f64,
    pub num_samples: usize,
    pub num_clusters: usize,
}

impl ClusteringMetrics {
    pub fn compute(rows: &[Vec<f32>], labels: &[u32]) -> Self {
        let num_clusters = labels.iter().collect::<std::collections::BTreeSet<_>>().len();
        Self {
            calinski_harabasz: calinski_harabasz(rows, labels),
            davies_bouldin: davies_bouldin(rows, labels),
            num_samples: rows.len(),
            num_clusters,
        }
    }
}

fn centroid(rows: &[&Vec<f32>], dim: usize) -> Vec<f64> {
    let mut c = vec![0.0f64; dim];
    for row in rows {
        for (acc, &x) in c.iter_mut().zip(row.iter()) {
            *acc += x as f64;
        }
    }
    for acc in &mut c {
        *acc /= rows.len() as f64;
    }
    c
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn row_sq_dist(row: &[f32], c: &[f64]) -> f64 {
    row.iter()
        .zip(c.iter())
        .map(|(&x, &y)| (x as f64 - y) * (x as f64 - y))
        .sum()
}

fn group_by_label<'a>(
    rows: &'a [Vec<f32>],
    labels: &[u32],
) -> BTreeMap<u32, Vec<&'a Vec<f32>>> {
    let mut groups: BTreeMap<u32, Vec<&Vec<f32>>> = BTreeMap::new();
    for (row, &label) in rows.iter().zip(labels.iter()) {
        groups.entry(label).or_default().push(row);
    }
    groups
}

/// Calinski-Harabasz index: between-cluster dispersion over within-cluster
/// dispersion, scaled by the degrees of freedom. Higher is better.
pub fn calinski_harabasz(rows: &[Vec<f32>], labels: &[u32]) -> f64 {
    if rows.is_empty() || rows.len() != labels.len() {
        return f64::NAN;
    }
    let n = rows.len();
    let dim = rows[0].len();
    let groups = group_by_label(rows, labels);
    let k = groups.len();
    if k < 2 || k >= n {
        return f64::NAN;
    }

    let all: Vec<&Vec<f32>> = rows.iter().collect();
    let global = centroid(&all, dim);

    let mut between = 0.0f64;
    let mut within = 0.0f64;
    for members in groups.values() {
        let c = centroid(members, dim);
        between += members.len() as f64 * sq_dist(&c, &global);
        for row in members {
            within += row_sq_dist(row, &c);
        }
    }
    if within == 0.0 {
        return f64::NAN;
    }
    (between / within) * ((n - k) as f64 / (k - 1) as f64)
}

/// Davies-Bouldin index: mean over clusters of the worst-case ratio of
/// intra-cluster scatter to centroid separation. Lower is better.
pub fn davies_bouldin(rows: &[Vec<f32>], labels: &[u32]) -> f64 {
    if rows.is_empty() || rows.len() != labels.len() {
        return f64::NAN;
    }
    let dim = rows[0].len();
    let groups = group_by_label(rows, labels);
    let k = groups.len();
    if k < 2 {
        return f64::NAN;
    }

    let mut centroids = Vec::with_capacity(k);
    let mut scatters = Vec::with_capacity(k);
    for members in groups.values() {
        let c = centroid(members, dim);
        let scatter = members
            .iter()
            .map(|row| row_sq_dist(row, &c).sqrt())
            .sum::<f64>()
            / members.len() as f64;
        centroids.push(c);
        scatters.push(scatter);
    }

    let mut total = 0.0f64;
    for i in 0..k {
        let mut worst = 0.0f64;
        for j in 0..k {
            if i == j {
                continue;
            }
            let sep = sq_dist(&centroids[i], &centroids[j]).sqrt();
            if sep == 0.0 {
                return f64::NAN;
            }
            let ratio = (scatters[i] + scatters[j]) / sep;
            if ratio > worst {
                worst = ratio;
            }
        }
        total += worst;
    }
    total / k as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tight_clusters() -> (Vec<Vec<f32>>, Vec<u32>) {
        let rows = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![5.0, 5.0],
            vec![5.1, 5.0],
            vec![5.0, 5.1],
        ];
        let labels = vec![0, 0, 0, 1, 1, 1];
        (rows, labels)
    }

    #[test]
    fn test_tight_clusters_score_well() {
        let (rows, labels) = two_tight_clusters();
        let ch = calinski_harabasz(&rows, &labels);
        let db = davies_bouldin(&rows, &labels);
        assert!(ch > 100.0, "well-separated clusters, got ch={}", ch);
        assert!(db < 0.2, "well-separated clusters, got db={}", db);
    }

    #[test]
    fn test_shuffled_labels_score_worse() {
        let (rows, _) = two_tight_clusters();
        let good = calinski_harabasz(&rows, &[0, 0, 0, 1, 1, 1]);
        let bad = calinski_harabasz(&rows, &[0, 1, 0, 1, 0, 1]);
        assert!(good > bad);
    }

    #[test]
    fn test_single_cluster_is_nan() {
        let (rows, _) = two_tight_clusters();
        assert!(calinski_harabasz(&rows, &[0; 6]).is_nan());
        assert!(davies_bouldin(&rows, &[0; 6]).is_nan());
    }

    #[test]
    fn test_empty_input_is_nan() {
        assert!(calinski_harabasz(&[], &[]).is_nan());
        assert!(davies_bouldin(&[], &[]).is_nan());
    }

    #[test]
    fn test_length_mismatch_is_nan() {
        let (rows, _) = two_tight_clusters();
        assert!(calinski_harabasz(&rows, &[0, 1]).is_nan());
    }
}
