//! Run artifact persistence.
//!
//! Embeddings go to safetensors (one named tensor per context plus the
//! meta graph), history and labels to JSON, and the final metrics to a
//! plain-text log that is convenient to diff across runs.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use candle_core::Tensor;

use crate::data::ContextId;
use crate::error::{TrainError, TrainResult};
use crate::metrics::{ClusteringMetrics, LinkMetrics};
use crate::train::TrainingHistory;

/// Safetensors key for one context's embedding matrix.
fn context_key(ctx: ContextId) -> String {
    format!("{}", ctx)
}

/// Write all embedding matrices to one safetensors file. Tensors must be
/// host-resident.
pub fn save_embeddings(
    path: impl AsRef<Path>,
    contexts: &BTreeMap<ContextId, Tensor>,
    meta: &Tensor,
) -> TrainResult<()> {
    let mut map: HashMap<String, Tensor> = HashMap::with_capacity(contexts.len() + 1);
    for (&ctx, emb) in contexts {
        map.insert(context_key(ctx), emb.clone());
    }
    map.insert("meta".to_string(), meta.clone());
    candle_core::safetensors::save(&map, path.as_ref()).map_err(|e| TrainError::Checkpoint {
        message: format!("failed to write {}: {}", path.as_ref().display(), e),
    })
}

/// Load embeddings back, keyed the way `save_embeddings` wrote them.
pub fn load_embeddings(
    path: impl AsRef<Path>,
) -> TrainResult<(BTreeMap<ContextId, Tensor>, Tensor)> {
    let map = candle_core::safetensors::load(path.as_ref(), &candle_core::Device::Cpu).map_err(
        |e| TrainError::Checkpoint {
            message: format!("failed to read {}: {}", path.as_ref().display(), e),
        },
    )?;
    let mut contexts = BTreeMap::new();
    let mut meta = None;
    for (key, tensor) in map {
        if key == "meta" {
            meta = Some(tensor);
        } else if let Some(id) = key.strip_prefix("ctx").and_then(|s| s.parse::<u32>().ok()) {
            contexts.insert(ContextId(id), tensor);
        }
    }
    let meta = meta.ok_or_else(|| TrainError::Checkpoint {
        message: format!("{}: missing meta embeddings", path.as_ref().display()),
    })?;
    Ok((contexts, meta))
}

/// Per-epoch history as JSON.
pub fn save_history(path: impl AsRef<Path>, history: &TrainingHistory) -> TrainResult<()> {
    let json = serde_json::to_string_pretty(history).map_err(|e| TrainError::Checkpoint {
        message: format!("history serialization: {}", e),
    })?;
    std::fs::write(path.as_ref(), json)?;
    Ok(())
}

/// Per-context node labels as JSON, keyed by context name.
pub fn save_labels(
    path: impl AsRef<Path>,
    labels: &BTreeMap<String, Vec<u32>>,
) -> TrainResult<()> {
    let json = serde_json::to_string_pretty(labels).map_err(|e| TrainError::Checkpoint {
        message: format!("label serialization: {}", e),
    })?;
    std::fs::write(path.as_ref(), json)?;
    Ok(())
}

/// Per-epoch and final metrics as a readable text log.
pub fn save_metrics_log(
    path: impl AsRef<Path>,
    history: &TrainingHistory,
    test: &LinkMetrics,
    clustering: &ClusteringMetrics,
) -> TrainResult<()> {
    let mut file = std::fs::File::create(path.as_ref())?;
    for record in &history.epochs {
        writeln!(
            file,
            "epoch {}: loss={:.6} train_auc={:.6} val_auc={:.6} val_acc={:.6} improved={}",
            record.epoch,
            record.train_loss,
            record.train.auc,
            record.val.auc,
            record.val_score,
            record.improved
        )?;
    }
    writeln!(
        file,
        "test: auc={:.6} ap={:.6} acc={:.6} f1={:.6} pos={} neg={}",
        test.auc, test.average_precision, test.accuracy, test.f1, test.num_pos, test.num_neg
    )?;
    writeln!(
        file,
        "clustering: calinski_harabasz={:.6} davies_bouldin={:.6} samples={} clusters={}",
        clustering.calinski_harabasz,
        clustering.davies_bouldin,
        clustering.num_samples,
        clustering.num_clusters
    )?;
    Ok(())
}
