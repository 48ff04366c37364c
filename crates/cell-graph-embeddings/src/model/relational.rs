//! Per-relation message-passing model over both graph collections.
//!
//! Two towers share an architecture: each layer projects node features
//! through a self weight and one weight per relation type, aggregates
//! messages over that relation's edges by destination, and applies a bias.
//! The context tower runs over every context graph with the same weights;
//! the meta tower runs over the meta graph. The towers are coupled by
//! mean-pooling each context's node embeddings and adding a learned
//! projection of the pooled vector to that context's meta-graph node, so
//! meta-level gradients reach the context weights in the same backward
//! pass.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::batch::{GraphBatch, PhaseBatch, RelationEdgeMap};
use crate::config::Hyperparams;
use crate::data::{ContextId, DatasetRegistry, RelationId};
use crate::error::{TrainError, TrainResult};
use crate::model::{ModelOutput, ParamSnapshot, SharedModel};

/// One message-passing layer: a self projection plus one projection per
/// relation type, aggregated over edges by destination node.
#[derive(Debug)]
struct RelationalLayer {
    self_weight: Var,
    bias: Var,
    relation_weights: BTreeMap<RelationId, Var>,
}

/// Glorot-uniform matrix on `device`, drawn from the run's seeded stream
/// on the host so initialization is identical across devices.
pub(crate) fn glorot_var(
    rng: &mut StdRng,
    in_dim: usize,
    out_dim: usize,
    device: &Device,
) -> TrainResult<Var> {
    let bound = (6.0 / (in_dim + out_dim) as f32).sqrt();
    let data: Vec<f32> = (0..in_dim * out_dim)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Tensor::from_vec(data, (in_dim, out_dim), &Device::Cpu)
        .and_then(|t| t.to_device(device))
        .and_then(|t| Var::from_tensor(&t))
        .map_err(|e| TrainError::tensor("weight init", e))
}

impl RelationalLayer {
    fn init(
        in_dim: usize,
        out_dim: usize,
        relations: &BTreeMap<RelationId, String>,
        rng: &mut StdRng,
        device: &Device,
    ) -> TrainResult<Self> {
        let mut relation_weights = BTreeMap::new();
        for &rel in relations.keys() {
            relation_weights.insert(rel, glorot_var(rng, in_dim, out_dim, device)?);
        }
        Ok(Self {
            self_weight: glorot_var(rng, in_dim, out_dim, device)?,
            bias: Var::zeros(out_dim, DType::F32, device)
                .map_err(|e| TrainError::tensor("bias init", e))?,
            relation_weights,
        })
    }

    fn out_dim(&self) -> usize {
        self.self_weight.dims()[1]
    }

    /// x: N x in. Aggregates each relation's messages into the destination
    /// rows; relations with no edges in this batch contribute nothing.
    fn forward(&self, x: &Tensor, edges: &RelationEdgeMap) -> TrainResult<Tensor> {
        let n = x.dims()[0];
        let mut acc = x
            .matmul(&self.self_weight)
            .and_then(|h| h.broadcast_add(&self.bias))
            .map_err(|e| TrainError::tensor("self projection", e))?;
        for (rel, weight) in &self.relation_weights {
            let edge_index = match edges.get(rel) {
                Some(e) if e.num_pos() > 0 => &e.pos,
                _ => continue,
            };
            let src = edge_index
                .get(0)
                .map_err(|e| TrainError::tensor("edge src row", e))?;
            let dst = edge_index
                .get(1)
                .map_err(|e| TrainError::tensor("edge dst row", e))?;
            let messages = x
                .matmul(weight)
                .and_then(|m| m.index_select(&src, 0))
                .map_err(|e| TrainError::tensor("message gather", e))?;
            let aggregated = Tensor::zeros((n, self.out_dim()), DType::F32, x.device())
                .and_then(|z| z.index_add(&dst, &messages, 0))
                .map_err(|e| TrainError::tensor("message aggregate", e))?;
            acc = (acc + aggregated).map_err(|e| TrainError::tensor("message sum", e))?;
        }
        Ok(acc)
    }

    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((format!("{}.self_weight", prefix), self.self_weight.clone()));
        out.push((format!("{}.bias", prefix), self.bias.clone()));
        for (rel, weight) in &self.relation_weights {
            out.push((format!("{}.{}", prefix, rel), weight.clone()));
        }
    }

    fn to_device(&mut self, device: &Device) -> TrainResult<()> {
        move_var(&mut self.self_weight, device)?;
        move_var(&mut self.bias, device)?;
        for weight in self.relation_weights.values_mut() {
            move_var(weight, device)?;
        }
        Ok(())
    }
}

fn move_var(var: &mut Var, device: &Device) -> TrainResult<()> {
    let moved = var
        .as_tensor()
        .to_device(device)
        .and_then(|t| Var::from_tensor(&t))
        .map_err(|e| TrainError::tensor("parameter placement", e))?;
    *var = moved;
    Ok(())
}

/// Two-layer tower: project to hidden, relu, dropout in training, project
/// to the output embedding dimension.
#[derive(Debug)]
struct Tower {
    l1: RelationalLayer,
    l2: RelationalLayer,
}

impl Tower {
    fn init(
        in_dim: usize,
        hidden: usize,
        output: usize,
        relations: &BTreeMap<RelationId, String>,
        rng: &mut StdRng,
        device: &Device,
    ) -> TrainResult<Self> {
        Ok(Self {
            l1: RelationalLayer::init(in_dim, hidden, relations, rng, device)?,
            l2: RelationalLayer::init(hidden, output, relations, rng, device)?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        edges: &RelationEdgeMap,
        dropout: f32,
        training: bool,
    ) -> TrainResult<Tensor> {
        let mut h = self
            .l1
            .forward(x, edges)?
            .relu()
            .map_err(|e| TrainError::tensor("hidden activation", e))?;
        if training && dropout > 0.0 {
            h = ops::dropout(&h, dropout).map_err(|e| TrainError::tensor("dropout", e))?;
        }
        self.l2.forward(&h, edges)
    }

    fn collect_params(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.l1.collect_params(&format!("{}.l1", prefix), out);
        self.l2.collect_params(&format!("{}.l2", prefix), out);
    }

    fn to_device(&mut self, device: &Device) -> TrainResult<()> {
        self.l1.to_device(device)?;
        self.l2.to_device(device)
    }
}

/// The concrete shared model: one context tower, one meta tower, one
/// coupling projection.
#[derive(Debug)]
pub struct RelationalModel {
    device: Device,
    dropout: f32,
    meta_index: BTreeMap<ContextId, u32>,
    context_tower: Tower,
    meta_tower: Tower,
    couple: Var,
}

impl RelationalModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feature_dim: usize,
        meta_feature_dim: usize,
        relations: &BTreeMap<RelationId, String>,
        meta_relations: &BTreeMap<RelationId, String>,
        meta_index: BTreeMap<ContextId, u32>,
        hp: &Hyperparams,
        device: &Device,
        seed: u64,
    ) -> TrainResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            device: device.clone(),
            dropout: hp.dropout,
            meta_index,
            context_tower: Tower::init(
                feature_dim,
                hp.hidden,
                hp.output,
                relations,
                &mut rng,
                device,
            )?,
            meta_tower: Tower::init(
                meta_feature_dim,
                hp.hidden,
                hp.output,
                meta_relations,
                &mut rng,
                device,
            )?,
            couple: glorot_var(&mut rng, hp.output, hp.output, device)?,
        })
    }

    /// Convenience constructor reading dimensions and tables from the
    /// registry.
    pub fn from_registry(
        registry: &DatasetRegistry,
        hp: &Hyperparams,
        device: &Device,
        seed: u64,
    ) -> TrainResult<Self> {
        let feature_dim = registry
            .contexts()
            .values()
            .next()
            .map(|g| g.feature_dim())
            .unwrap_or(0);
        Self::new(
            feature_dim,
            registry.meta().feature_dim(),
            registry.relations(),
            registry.meta_relations(),
            registry.meta_index().clone(),
            hp,
            device,
            seed,
        )
    }

    fn named_params(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        self.context_tower.collect_params("context", &mut out);
        self.meta_tower.collect_params("meta", &mut out);
        out.push(("couple".to_string(), self.couple.clone()));
        out
    }

    fn check_device(&self, features: &Tensor, what: &str) -> TrainResult<()> {
        if !features.device().same_device(&self.device) {
            return Err(TrainError::DeviceMismatch {
                message: format!(
                    "{} features on {:?}, model on {:?}",
                    what,
                    features.device(),
                    self.device
                ),
            });
        }
        Ok(())
    }
}

impl SharedModel for RelationalModel {
    fn forward(
        &self,
        contexts: &PhaseBatch,
        meta: &GraphBatch,
        training: bool,
    ) -> TrainResult<ModelOutput> {
        let mut context_embeddings = BTreeMap::new();
        for (&ctx, batch) in &contexts.entries {
            self.check_device(&batch.features, "context")?;
            let emb = self.context_tower.forward(
                &batch.features,
                &batch.relation_edges,
                self.dropout,
                training,
            )?;
            context_embeddings.insert(ctx, emb);
        }

        self.check_device(&meta.features, "meta")?;
        let mut meta_embeddings = self.meta_tower.forward(
            &meta.features,
            &meta.relation_edges,
            self.dropout,
            training,
        )?;

        // Couple: pooled context embeddings feed each context's meta node.
        let mut pooled_rows = Vec::new();
        let mut meta_rows = Vec::new();
        for (ctx, emb) in &context_embeddings {
            if let Some(&node) = self.meta_index.get(ctx) {
                pooled_rows
                    .push(emb.mean(0).map_err(|e| TrainError::tensor("context pool", e))?);
                meta_rows.push(node);
            }
        }
        if !pooled_rows.is_empty() {
            let n_meta = meta_embeddings.dims()[0];
            let d = meta_embeddings.dims()[1];
            let pooled = Tensor::stack(&pooled_rows, 0)
                .and_then(|p| p.matmul(&self.couple))
                .map_err(|e| TrainError::tensor("coupling projection", e))?;
            let index = Tensor::from_vec(meta_rows.clone(), meta_rows.len(), &self.device)
                .map_err(|e| TrainError::tensor("coupling index", e))?;
            let injected = Tensor::zeros((n_meta, d), DType::F32, &self.device)
                .and_then(|z| z.index_add(&index, &pooled, 0))
                .map_err(|e| TrainError::tensor("coupling scatter", e))?;
            meta_embeddings = (meta_embeddings + injected)
                .map_err(|e| TrainError::tensor("coupling sum", e))?;
        }

        Ok(ModelOutput {
            context_embeddings,
            meta_embeddings,
        })
    }

    fn score(&self, embeddings: &Tensor, edges: &Tensor) -> TrainResult<Tensor> {
        if edges.dims()[1] == 0 {
            return Tensor::zeros(0, DType::F32, embeddings.device())
                .map_err(|e| TrainError::tensor("empty logits", e));
        }
        let src = edges
            .get(0)
            .map_err(|e| TrainError::tensor("score src row", e))?;
        let dst = edges
            .get(1)
            .map_err(|e| TrainError::tensor("score dst row", e))?;
        let src_emb = embeddings
            .index_select(&src, 0)
            .map_err(|e| TrainError::tensor("score src gather", e))?;
        let dst_emb = embeddings
            .index_select(&dst, 0)
            .map_err(|e| TrainError::tensor("score dst gather", e))?;
        (src_emb * dst_emb)
            .and_then(|p| p.sum(1))
            .map_err(|e| TrainError::tensor("score dot", e))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.named_params().into_iter().map(|(_, v)| v).collect()
    }

    fn snapshot(&self) -> TrainResult<ParamSnapshot> {
        let params = self.named_params();
        ParamSnapshot::capture(params.iter().map(|(n, v)| (n.as_str(), v)))
    }

    fn restore(&mut self, snapshot: &ParamSnapshot) -> TrainResult<()> {
        let params = self.named_params();
        snapshot.apply(params.iter().map(|(n, v)| (n.as_str(), v)), &self.device)
    }

    fn to_device(&mut self, device: &Device) -> TrainResult<()> {
        self.context_tower.to_device(device)?;
        self.meta_tower.to_device(device)?;
        move_var(&mut self.couple, device)?;
        self.device = device.clone();
        Ok(())
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
