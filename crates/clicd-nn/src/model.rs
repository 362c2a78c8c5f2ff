//! The CLICD sequential recommender.
//!
//! A bidirectional transformer over item sequences, trained either as a
//! cloze model (masked-item prediction) or on the graph-contrastive path,
//! where two GCN-smoothed item graphs (co-occurrence adjacency and
//! behavior similarity) supply extra views of the last item of every
//! sequence:
//!
//! ```text
//! seq ──► encoder ──────────────┐
//! adj ──► GCN ──► adj[last] ────┼──► agreement w ──► weighted CL + KL(w)
//! sim ──► GCN ──► sim[last] ────┘
//!          └────── fuse(seq, adj, sim) ──► logits over items ──► CE
//! ```
//!
//! The agreement weight scales the sequence-vs-graph term; its complement
//! (the personalization weight) scales the adjacency-vs-similarity term.

use crate::agreement::{kl_regularizer, personalization_weights, subgraph_agreement};
use crate::config::{ClAblation, ClicdConfig};
use crate::contrastive::ContrastiveLayer;
use crate::encoder::{bidirectional_mask, gather_positions, TransformerEncoder};
use crate::fusion::ViewFusion;
use crate::recommender::{ensure_finite, LossOutput, MetaParams, Objective, ParamId, Recommender};
use crate::smoother::GcnSmoother;
use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{layer_norm, Dropout, Init, LayerNorm, Module, VarBuilder, VarMap};
use clicd_core::interaction::{ITEM_ID, ITEM_ID_WITH_NEGS, ITEM_SEQ, ITEM_SEQ_LEN, USER_ID};
use clicd_core::{graph_augment, graph_dual_neighbor_readout, ExternalData, Interaction, ItemGraph};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tracing::{debug, info};

pub const MODEL_NAME: &str = "CLICD";
/// Rows of the task-length label table used by meta-learning.
pub const NUM_TASK_LABELS: usize = 6;
const FUSION_INIT_STD: f64 = 0.02;
const ONE_NEGATIVE_SCALE: f64 = 5.0;

/// Which persistent item graph to smooth over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphView {
    Adjacency,
    Similarity,
}

/// Dropout, GCN smoothing, then a residual LayerNorm.
struct GraphEncoder {
    smoother: GcnSmoother,
    norm: LayerNorm,
    dropout: Dropout,
}

impl GraphEncoder {
    fn forward<R: Rng + ?Sized>(&self, item_emb: &Tensor, graph: &mut ItemGraph, rng: &mut R, train: bool) -> Result<Tensor> {
        let emb = self.dropout.forward(item_emb, train)?;
        let light = self.smoother.forward(graph, &emb, rng, train)?;
        Ok(self.norm.forward(&(light + emb)?)?)
    }
}

/// Graph-smoothed item tables and their rows at each sequence's last item.
struct GraphOutputs {
    adj_all: Tensor,
    adj_last: Tensor,
    sim_last: Tensor,
}

pub struct Clicd {
    config: ClicdConfig,
    n_items: usize,
    device: Device,
    varmap: VarMap,
    item_embedding: Tensor,
    position_embedding: Tensor,
    task_length_embedding: Tensor,
    input_norm: LayerNorm,
    dropout: Dropout,
    encoder: TransformerEncoder,
    graph_encoder: GraphEncoder,
    contrastive: ContrastiveLayer,
    fusion: ViewFusion,
    data: ExternalData,
    rng: XorShiftRng,
    training: bool,
}

impl Clicd {
    /// Build a model over item ids `0..n_items` (0 is padding). Id `n_items`
    /// is the mask token, so the embedding table has `n_items + 1` rows and
    /// both graphs are widened to match.
    pub fn new(config: ClicdConfig, n_items: usize, mut data: ExternalData, device: &Device) -> Result<Self> {
        config.validate()?;
        if n_items < 2 {
            return Err(Error::InvalidConfig(format!("need at least one real item, got n_items = {n_items}")));
        }
        let nodes = n_items + 1;
        if data.num_items() > nodes {
            return Err(Error::InvalidConfig(format!(
                "graphs cover {} nodes but the model has {nodes} embedding rows",
                data.num_items()
            )));
        }
        data.adjacency.ensure_nodes(nodes);
        data.similarity.ensure_nodes(nodes);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let h = config.hidden_size;
        let init = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };
        let item_embedding = vb.get_with_hints((nodes, h), ParamId::ITEM_EMBEDDING.name(), init)?;
        let position_embedding =
            vb.get_with_hints((config.max_seq_length + 1, h), ParamId::POSITION_EMBEDDING.name(), init)?;
        let task_length_embedding = vb.get_with_hints(
            (NUM_TASK_LABELS, h),
            ParamId::TASK_LENGTH_EMBEDDING.name(),
            Init::Randn {
                mean: 0.0,
                stdev: FUSION_INIT_STD,
            },
        )?;

        let graph_encoder = GraphEncoder {
            smoother: GcnSmoother::new(config.graph_dropout_prob)?,
            norm: layer_norm(h, config.layer_norm_eps, vb.pp("gcn_norm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
        };

        info!(
            n_items,
            hidden = h,
            adjacency_edges = data.adjacency.edge_count(),
            similarity_edges = data.similarity.edge_count(),
            ablation = %config.cl_ablation,
            "built CLICD"
        );

        Ok(Self {
            n_items,
            device: device.clone(),
            item_embedding,
            position_embedding,
            task_length_embedding,
            input_norm: layer_norm(h, config.layer_norm_eps, vb.pp("input_norm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
            encoder: TransformerEncoder::new(&config, vb.pp("encoder"))?,
            graph_encoder,
            contrastive: ContrastiveLayer::new(h, config.cl_temp, config.initializer_range, vb.pp("contrastive"))?,
            fusion: ViewFusion::new(h, FUSION_INIT_STD, vb.pp("fusion"))?,
            rng: XorShiftRng::seed_from_u64(config.seed),
            data,
            varmap,
            config,
            training: true,
        })
    }

    pub fn config(&self) -> &ClicdConfig {
        &self.config
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn mask_token(&self) -> u32 {
        self.n_items as u32
    }

    pub fn external_data(&self) -> &ExternalData {
        &self.data
    }

    pub fn item_embedding(&self) -> &Tensor {
        &self.item_embedding
    }

    // =========================================================================
    // Encoders
    // =========================================================================

    fn embed(&self, item_seq: &Tensor, items: &Tensor, positions: &Tensor, label: Option<&Tensor>) -> Result<Tensor> {
        let (b, l) = item_seq.dims2()?;
        let max_positions = positions.dim(0)?;
        if l > max_positions {
            return Err(Error::DimensionMismatch {
                expected: max_positions,
                got: l,
            });
        }
        let h = items.dim(1)?;
        let ids = item_seq.to_dtype(DType::U32)?.flatten_all()?;
        let x = items.index_select(&ids, 0)?.reshape((b, l, h))?;
        let mut x = x.broadcast_add(&positions.narrow(0, 0, l)?)?;
        if let Some(label) = label {
            x = x.broadcast_add(label)?;
        }
        let x = self.input_norm.forward(&x)?;
        Ok(self.dropout.forward(&x, self.training)?)
    }

    fn encode_with(&self, item_seq: &Tensor, items: &Tensor, positions: &Tensor, label: Option<&Tensor>) -> Result<Tensor> {
        let x = self.embed(item_seq, items, positions, label)?;
        let mask = bidirectional_mask(item_seq, &self.device)?;
        self.encoder.forward(&x, &mask, self.training)
    }

    /// Full transformer output `(B, L, H)` for a padded `(B, L)` sequence batch.
    pub fn encode(&self, item_seq: &Tensor) -> Result<Tensor> {
        self.encode_with(item_seq, &self.item_embedding, &self.position_embedding, None)
    }

    /// Encoder output at each row's last valid position, `(B, H)`.
    pub fn sequence_output(&self, item_seq: &Tensor, lens: &[u32]) -> Result<Tensor> {
        gather_positions(&self.encode(item_seq)?, &last_positions(lens))
    }

    /// GCN-smoothed item table `(n_items + 1, H)` over one persistent graph.
    pub fn gcn_forward(&mut self, view: GraphView) -> Result<Tensor> {
        let graph = match view {
            GraphView::Adjacency => &mut self.data.adjacency,
            GraphView::Similarity => &mut self.data.similarity,
        };
        self.graph_encoder
            .forward(&self.item_embedding, graph, &mut self.rng, self.training)
    }

    fn gcn_forward_on(&mut self, graph: &mut ItemGraph) -> Result<Tensor> {
        self.graph_encoder
            .forward(&self.item_embedding, graph, &mut self.rng, self.training)
    }

    fn graph_outputs(&mut self, last: &Tensor) -> Result<GraphOutputs> {
        let adj_all = self.gcn_forward(GraphView::Adjacency)?;
        let sim_all = self.gcn_forward(GraphView::Similarity)?;
        Ok(GraphOutputs {
            adj_last: adj_all.index_select(last, 0)?,
            sim_last: sim_all.index_select(last, 0)?,
            adj_all,
        })
    }

    /// Agreement weights for a batch given its base adjacency output.
    fn agreement(
        &mut self,
        user_ids: &[u32],
        last_items: &[u32],
        lens: &[u32],
        seq_output: &Tensor,
        adj_all: &Tensor,
    ) -> Result<Tensor> {
        let mut aug_graph = graph_augment(&self.data.adjacency, user_ids, &self.data.user_edges);
        let aug_all = self.gcn_forward_on(&mut aug_graph)?;
        let last = self.index_tensor(last_items)?;
        let aug_last = aug_all.index_select(&last, 0)?;
        let readout = graph_dual_neighbor_readout(&self.data.adjacency, &aug_graph, last_items, adj_all, &mut self.rng)?;
        subgraph_agreement(
            seq_output,
            &aug_last,
            &readout.civil,
            &readout.foreign,
            lens,
            self.config.weight_mean,
        )
    }

    fn fuse(&self, seq: &Tensor, adj: &Tensor, sim: &Tensor) -> Result<Tensor> {
        if self.config.graph_view_fusion {
            self.fusion.forward(&[seq, adj, sim])
        } else {
            Ok(seq.clone())
        }
    }

    fn index_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::from_vec(ids.to_vec(), ids.len(), &self.device)?)
    }

    // =========================================================================
    // Training objectives
    // =========================================================================

    /// Cloze objective: append the target, mask positions at `mask_ratio`
    /// (at least one per row), predict the masked items.
    pub fn calculate_loss_masked(&mut self, batch: &Interaction) -> Result<LossOutput> {
        let seqs = batch.u32_rows(ITEM_SEQ)?;
        let lens = batch.u32_column(ITEM_SEQ_LEN)?;
        let targets = batch.u32_column(ITEM_ID)?;
        let b = seqs.len();
        let l = seqs.first().map_or(0, Vec::len);
        let cloze = cloze_mask(&seqs, &lens, &targets, self.mask_token(), self.config.mask_ratio, &mut self.rng);

        let masked = Tensor::from_vec(cloze.sequence, (b, l), &self.device)?;
        let output = self.encode(&masked)?;
        let h = output.dim(2)?;
        let hidden = output.reshape((b * l, h))?.index_select(&self.index_tensor(&cloze.positions)?, 0)?;
        let items = self.item_embedding.narrow(0, 0, self.n_items)?;
        let logits = hidden.matmul(&items.t()?)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &self.index_tensor(&cloze.labels)?)?;
        ensure_finite(&loss, "masked item loss")?;
        Ok(LossOutput::new(loss))
    }

    /// Graph-contrastive objective. Returns the recommendation loss with
    /// `cl` and `kl` auxiliaries.
    pub fn calculate_loss_graphcl(&mut self, batch: &Interaction) -> Result<LossOutput> {
        let user_ids = batch.u32_column(USER_ID)?;
        let item_seq = batch.get(ITEM_SEQ)?.to_dtype(DType::U32)?;
        let lens = batch.u32_column(ITEM_SEQ_LEN)?;
        let targets = batch.get(ITEM_ID)?.to_dtype(DType::U32)?;
        let last_items = last_items(&batch.u32_rows(ITEM_SEQ)?, &lens);
        let last = self.index_tensor(&last_items)?;

        let graphs = self.graph_outputs(&last)?;
        let seq_output = self.sequence_output(&item_seq, &lens)?;
        // Second pass under a fresh dropout mask.
        let aug_seq_output = self.sequence_output(&item_seq, &lens)?;

        let weights = self.agreement(&user_ids, &last_items, &lens, &seq_output, &graphs.adj_all)?;
        let kl = kl_regularizer(&weights, self.config.weight_mean, self.config.kl_weight, &mut self.rng)?;
        let cl = contrastive_objective(
            self.config.cl_ablation,
            &self.contrastive,
            &weights,
            &aug_seq_output,
            &graphs.adj_last,
            &graphs.sim_last,
        )?
        .affine(self.config.graphcl_coefficient, 0.0)?;

        let fused = self.fuse(&seq_output, &graphs.adj_last, &graphs.sim_last)?;
        let logits = fused.matmul(&self.item_embedding.t()?)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;
        ensure_finite(&loss, "graph recommendation loss")?;
        debug!(
            cl = cl.to_scalar::<f32>().unwrap_or(f32::NAN),
            kl = kl.to_scalar::<f32>().unwrap_or(f32::NAN),
            "graph path auxiliaries"
        );
        Ok(LossOutput::new(loss).with_auxiliary("cl", cl).with_auxiliary("kl", kl))
    }

    // =========================================================================
    // Inference
    // =========================================================================

    /// Sequence representation used for scoring, `(B, H)`.
    ///
    /// The graph path reads the fused view at the last item; the cloze path
    /// appends a mask token and reads the encoder output there.
    fn scoring_output(&mut self, batch: &Interaction) -> Result<Tensor> {
        let lens = batch.u32_column(ITEM_SEQ_LEN)?;
        if !self.config.graphcl_enable {
            let seqs = batch.u32_rows(ITEM_SEQ)?;
            let l = seqs.first().map_or(0, Vec::len);
            let mask = self.mask_token();
            let (appended, positions) = append_token(&seqs, &lens, mask);
            let seq = Tensor::from_vec(appended, (seqs.len(), l), &self.device)?;
            return gather_positions(&self.encode(&seq)?, &positions);
        }
        let item_seq = batch.get(ITEM_SEQ)?.to_dtype(DType::U32)?;
        let seq_output = self.sequence_output(&item_seq, &lens)?;
        if !self.config.graph_view_fusion {
            return Ok(seq_output);
        }
        let last = self.index_tensor(&last_items(&batch.u32_rows(ITEM_SEQ)?, &lens))?;
        let graphs = self.graph_outputs(&last)?;
        self.fuse(&seq_output, &graphs.adj_last, &graphs.sim_last)
    }

    fn score_candidates(&self, output: &Tensor, candidates: &Tensor) -> Result<Tensor> {
        let (b, c) = candidates.dims2()?;
        let h = output.dim(1)?;
        let ids = candidates.to_dtype(DType::U32)?.flatten_all()?;
        let emb = self.item_embedding.index_select(&ids, 0)?.reshape((b, c, h))?;
        Ok(emb.matmul(&output.unsqueeze(2)?)?.squeeze(2)?)
    }

    /// Scores for each row's positive-plus-negatives candidate list, `(B, C)`.
    pub fn fast_predict(&mut self, batch: &Interaction) -> Result<Tensor> {
        let output = self.scoring_output(batch)?;
        Ok(self.score_candidates(&output, batch.get(ITEM_ID_WITH_NEGS)?)?.detach())
    }

    /// [`Clicd::fast_predict`] on the fused view, plus each row's agreement
    /// (conformity) weight.
    pub fn fast_predict_with_conformity_weights(&mut self, batch: &Interaction) -> Result<(Tensor, Tensor)> {
        let user_ids = batch.u32_column(USER_ID)?;
        let item_seq = batch.get(ITEM_SEQ)?.to_dtype(DType::U32)?;
        let lens = batch.u32_column(ITEM_SEQ_LEN)?;
        let last_items = last_items(&batch.u32_rows(ITEM_SEQ)?, &lens);
        let last = self.index_tensor(&last_items)?;

        let seq_output = self.sequence_output(&item_seq, &lens)?;
        let graphs = self.graph_outputs(&last)?;
        let weights = self.agreement(&user_ids, &last_items, &lens, &seq_output, &graphs.adj_all)?;
        let fused = self
            .fusion
            .forward(&[&seq_output, &graphs.adj_last, &graphs.sim_last])?;
        let scores = self.score_candidates(&fused, batch.get(ITEM_ID_WITH_NEGS)?)?;
        Ok((scores.detach(), weights.detach()))
    }

    /// Fusion of the raw item table with both graph-smoothed tables,
    /// `(n_items + 1, H)`.
    pub fn get_fused_emb(&mut self) -> Result<Tensor> {
        let adj = self.gcn_forward(GraphView::Adjacency)?;
        let sim = self.gcn_forward(GraphView::Similarity)?;
        self.fusion.forward(&[&self.item_embedding, &adj, &sim])
    }

    /// Scores over items `0..n_items` for every row, `(B, n_items)`.
    pub fn full_sort_scores(&mut self, batch: &Interaction) -> Result<Tensor> {
        let output = self.scoring_output(batch)?;
        let items = self.item_embedding.narrow(0, 0, self.n_items)?;
        Ok(output.matmul(&items.t()?)?.detach())
    }

    // =========================================================================
    // Meta-learning
    // =========================================================================

    /// Predict each chunk's last valid item from the items before it, using
    /// `params` for the embedding tables. Rows with fewer than two items are
    /// skipped; an all-skipped batch has zero loss.
    pub fn meta_loss(&mut self, chunks: &Tensor, task_label: usize, params: &MetaParams) -> Result<Tensor> {
        let rows = chunks.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let pad = rows.first().map_or(0, Vec::len);
        let mask = self.mask_token();
        let mut sequence = Vec::new();
        let mut last = Vec::new();
        let mut labels = Vec::new();
        for row in &rows {
            let valid = row.iter().take_while(|&&i| i != 0).count();
            if valid < 2 {
                continue;
            }
            let mut row = row.clone();
            last.push(valid - 1);
            labels.push(row[valid - 1]);
            row[valid - 1] = mask;
            sequence.extend(row);
        }
        if labels.is_empty() {
            return Ok(Tensor::zeros((), DType::F32, &self.device)?);
        }

        let n = labels.len();
        let items = params.get(ParamId::ITEM_EMBEDDING)?;
        let label_row = params
            .get(ParamId::TASK_LENGTH_EMBEDDING)?
            .narrow(0, task_label.min(NUM_TASK_LABELS - 1), 1)?;
        let seq = Tensor::from_vec(sequence, (n, pad), &self.device)?;
        let output = self.encode_with(&seq, items, params.get(ParamId::POSITION_EMBEDDING)?, Some(&label_row))?;

        let hidden = gather_positions(&output, &last)?;
        let logits = hidden.matmul(&items.narrow(0, 0, self.n_items)?.t()?)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &self.index_tensor(&labels)?)?;
        ensure_finite(&loss, "meta loss")?;
        Ok(loss)
    }
}

impl Recommender for Clicd {
    fn name(&self) -> &str {
        MODEL_NAME
    }

    fn calculate_loss(&mut self, objective: Objective, batch: &Interaction) -> Result<LossOutput> {
        match objective {
            Objective::Recommendation if self.config.graphcl_enable => self.calculate_loss_graphcl(batch),
            Objective::Recommendation => self.calculate_loss_masked(batch),
            _ => Err(Error::Unsupported("non-recommendation objective")),
        }
    }

    fn predict(&mut self, batch: &Interaction) -> Result<Tensor> {
        let output = self.scoring_output(batch)?;
        let target = batch.get(ITEM_ID)?.to_dtype(DType::U32)?;
        let emb = self.item_embedding.index_select(&target, 0)?;
        Ok((output * emb)?.sum(1)?.detach())
    }

    fn full_sort_predict(&mut self, batch: &Interaction) -> Result<Option<Tensor>> {
        self.full_sort_scores(batch).map(Some)
    }

    fn fast_predict(&mut self, batch: &Interaction) -> Result<Option<Tensor>> {
        Clicd::fast_predict(self, batch).map(Some)
    }

    fn fast_predict_with_conformity(&mut self, batch: &Interaction) -> Result<Option<(Tensor, Tensor)>> {
        self.fast_predict_with_conformity_weights(batch).map(Some)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn meta_params(&self) -> Result<MetaParams> {
        Ok(MetaParams::new(vec![
            (ParamId::ITEM_EMBEDDING, self.item_embedding.clone()),
            (ParamId::POSITION_EMBEDDING, self.position_embedding.clone()),
            (ParamId::TASK_LENGTH_EMBEDDING, self.task_length_embedding.clone()),
        ]))
    }

    fn calculate_meta_loss(&mut self, chunks: &Tensor, task_label: usize, params: &MetaParams) -> Result<Tensor> {
        self.meta_loss(chunks, task_label, params)
    }

    fn set_training(&mut self, train: bool) {
        self.training = train;
    }
}

/// Per-ablation contrastive term before the coefficient is applied, reduced
/// by batch mean.
///
/// `seq_view` is the sequence encoding at the last item, `adj` and `sim` the
/// two graph views of that item, `weights` the agreement weights.
pub fn contrastive_objective(
    mode: ClAblation,
    layer: &ContrastiveLayer,
    weights: &Tensor,
    seq_view: &Tensor,
    adj: &Tensor,
    sim: &Tensor,
) -> Result<Tensor> {
    let per_sample = match mode {
        ClAblation::NoCl => return Ok(Tensor::zeros((), weights.dtype(), weights.device())?),
        ClAblation::Adj => (weights * layer.grace_loss(seq_view, adj)?)?,
        ClAblation::A2s => (personalization_weights(weights)? * layer.grace_loss(adj, sim)?)?,
        ClAblation::Static => (layer.grace_loss(seq_view, adj)? + layer.grace_loss(adj, sim)?)?.affine(0.5, 0.0)?,
        ClAblation::Full => weighted_pair(weights, &layer.grace_loss(seq_view, adj)?, &layer.grace_loss(adj, sim)?)?,
        ClAblation::PushAndPull => {
            let polar = weights.affine(1.0, -0.5)?.abs()?;
            let pull = (weights * layer.grace_loss(seq_view, adj)?)?;
            let push = (polar * layer.push_loss(adj, sim)?.affine(2.0, 0.0)?)?;
            (pull + push)?
        }
        ClAblation::VanillaLoss => {
            weighted_pair(weights, &layer.vanilla_loss(seq_view, adj)?, &layer.vanilla_loss(adj, sim)?)?
        }
        ClAblation::OneNeg => weighted_pair(
            weights,
            &layer.vanilla_loss_with_one_negative(seq_view, adj)?,
            &layer.vanilla_loss_with_one_negative(adj, sim)?,
        )?
        .affine(ONE_NEGATIVE_SCALE, 0.0)?,
    };
    Ok(per_sample.mean_all()?)
}

/// `w * seq_term + (max(w) - w) * graph_term`.
fn weighted_pair(weights: &Tensor, seq_term: &Tensor, graph_term: &Tensor) -> Result<Tensor> {
    let personal = personalization_weights(weights)?;
    Ok(((weights * seq_term)? + (personal * graph_term)?)?)
}

/// Last valid item of each row; 0 for empty rows.
pub fn last_items(seqs: &[Vec<u32>], lens: &[u32]) -> Vec<u32> {
    seqs.iter()
        .zip(lens)
        .map(|(row, &len)| match len as usize {
            0 => 0,
            n => row.get(n - 1).copied().unwrap_or(0),
        })
        .collect()
}

fn last_positions(lens: &[u32]) -> Vec<usize> {
    lens.iter().map(|&l| (l as usize).saturating_sub(1)).collect()
}

/// Place `token` after each row's last valid item, shifting the row left
/// when it is full. Returns the flattened rows and the token positions.
fn append_token(seqs: &[Vec<u32>], lens: &[u32], token: u32) -> (Vec<u32>, Vec<usize>) {
    let mut flat = Vec::with_capacity(seqs.iter().map(Vec::len).sum());
    let mut positions = Vec::with_capacity(seqs.len());
    for (row, &len) in seqs.iter().zip(lens) {
        let mut row = row.clone();
        let l = row.len();
        if l == 0 {
            positions.push(0);
            continue;
        }
        let len = (len as usize).min(l);
        let pos = if len < l {
            len
        } else {
            row.rotate_left(1);
            l - 1
        };
        row[pos] = token;
        positions.push(pos);
        flat.extend(row);
    }
    (flat, positions)
}

/// A cloze-masked batch: the masked rows (flattened), the flat indices of
/// masked positions, and the items originally at those positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Cloze {
    pub sequence: Vec<u32>,
    pub positions: Vec<u32>,
    pub labels: Vec<u32>,
}

/// Append each row's target, then mask every valid position with probability
/// `ratio`. A row that drew no mask has its final valid position masked.
pub fn cloze_mask<R: Rng + ?Sized>(
    seqs: &[Vec<u32>],
    lens: &[u32],
    targets: &[u32],
    mask_token: u32,
    ratio: f32,
    rng: &mut R,
) -> Cloze {
    let (mut sequence, ends) = append_token(seqs, lens, u32::MAX);
    let l = seqs.first().map_or(0, Vec::len);
    let mut positions = Vec::new();
    let mut labels = Vec::new();
    for (row, (&end, &target)) in ends.iter().zip(targets).enumerate() {
        if l == 0 {
            break;
        }
        let base = row * l;
        sequence[base + end] = target;
        let mut masked_any = false;
        for p in 0..=end {
            if rng.gen::<f32>() < ratio {
                labels.push(sequence[base + p]);
                positions.push((base + p) as u32);
                sequence[base + p] = mask_token;
                masked_any = true;
            }
        }
        if !masked_any {
            labels.push(sequence[base + end]);
            positions.push((base + end) as u32);
            sequence[base + end] = mask_token;
        }
    }
    Cloze {
        sequence,
        positions,
        labels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use std::collections::BTreeMap;

    fn small() -> ClicdConfig {
        ClicdConfig::default()
            .with_hidden_size(8)
            .with_layers(1, 2)
            .with_inner_size(16)
            .with_max_seq_length(4)
    }

    fn model(cfg: ClicdConfig) -> Clicd {
        let mut seqs = BTreeMap::new();
        seqs.insert(1u32, vec![1u32, 2, 3, 4]);
        seqs.insert(2, vec![2, 3, 5]);
        seqs.insert(3, vec![4, 5, 1]);
        let data = ExternalData::from_sequences(6, &seqs, 2).unwrap();
        Clicd::new(cfg, 6, data, &Device::Cpu).unwrap()
    }

    fn batch(seqs: Vec<u32>, lens: Vec<u32>) -> Interaction {
        let dev = Device::Cpu;
        let b = lens.len();
        let users: Vec<u32> = (1..=b as u32).collect();
        let targets: Vec<u32> = (0..b as u32).map(|i| 1 + i % 5).collect();
        let cands: Vec<u32> = targets.iter().flat_map(|&t| [t, 1 + t % 5, 1 + (t + 1) % 5]).collect();
        Interaction::from_fields([
            (USER_ID, Tensor::from_vec(users, b, &dev).unwrap()),
            (ITEM_SEQ, Tensor::from_vec(seqs, (b, 4), &dev).unwrap()),
            (ITEM_SEQ_LEN, Tensor::from_vec(lens, b, &dev).unwrap()),
            (ITEM_ID, Tensor::from_vec(targets, b, &dev).unwrap()),
            (ITEM_ID_WITH_NEGS, Tensor::from_vec(cands, (b, 3), &dev).unwrap()),
        ])
        .unwrap()
    }

    fn three_rows() -> Interaction {
        batch(vec![1, 2, 3, 0, 2, 3, 0, 0, 4, 5, 1, 2], vec![3, 2, 4])
    }

    #[test]
    fn test_graph_path_reports_components_and_restores_graphs() {
        let mut m = model(small());
        let adj_before = m.external_data().adjacency.edge_weights();
        let sim_before = m.external_data().similarity.edge_weights();
        let out = m.calculate_loss(Objective::Recommendation, &three_rows()).unwrap();
        assert_eq!(out.names(), vec!["loss", "cl", "kl"]);
        assert!(out.values().unwrap().iter().all(|v| v.is_finite()));
        assert_eq!(m.external_data().adjacency.edge_weights(), adj_before);
        assert_eq!(m.external_data().similarity.edge_weights(), sim_before);
    }

    #[test]
    fn test_masked_path_is_finite() {
        let mut m = model(small().with_graphcl(false));
        let out = m.calculate_loss(Objective::Recommendation, &three_rows()).unwrap();
        assert!(out.auxiliary.is_empty());
        assert!(out.values().unwrap()[0].is_finite());
    }

    #[test]
    fn test_gradients_reach_embeddings() {
        let mut m = model(small());
        let loss = m.calculate_loss(Objective::Recommendation, &three_rows()).unwrap();
        let grads = loss.total().unwrap().backward().unwrap();
        assert!(grads.get(m.item_embedding()).is_some());
    }

    #[test]
    fn test_all_length_one_rows_have_neutral_conformity() {
        let mut m = model(small());
        m.set_training(false);
        let b = batch(vec![1, 0, 0, 0, 3, 0, 0, 0, 5, 0, 0, 0], vec![1, 1, 1]);
        let (scores, weights) = m.fast_predict_with_conformity_weights(&b).unwrap();
        assert_eq!(scores.dims(), &[3, 3]);
        assert_eq!(weights.to_vec1::<f32>().unwrap(), vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_prediction_shapes() {
        let mut m = model(small());
        m.set_training(false);
        let b = three_rows();
        assert_eq!(Clicd::fast_predict(&mut m, &b).unwrap().dims(), &[3, 3]);
        assert_eq!(m.full_sort_scores(&b).unwrap().dims(), &[3, 6]);
        assert_eq!(m.predict(&b).unwrap().dims(), &[3]);
        assert_eq!(m.get_fused_emb().unwrap().dims(), &[7, 8]);
    }

    #[test]
    fn test_eval_mode_is_deterministic() {
        let mut m = model(small());
        m.set_training(false);
        let b = three_rows();
        let a = Clicd::fast_predict(&mut m, &b).unwrap().to_vec2::<f32>().unwrap();
        let c = Clicd::fast_predict(&mut m, &b).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_meta_loss_flows_through_given_params() {
        let mut m = model(small());
        let params = m.meta_params().unwrap();
        let chunks = Tensor::new(&[[1u32, 2, 3, 0], [4, 0, 0, 0], [2, 3, 5, 1]], &Device::Cpu).unwrap();
        let loss = m.calculate_meta_loss(&chunks, 2, &params).unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(params.get(ParamId::TASK_LENGTH_EMBEDDING).unwrap()).is_some());

        let short = Tensor::new(&[[4u32, 0, 0, 0]], &Device::Cpu).unwrap();
        assert_eq!(m.calculate_meta_loss(&short, 0, &params).unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_non_recommendation_objective_unsupported() {
        let mut m = model(small());
        assert!(matches!(
            m.calculate_loss(Objective::KnowledgeGraph, &three_rows()),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_cloze_always_masks_a_position() {
        let mut rng = StdRng::seed_from_u64(1);
        let seqs = vec![vec![1, 2, 0, 0], vec![1, 2, 3, 4]];
        let cloze = cloze_mask(&seqs, &[2, 4], &[9, 8], 99, 0.0, &mut rng);
        assert_eq!(cloze.sequence, vec![1, 2, 99, 0, 2, 3, 4, 99]);
        assert_eq!(cloze.positions, vec![2, 7]);
        assert_eq!(cloze.labels, vec![9, 8]);
    }

    #[test]
    fn test_cloze_full_ratio_masks_every_valid_position() {
        let mut rng = StdRng::seed_from_u64(1);
        let cloze = cloze_mask(&[vec![5, 6, 0]], &[2], &[7], 99, 1.0, &mut rng);
        assert_eq!(cloze.sequence, vec![99, 99, 99]);
        assert_eq!(cloze.labels, vec![5, 6, 7]);
    }

    #[test]
    fn test_nocl_contributes_nothing() {
        let vm = VarMap::new();
        let layer = ContrastiveLayer::new(4, 1.0, 0.02, VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu)).unwrap();
        let w = Tensor::new(&[0.2f32, 0.8], &Device::Cpu).unwrap();
        let v = Tensor::randn(0f32, 1f32, (2, 4), &Device::Cpu).unwrap();
        let zero = contrastive_objective(ClAblation::NoCl, &layer, &w, &v, &v, &v).unwrap();
        assert_eq!(zero.to_scalar::<f32>().unwrap(), 0.0);
        for mode in ClAblation::ALL {
            let l = contrastive_objective(mode, &layer, &w, &v, &v, &v).unwrap();
            assert!(l.to_scalar::<f32>().unwrap().is_finite(), "{mode}");
        }
    }
}
