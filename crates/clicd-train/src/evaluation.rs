//! Batch scoring for evaluation and a ranking-metric collector.
//!
//! Every evaluation loader declares an [`EvalKind`]; each kind has its own
//! scoring strategy and all of them produce a [`ScoredBatch`]:
//!
//! | Kind         | Scores             | Unscored entries |
//! |--------------|--------------------|------------------|
//! | `FullSort`   | `(B, n_items)`     | history and padding at -inf |
//! | `FastSample` | `(B, n_items)`     | non-candidates at -inf |
//! | `NegSample`  | `(B, n_items)` or `(N,)` for point-wise evaluation | -inf |
//!
//! # Metrics
//!
//! | Metric   | Range  | Description |
//! |----------|--------|-------------|
//! | Hit@k    | [0, 1] | Fraction with rank <= k |
//! | MRR@k    | [0, 1] | 1/rank when rank <= k, else 0 |
//! | NDCG@k   | [0, 1] | 1/log2(rank + 1) when rank <= k, else 0 |
//! | AUC      | [0, 1] | Point-wise evaluation only |

use crate::config::EvalType;
use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use clicd_core::interaction::{ITEM_ID, ITEM_ID_WITH_NEGS, ITEM_SEQ, ITEM_SEQ_LEN};
use clicd_core::{EvalBatch, EvalKind, EvalLoader, Interaction};
use clicd_nn::Recommender;
use std::collections::BTreeMap;

/// Scores of one evaluation batch in the shape the collector consumes.
#[derive(Debug, Clone)]
pub struct ScoredBatch {
    pub interaction: Interaction,
    pub scores: Tensor,
    /// Row of each positive; for point-wise scores, its index into `scores`.
    pub positive_u: Vec<u32>,
    pub positive_i: Vec<u32>,
}

/// Predict `batch` in consecutive chunks of at most `chunk` rows and
/// concatenate the scores in the original order.
pub fn split_predict<M: Recommender + ?Sized>(model: &mut M, batch: &Interaction, chunk: usize) -> Result<Tensor> {
    let parts = batch.split(chunk)?;
    let scores = parts
        .iter()
        .map(|part| model.predict(part).map_err(Error::from))
        .collect::<Result<Vec<_>>>()?;
    if scores.is_empty() {
        return Ok(Tensor::zeros(0, DType::F32, &batch.device())?);
    }
    Ok(Tensor::cat(&scores, 0)?)
}

/// Predict `batch`, splitting it only when it exceeds `eval_batch_size`.
fn predict_capped<M: Recommender + ?Sized>(model: &mut M, batch: &Interaction, eval_batch_size: usize) -> Result<Tensor> {
    if batch.len() <= eval_batch_size {
        Ok(model.predict(batch)?)
    } else {
        split_predict(model, batch, eval_batch_size)
    }
}

/// Score every item for every row; history items and the padding column are
/// forced to -inf.
///
/// Models without a catalog-wide scorer are evaluated by expanding every row
/// to one row per item.
pub fn full_sort_batch_eval<M: Recommender + ?Sized>(
    model: &mut M,
    batch: &EvalBatch,
    n_items: usize,
    eval_batch_size: usize,
) -> Result<ScoredBatch> {
    let inter = &batch.interaction;
    let scores = match model.full_sort_predict(inter)? {
        Some(scores) => scores,
        None => {
            let b = inter.len();
            let mut expanded = inter.repeat_interleave(n_items)?;
            let items: Vec<u32> = (0..b).flat_map(|_| 0..n_items as u32).collect();
            expanded.insert(ITEM_ID, Tensor::from_vec(items, b * n_items, &inter.device())?)?;
            predict_capped(model, &expanded, eval_batch_size)?.reshape((b, n_items))?
        }
    };

    let mut rows = scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    for row in rows.iter_mut() {
        if let Some(pad) = row.first_mut() {
            *pad = f32::NEG_INFINITY;
        }
    }
    if let Some((hist_u, hist_i)) = &batch.history_index {
        for (&u, &i) in hist_u.iter().zip(hist_i) {
            if let Some(cell) = rows.get_mut(u as usize).and_then(|r| r.get_mut(i as usize)) {
                *cell = f32::NEG_INFINITY;
            }
        }
    }
    let width = rows.first().map_or(n_items, Vec::len);
    Ok(ScoredBatch {
        interaction: inter.clone(),
        scores: matrix(rows, width, &inter.device())?,
        positive_u: batch.positive_u.clone(),
        positive_i: batch.positive_i.clone(),
    })
}

/// Score each row's fixed candidate list and scatter the scores into a
/// catalog-wide matrix.
pub fn fast_neg_batch_eval<M: Recommender + ?Sized>(
    model: &mut M,
    batch: &EvalBatch,
    n_items: usize,
    eval_batch_size: usize,
) -> Result<ScoredBatch> {
    let inter = &batch.interaction;
    let candidates = inter.u32_rows(ITEM_ID_WITH_NEGS)?;
    let scores = candidate_scores(model, inter, &candidates, eval_batch_size)?;

    let mut rows = vec![vec![f32::NEG_INFINITY; n_items]; candidates.len()];
    for ((row, cands), scores) in rows.iter_mut().zip(&candidates).zip(&scores) {
        for (&item, &s) in cands.iter().zip(scores) {
            if let Some(cell) = row.get_mut(item as usize) {
                *cell = s;
            }
        }
    }
    Ok(ScoredBatch {
        interaction: inter.clone(),
        scores: matrix(rows, n_items, &inter.device())?,
        positive_u: batch.positive_u.clone(),
        positive_i: batch.positive_i.clone(),
    })
}

/// `(B, C)` candidate scores, through the model's fast path when it has one.
fn candidate_scores<M: Recommender + ?Sized>(
    model: &mut M,
    inter: &Interaction,
    candidates: &[Vec<u32>],
    eval_batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    if let Some(scores) = model.fast_predict(inter)? {
        return Ok(scores.to_dtype(DType::F32)?.to_vec2::<f32>()?);
    }
    let width = candidates.first().map_or(0, Vec::len);
    let b = candidates.len();
    let mut expanded = inter.repeat_interleave(width)?;
    let items: Vec<u32> = candidates.iter().flatten().copied().collect();
    expanded.insert(ITEM_ID, Tensor::from_vec(items, b * width, &inter.device())?)?;
    let flat = predict_capped(model, &expanded, eval_batch_size)?;
    Ok(flat.reshape((b, width))?.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

/// Point-wise scoring of `(user, candidate)` rows. `Value` evaluation keeps
/// the flat scores; `Ranking` scatters them per user.
pub fn neg_sample_batch_eval<M: Recommender + ?Sized>(
    model: &mut M,
    batch: &EvalBatch,
    n_items: usize,
    eval_batch_size: usize,
    eval_type: EvalType,
) -> Result<ScoredBatch> {
    let inter = &batch.interaction;
    let row_index = batch
        .row_index
        .as_ref()
        .ok_or_else(|| Error::InvalidConfig("negative-sample batch without row index".into()))?;
    let flat = predict_capped(model, inter, eval_batch_size)?.to_dtype(DType::F32)?;
    let items = inter.u32_column(ITEM_ID)?;

    match eval_type {
        EvalType::Value => {
            let (positive_u, positive_i): (Vec<u32>, Vec<u32>) = row_index
                .iter()
                .zip(&items)
                .enumerate()
                .filter(|(_, (&row, &item))| batch.positive_i.get(row as usize) == Some(&item))
                .map(|(j, (_, &item))| (j as u32, item))
                .unzip();
            Ok(ScoredBatch {
                interaction: inter.clone(),
                scores: flat,
                positive_u,
                positive_i,
            })
        }
        EvalType::Ranking => {
            let values = flat.to_vec1::<f32>()?;
            let mut rows = vec![vec![f32::NEG_INFINITY; n_items]; batch.positive_u.len()];
            for ((&row, &item), &s) in row_index.iter().zip(&items).zip(&values) {
                if let Some(cell) = rows.get_mut(row as usize).and_then(|r| r.get_mut(item as usize)) {
                    *cell = s;
                }
            }
            Ok(ScoredBatch {
                interaction: inter.clone(),
                scores: matrix(rows, n_items, &inter.device())?,
                positive_u: batch.positive_u.clone(),
                positive_i: batch.positive_i.clone(),
            })
        }
    }
}

/// Dispatch on the loader's declared kind.
pub fn eval_batch<M: Recommender + ?Sized>(
    model: &mut M,
    kind: EvalKind,
    batch: &EvalBatch,
    n_items: usize,
    eval_batch_size: usize,
    eval_type: EvalType,
) -> Result<ScoredBatch> {
    match kind {
        EvalKind::FullSort => full_sort_batch_eval(model, batch, n_items, eval_batch_size),
        EvalKind::FastSample => fast_neg_batch_eval(model, batch, n_items, eval_batch_size),
        EvalKind::NegSample => neg_sample_batch_eval(model, batch, n_items, eval_batch_size, eval_type),
    }
}

fn matrix(rows: Vec<Vec<f32>>, width: usize, device: &Device) -> Result<Tensor> {
    let b = rows.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (b, width), device)?)
}

// =============================================================================
// Metrics
// =============================================================================

/// Named metric values, keyed like `mrr@10`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalResult(pub BTreeMap<String, f64>);

impl EvalResult {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(&key.to_ascii_lowercase()).copied()
    }

    /// `key : value` pairs on one line.
    pub fn summary(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k} : {v:.4}"))
            .collect::<Vec<_>>()
            .join("    ")
    }
}

/// Collects positive-item ranks (or point-wise scores) across batches.
#[derive(Debug, Clone)]
pub struct RankingEvaluator {
    topk: Vec<usize>,
    ranks: Vec<usize>,
    pointwise: Vec<(f32, bool)>,
}

impl RankingEvaluator {
    pub fn new(topk: &[usize]) -> Self {
        Self {
            topk: topk.to_vec(),
            ranks: Vec::new(),
            pointwise: Vec::new(),
        }
    }

    pub fn num_collected(&self) -> usize {
        self.ranks.len() + self.pointwise.len()
    }

    pub fn collect(&mut self, batch: &ScoredBatch) -> Result<()> {
        if batch.scores.rank() == 1 {
            let scores = batch.scores.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            let mut labels = vec![false; scores.len()];
            for &j in &batch.positive_u {
                if let Some(l) = labels.get_mut(j as usize) {
                    *l = true;
                }
            }
            self.pointwise.extend(scores.into_iter().zip(labels));
            return Ok(());
        }
        let rows = batch.scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        for (&u, &i) in batch.positive_u.iter().zip(&batch.positive_i) {
            let row = rows
                .get(u as usize)
                .ok_or_else(|| Error::InvalidConfig(format!("positive row {u} outside score matrix")))?;
            self.ranks.push(rank_of(row, i as usize));
        }
        Ok(())
    }

    pub fn evaluate(&self) -> EvalResult {
        let mut out = BTreeMap::new();
        if !self.ranks.is_empty() {
            let n = self.ranks.len() as f64;
            for &k in &self.topk {
                let within = || self.ranks.iter().copied().filter(move |&r| r <= k);
                out.insert(format!("hit@{k}"), within().count() as f64 / n);
                out.insert(format!("mrr@{k}"), within().map(|r| 1.0 / r as f64).sum::<f64>() / n);
                out.insert(
                    format!("ndcg@{k}"),
                    within().map(|r| 1.0 / ((r + 1) as f64).log2()).sum::<f64>() / n,
                );
            }
        }
        if !self.pointwise.is_empty() {
            out.insert("auc".to_string(), auc(&self.pointwise));
        }
        EvalResult(out)
    }
}

/// 1-based rank of `item` in `row`: one plus the number of strictly higher
/// scores. A -inf positive ranks last.
fn rank_of(row: &[f32], item: usize) -> usize {
    let Some(&target) = row.get(item) else {
        return row.len();
    };
    if target == f32::NEG_INFINITY {
        return row.len();
    }
    1 + row.iter().filter(|&&s| s > target).count()
}

/// Mann-Whitney AUC with averaged ranks for ties.
fn auc(samples: &[(f32, bool)]) -> f64 {
    let n_pos = samples.iter().filter(|(_, l)| *l).count();
    let n_neg = samples.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }
    let mut sorted: Vec<(f32, bool)> = samples.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += avg * sorted[i..=j].iter().filter(|(_, l)| *l).count() as f64;
        i = j + 1;
    }
    (rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0) / (n_pos * n_neg) as f64
}

// =============================================================================
// Per-user reports
// =============================================================================

/// Per-user ranking detail from fixed candidate lists.
#[derive(Debug, Clone, Default)]
pub struct RankReport {
    pub sequences: Vec<Vec<u32>>,
    pub positive_items: Vec<u32>,
    /// 0-based position of the positive among its candidates when sorted by
    /// descending score.
    pub positive_ranks: Vec<usize>,
    /// The ten best-scored candidate ids, best first.
    pub top_items: Vec<Vec<u32>>,
    /// Agreement weight per user, when requested.
    pub conformity: Option<Vec<f32>>,
}

pub const REPORT_TOP_K: usize = 10;

/// Positive ranks and top candidates for every user of a fast-sample loader.
pub fn fast_eval_return_rank<M: Recommender + ?Sized>(model: &mut M, loader: &EvalLoader) -> Result<RankReport> {
    rank_report(model, loader, false)
}

/// [`fast_eval_return_rank`] plus each user's conformity weight.
pub fn fast_eval_return_conformity<M: Recommender + ?Sized>(model: &mut M, loader: &EvalLoader) -> Result<RankReport> {
    rank_report(model, loader, true)
}

fn rank_report<M: Recommender + ?Sized>(model: &mut M, loader: &EvalLoader, conformity: bool) -> Result<RankReport> {
    if loader.kind() != EvalKind::FastSample {
        return Err(Error::InvalidConfig(format!(
            "rank reports need a fast-sample loader, got {:?}",
            loader.kind()
        )));
    }
    let mut report = RankReport {
        conformity: conformity.then(Vec::new),
        ..RankReport::default()
    };
    for batch in loader.batches()? {
        let inter = &batch.interaction;
        let candidates = inter.u32_rows(ITEM_ID_WITH_NEGS)?;
        let scores = if conformity {
            let (scores, weights) = model
                .fast_predict_with_conformity(inter)?
                .ok_or_else(|| Error::InvalidConfig(format!("{} has no conformity weights", model.name())))?;
            if let Some(all) = report.conformity.as_mut() {
                all.extend(weights.to_dtype(DType::F32)?.to_vec1::<f32>()?);
            }
            scores.to_dtype(DType::F32)?.to_vec2::<f32>()?
        } else {
            candidate_scores(model, inter, &candidates, usize::MAX)?
        };

        let seqs = inter.u32_rows(ITEM_SEQ)?;
        let lens = inter.u32_column(ITEM_SEQ_LEN)?;
        for (((seq, len), cands), row) in seqs.into_iter().zip(lens).zip(&candidates).zip(&scores) {
            let mut order: Vec<usize> = (0..row.len()).collect();
            order.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
            let rank = order.iter().position(|&c| c == 0).unwrap_or(order.len());
            report.sequences.push(seq[..(len as usize).min(seq.len())].to_vec());
            report.positive_items.push(cands.first().copied().unwrap_or(0));
            report.positive_ranks.push(rank);
            report
                .top_items
                .push(order.iter().take(REPORT_TOP_K).map(|&c| cands[c]).collect());
        }
    }
    Ok(report)
}
