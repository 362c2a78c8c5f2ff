//! In-memory sequential dataset with leave-one-out splits and batch loaders.
//!
//! Input records are `(user, item, timestamp)` triples with dense integer
//! ids; item id 0 is reserved for padding.

use crate::interaction::{ITEM_ID, ITEM_ID_WITH_NEGS, ITEM_SEQ, ITEM_SEQ_LEN, USER_ID};
use crate::{Error, Interaction, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// One timestamped interaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub user: u32,
    pub item: u32,
    pub timestamp: f64,
}

/// Read `user<TAB>item<TAB>timestamp` lines. Blank lines and `#` comments
/// are skipped; a non-numeric first line is treated as a header.
pub fn read_interactions(path: impl AsRef<Path>) -> Result<Vec<InteractionRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split(['\t', ',', ' ']).filter(|c| !c.is_empty()).collect();
        if lineno == 0 && cols.first().map_or(false, |c| c.parse::<u32>().is_err()) {
            continue;
        }
        let parse_err = |message: String| Error::Parse { line: lineno + 1, message };
        if cols.len() < 2 {
            return Err(parse_err(format!("expected at least 2 columns, got {}", cols.len())));
        }
        let user = cols[0].parse().map_err(|e| parse_err(format!("user: {e}")))?;
        let item = cols[1].parse().map_err(|e| parse_err(format!("item: {e}")))?;
        let timestamp = match cols.get(2) {
            Some(t) => t.parse().map_err(|e| parse_err(format!("timestamp: {e}")))?,
            None => records.len() as f64,
        };
        records.push(InteractionRecord { user, item, timestamp });
    }
    Ok(records)
}

/// How an evaluation loader expects its batches to be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalKind {
    /// Score the whole catalog, masking history.
    FullSort,
    /// Score a fixed candidate list per user (positive + negatives).
    FastSample,
    /// One row per (user, candidate) pair.
    NegSample,
}

impl FromStr for EvalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" | "full_sort" | "fullsort" => Ok(Self::FullSort),
            "fast" | "fast_sample" | "fastsample" => Ok(Self::FastSample),
            "neg" | "neg_sample" | "negsample" | "uni100" => Ok(Self::NegSample),
            other => Err(Error::InvalidConfig(format!("unknown evaluation kind `{other}`"))),
        }
    }
}

/// A history prefix and the item that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSample {
    pub user: u32,
    pub history: Vec<u32>,
    pub target: u32,
}

/// Train/valid/test samples from a leave-one-out split.
#[derive(Debug, Clone, Default)]
pub struct DatasetSplit {
    pub train: Vec<SequenceSample>,
    pub valid: Vec<SequenceSample>,
    pub test: Vec<SequenceSample>,
}

/// Chronological item sequences per user.
#[derive(Debug, Clone)]
pub struct SequentialDataset {
    name: String,
    num_items: usize,
    max_seq_length: usize,
    sequences: BTreeMap<u32, Vec<u32>>,
}

impl SequentialDataset {
    /// Group records by user and order each history by timestamp.
    pub fn from_records(name: impl Into<String>, records: &[InteractionRecord], max_seq_length: usize) -> Result<Self> {
        if max_seq_length == 0 {
            return Err(Error::InvalidConfig("max_seq_length must be positive".into()));
        }
        if let Some(r) = records.iter().find(|r| r.item == 0) {
            return Err(Error::InvalidConfig(format!(
                "item id 0 is reserved for padding (user {})",
                r.user
            )));
        }
        let mut by_user: BTreeMap<u32, Vec<(f64, u32)>> = BTreeMap::new();
        for r in records {
            by_user.entry(r.user).or_default().push((r.timestamp, r.item));
        }
        let sequences = by_user
            .into_iter()
            .map(|(u, mut events)| {
                events.sort_by(|a, b| a.0.total_cmp(&b.0));
                (u, events.into_iter().map(|(_, i)| i).collect())
            })
            .collect();
        let num_items = records.iter().map(|r| r.item as usize).max().unwrap_or(0) + 1;
        Ok(Self {
            name: name.into(),
            num_items,
            max_seq_length,
            sequences,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Item count including padding id 0.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn num_users(&self) -> usize {
        self.sequences.len()
    }

    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    pub fn sequences(&self) -> &BTreeMap<u32, Vec<u32>> {
        &self.sequences
    }

    /// Training prefixes for every position but the last two; the
    /// second-to-last item validates and the last item tests.
    pub fn split_leave_one_out(&self) -> DatasetSplit {
        let mut split = DatasetSplit::default();
        for (&user, seq) in &self.sequences {
            let n = seq.len();
            let train_end = if n >= 3 { n - 2 } else { n };
            for t in 1..train_end {
                split.train.push(self.sample(user, &seq[..t], seq[t]));
            }
            if n >= 3 {
                split.valid.push(self.sample(user, &seq[..n - 2], seq[n - 2]));
                split.test.push(self.sample(user, &seq[..n - 1], seq[n - 1]));
            }
        }
        split
    }

    fn sample(&self, user: u32, history: &[u32], target: u32) -> SequenceSample {
        let start = history.len().saturating_sub(self.max_seq_length);
        SequenceSample {
            user,
            history: history[start..].to_vec(),
            target,
        }
    }
}

/// Pack samples into an [`Interaction`] with left-aligned, zero-padded sequences.
pub fn build_batch(samples: &[&SequenceSample], max_seq_length: usize, device: &Device) -> Result<Interaction> {
    let b = samples.len();
    let mut seq = vec![0u32; b * max_seq_length];
    for (row, s) in samples.iter().enumerate() {
        let take = s.history.len().min(max_seq_length);
        seq[row * max_seq_length..row * max_seq_length + take].copy_from_slice(&s.history[s.history.len() - take..]);
    }
    let lens: Vec<u32> = samples.iter().map(|s| s.history.len().min(max_seq_length) as u32).collect();
    Interaction::from_fields([
        (USER_ID, Tensor::from_vec(samples.iter().map(|s| s.user).collect::<Vec<_>>(), b, device)?),
        (ITEM_SEQ, Tensor::from_vec(seq, (b, max_seq_length), device)?),
        (ITEM_SEQ_LEN, Tensor::from_vec(lens, b, device)?),
        (ITEM_ID, Tensor::from_vec(samples.iter().map(|s| s.target).collect::<Vec<_>>(), b, device)?),
    ])
}

/// Mini-batch loader over training samples.
pub struct SequenceLoader {
    samples: Vec<SequenceSample>,
    batch_size: usize,
    max_seq_length: usize,
    shuffle: bool,
    rng: StdRng,
    device: Device,
}

impl SequenceLoader {
    pub fn new(samples: Vec<SequenceSample>, batch_size: usize, max_seq_length: usize, seed: u64) -> Self {
        Self {
            samples,
            batch_size: batch_size.max(1),
            max_seq_length,
            shuffle: true,
            rng: StdRng::seed_from_u64(seed),
            device: Device::Cpu,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// All batches of one pass, reshuffled each call when shuffling is on.
    pub fn batches(&mut self) -> Result<Vec<Interaction>> {
        if self.shuffle {
            self.samples.shuffle(&mut self.rng);
        }
        let refs: Vec<&SequenceSample> = self.samples.iter().collect();
        refs.chunks(self.batch_size)
            .map(|chunk| build_batch(chunk, self.max_seq_length, &self.device))
            .collect()
    }
}

/// One evaluation batch with the indices the scorer needs.
#[derive(Debug, Clone)]
pub struct EvalBatch {
    pub interaction: Interaction,
    /// `(row, item)` pairs to mask to negative infinity in full-sort scoring.
    pub history_index: Option<(Vec<u32>, Vec<u32>)>,
    /// For negative-sample batches: which user row each interaction row belongs to.
    pub row_index: Option<Vec<u32>>,
    pub positive_u: Vec<u32>,
    pub positive_i: Vec<u32>,
}

/// Evaluation loader that declares how its batches must be scored.
pub struct EvalLoader {
    kind: EvalKind,
    samples: Vec<SequenceSample>,
    seen: Vec<HashSet<u32>>,
    negatives: Vec<Vec<u32>>,
    batch_size: usize,
    max_seq_length: usize,
    num_items: usize,
    device: Device,
}

impl EvalLoader {
    /// `sequences` supplies each user's full history, used both for masking
    /// and for excluding positives from sampled negatives.
    pub fn new(
        kind: EvalKind,
        samples: Vec<SequenceSample>,
        sequences: &BTreeMap<u32, Vec<u32>>,
        num_items: usize,
        batch_size: usize,
        max_seq_length: usize,
        num_negatives: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let seen: Vec<HashSet<u32>> = samples
            .iter()
            .map(|s| sequences.get(&s.user).map(|q| q.iter().copied().collect()).unwrap_or_default())
            .collect();
        let mut negatives: Vec<Vec<u32>> = match kind {
            EvalKind::FullSort => Vec::new(),
            EvalKind::FastSample | EvalKind::NegSample => seen
                .iter()
                .map(|pos| sample_negatives(pos, num_items, num_negatives, &mut rng))
                .collect(),
        };
        // candidate lists must stay rectangular
        let width = negatives.iter().map(Vec::len).min().unwrap_or(0);
        if negatives.iter().any(|n| n.len() > width) {
            debug!("catalog too small for {num_negatives} negatives per user; keeping {width}");
            negatives.iter_mut().for_each(|n| n.truncate(width));
        }
        Self {
            kind,
            samples,
            seen,
            negatives,
            batch_size: batch_size.max(1),
            max_seq_length,
            num_items,
            device: Device::Cpu,
        }
    }

    pub fn kind(&self) -> EvalKind {
        self.kind
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn batches(&self) -> Result<Vec<EvalBatch>> {
        let mut out = Vec::new();
        for start in (0..self.samples.len()).step_by(self.batch_size) {
            let end = (start + self.batch_size).min(self.samples.len());
            out.push(self.batch(start, end)?);
        }
        Ok(out)
    }

    fn batch(&self, start: usize, end: usize) -> Result<EvalBatch> {
        let refs: Vec<&SequenceSample> = self.samples[start..end].iter().collect();
        let mut interaction = build_batch(&refs, self.max_seq_length, &self.device)?;
        let b = refs.len();
        let positive_u: Vec<u32> = (0..b as u32).collect();
        let positive_i: Vec<u32> = refs.iter().map(|s| s.target).collect();

        match self.kind {
            EvalKind::FullSort => {
                let (mut rows, mut cols) = (Vec::new(), Vec::new());
                for (row, s) in refs.iter().enumerate() {
                    for &item in &s.history {
                        rows.push(row as u32);
                        cols.push(item);
                    }
                }
                Ok(EvalBatch {
                    interaction,
                    history_index: Some((rows, cols)),
                    row_index: None,
                    positive_u,
                    positive_i,
                })
            }
            EvalKind::FastSample => {
                let width = 1 + self.negatives.first().map_or(0, Vec::len);
                let mut cands = Vec::with_capacity(b * width);
                for (offset, s) in refs.iter().enumerate() {
                    cands.push(s.target);
                    cands.extend(&self.negatives[start + offset]);
                }
                interaction.insert(ITEM_ID_WITH_NEGS, Tensor::from_vec(cands, (b, width), &self.device)?)?;
                Ok(EvalBatch {
                    interaction,
                    history_index: None,
                    row_index: None,
                    positive_u,
                    positive_i,
                })
            }
            EvalKind::NegSample => {
                let mut rows = Vec::new();
                let mut items = Vec::new();
                for (offset, s) in refs.iter().enumerate() {
                    rows.push(offset as u32);
                    items.push(s.target);
                    for &neg in &self.negatives[start + offset] {
                        rows.push(offset as u32);
                        items.push(neg);
                    }
                }
                let row_t = Tensor::from_vec(rows.clone(), rows.len(), &self.device)?;
                let mut expanded = interaction.index_select(&row_t)?;
                expanded.insert(ITEM_ID, Tensor::from_vec(items, rows.len(), &self.device)?)?;
                Ok(EvalBatch {
                    interaction: expanded,
                    history_index: None,
                    row_index: Some(rows),
                    positive_u,
                    positive_i,
                })
            }
        }
    }

    /// Full history of the sample at `idx`.
    pub fn seen_items(&self, idx: usize) -> Option<&HashSet<u32>> {
        self.seen.get(idx)
    }
}

/// Uniform negatives from `1..num_items`, excluding `positives`. Returns fewer
/// than `n` when the catalog is too small.
fn sample_negatives<R: Rng + ?Sized>(positives: &HashSet<u32>, num_items: usize, n: usize, rng: &mut R) -> Vec<u32> {
    let available = (1..num_items as u32).filter(|i| !positives.contains(i)).count();
    let want = n.min(available);
    let mut picked = HashSet::with_capacity(want);
    let mut out = Vec::with_capacity(want);
    while out.len() < want {
        let item = rng.gen_range(1..num_items as u32);
        if !positives.contains(&item) && picked.insert(item) {
            out.push(item);
        }
    }
    out
}
