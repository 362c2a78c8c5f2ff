//! Named, batch-aligned tensor fields.
//!
//! An [`Interaction`] is the unit of data flowing from loaders into models:
//! every field shares the same leading (batch) dimension, which is checked on
//! insertion so downstream code can slice rows without re-validating.

use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;

/// User id per row, shape `(B,)`.
pub const USER_ID: &str = "user_id";
/// Left-aligned, zero-padded item sequence, shape `(B, L)`.
pub const ITEM_SEQ: &str = "item_id_list";
/// Number of valid items in [`ITEM_SEQ`], shape `(B,)`.
pub const ITEM_SEQ_LEN: &str = "item_length";
/// Target item per row, shape `(B,)`.
pub const ITEM_ID: &str = "item_id";
/// Positive item followed by fixed negatives, shape `(B, 1 + negatives)`.
pub const ITEM_ID_WITH_NEGS: &str = "item_id_with_negs";

/// A batch of interactions keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct Interaction {
    fields: BTreeMap<String, Tensor>,
    len: Option<usize>,
}

impl Interaction {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from `(name, tensor)` pairs.
    pub fn from_fields<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Tensor)>,
        S: Into<String>,
    {
        let mut inter = Self::new();
        for (name, tensor) in fields {
            inter.insert(name, tensor)?;
        }
        Ok(inter)
    }

    /// Insert or replace a field. Fails if its leading dimension disagrees
    /// with the fields already present.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        let name = name.into();
        let rows = leading_dim(&name, &tensor)?;
        if let Some(len) = self.len {
            let replacing_only = self.fields.len() == 1 && self.fields.contains_key(&name);
            if len != rows && !replacing_only {
                return Err(Error::InvalidBatch(format!(
                    "field `{name}` has {rows} rows, batch has {len}"
                )));
            }
        }
        self.len = Some(rows);
        self.fields.insert(name, tensor);
        Ok(())
    }

    /// Merge every field of `other` into `self`.
    pub fn update(&mut self, other: &Interaction) -> Result<()> {
        for (name, tensor) in &other.fields {
            self.insert(name.clone(), tensor.clone())?;
        }
        Ok(())
    }

    /// Look up a field, failing with [`Error::InvalidBatch`] if absent.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::InvalidBatch(format!("missing field `{name}`")))
    }

    pub fn try_get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.len.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn device(&self) -> Device {
        self.fields
            .values()
            .next()
            .map_or(Device::Cpu, |t| t.device().clone())
    }

    /// Rows `start..start + len` of every field.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        let mut out = Self::new();
        for (name, tensor) in &self.fields {
            out.insert(name.clone(), tensor.narrow(0, start, len)?)?;
        }
        Ok(out)
    }

    /// Split into consecutive chunks of at most `chunk` rows, in order.
    pub fn split(&self, chunk: usize) -> Result<Vec<Self>> {
        if chunk == 0 {
            return Err(Error::InvalidConfig("split chunk size must be positive".into()));
        }
        let total = self.len();
        let mut parts = Vec::with_capacity(total.div_ceil(chunk));
        let mut start = 0;
        while start < total {
            let len = chunk.min(total - start);
            parts.push(self.narrow(start, len)?);
            start += len;
        }
        Ok(parts)
    }

    /// Select rows by index (U32 tensor of shape `(K,)`).
    pub fn index_select(&self, rows: &Tensor) -> Result<Self> {
        let mut out = Self::new();
        for (name, tensor) in &self.fields {
            out.insert(name.clone(), tensor.index_select(rows, 0)?)?;
        }
        Ok(out)
    }

    /// Repeat every row `n` times consecutively: `[a, b] -> [a, a, b, b]` for `n = 2`.
    pub fn repeat_interleave(&self, n: usize) -> Result<Self> {
        let rows: Vec<u32> = (0..self.len() as u32)
            .flat_map(|r| std::iter::repeat(r).take(n))
            .collect();
        let rows = Tensor::from_vec(rows, self.len() * n, &self.device())?;
        self.index_select(&rows)
    }

    /// Concatenate batches with identical field sets along the batch axis.
    pub fn cat(parts: &[Interaction]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Ok(Self::new());
        };
        let mut out = Self::new();
        for name in first.fields.keys() {
            let tensors = parts
                .iter()
                .map(|p| p.get(name).cloned())
                .collect::<Result<Vec<_>>>()?;
            out.insert(name.clone(), Tensor::cat(&tensors, 0)?)?;
        }
        Ok(out)
    }

    /// Read a rank-1 integer field as `u32`s.
    pub fn u32_column(&self, name: &str) -> Result<Vec<u32>> {
        Ok(self.get(name)?.to_dtype(DType::U32)?.to_vec1::<u32>()?)
    }

    /// Read a rank-2 integer field as rows of `u32`s.
    pub fn u32_rows(&self, name: &str) -> Result<Vec<Vec<u32>>> {
        Ok(self.get(name)?.to_dtype(DType::U32)?.to_vec2::<u32>()?)
    }
}

fn leading_dim(name: &str, tensor: &Tensor) -> Result<usize> {
    tensor
        .dims()
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidBatch(format!("field `{name}` is a scalar")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> Interaction {
        let dev = Device::Cpu;
        let users: Vec<u32> = (0..n as u32).collect();
        let seqs: Vec<u32> = (0..(n * 3) as u32).collect();
        Interaction::from_fields([
            (USER_ID, Tensor::from_vec(users, n, &dev).unwrap()),
            (ITEM_SEQ, Tensor::from_vec(seqs, (n, 3), &dev).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn test_misaligned_field_rejected() {
        let mut inter = batch(4);
        let bad = Tensor::zeros(3, DType::U32, &Device::Cpu).unwrap();
        assert!(inter.insert(ITEM_ID, bad).is_err());
        assert_eq!(inter.len(), 4);
    }

    #[test]
    fn test_missing_field_is_error() {
        let inter = batch(2);
        assert!(inter.get(ITEM_ID).is_err());
        assert!(inter.try_get(USER_ID).is_some());
    }

    #[test]
    fn test_split_preserves_order() {
        let inter = batch(7);
        let parts = inter.split(3).unwrap();
        assert_eq!(parts.iter().map(Interaction::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let joined = Interaction::cat(&parts).unwrap();
        assert_eq!(joined.u32_column(USER_ID).unwrap(), (0..7).collect::<Vec<u32>>());
    }

    #[test]
    fn test_repeat_interleave() {
        let inter = batch(2);
        let rep = inter.repeat_interleave(3).unwrap();
        assert_eq!(rep.u32_column(USER_ID).unwrap(), vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(rep.u32_rows(ITEM_SEQ).unwrap()[3], vec![3, 4, 5]);
    }
}
