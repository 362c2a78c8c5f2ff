//! Training checkpoints.
//!
//! A checkpoint is one bincode file holding the run's configuration, its
//! epoch and early-stopping counters, every model variable, any extra model
//! state and the optimizer moments. Variables are stored by their `VarMap`
//! name so loading is independent of insertion order.

use crate::optim::OptimizerState;
use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A named tensor flattened to `f32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            shape: tensor.dims().to_vec(),
            data: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Trainer configuration as JSON.
    pub config_json: String,
    pub model_name: String,
    pub epoch: i64,
    pub cur_step: usize,
    pub best_valid_score: f64,
    pub state_dict: Vec<TensorRecord>,
    pub other_parameter: Vec<TensorRecord>,
    pub optimizer: Option<OptimizerState>,
    pub secondary_optimizer: Option<OptimizerState>,
}

impl Checkpoint {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Checkpoint(format!("cannot open {}: {e}", path.display())))?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

/// Every variable of `varmap`, sorted by name.
pub fn state_dict(varmap: &VarMap) -> Result<Vec<TensorRecord>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
    let mut records = data
        .iter()
        .map(|(name, var)| TensorRecord::from_tensor(name.clone(), var.as_tensor()))
        .collect::<Result<Vec<_>>>()?;
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

/// Overwrite the variables of `varmap` from `records`. Every variable must be
/// present with a matching shape; unknown records are an error.
pub fn load_state_dict(varmap: &VarMap, records: &[TensorRecord]) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
    if let Some(extra) = records.iter().find(|r| !data.contains_key(&r.name)) {
        return Err(Error::Checkpoint(format!("unexpected parameter `{}`", extra.name)));
    }
    for (name, var) in data.iter() {
        let record = records
            .iter()
            .find(|r| &r.name == name)
            .ok_or_else(|| Error::Checkpoint(format!("missing parameter `{name}`")))?;
        if record.shape != var.dims() {
            return Err(Error::Checkpoint(format!(
                "shape mismatch for `{name}`: checkpoint {:?}, model {:?}",
                record.shape,
                var.dims()
            )));
        }
        let value = record.to_tensor(var.device())?.to_dtype(var.dtype())?;
        var.set(&value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    fn varmap(rows: usize) -> VarMap {
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu);
        vb.get_with_hints((rows, 2), "emb", Init::Randn { mean: 0.0, stdev: 1.0 })
            .unwrap();
        vb.get_with_hints(2, "bias", Init::Const(0.5)).unwrap();
        vm
    }

    #[test]
    fn test_state_dict_round_trip() {
        let src = varmap(3);
        let dst = varmap(3);
        load_state_dict(&dst, &state_dict(&src).unwrap()).unwrap();
        assert_eq!(state_dict(&dst).unwrap(), state_dict(&src).unwrap());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = load_state_dict(&varmap(4), &state_dict(&varmap(3)).unwrap()).unwrap_err();
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("m.ckpt");
        let ckpt = Checkpoint {
            config_json: "{}".into(),
            model_name: "CLICD".into(),
            epoch: 2,
            cur_step: 1,
            best_valid_score: 0.25,
            state_dict: state_dict(&varmap(2)).unwrap(),
            other_parameter: Vec::new(),
            optimizer: None,
            secondary_optimizer: None,
        };
        ckpt.save(&path).unwrap();
        let back = Checkpoint::load(&path).unwrap();
        assert_eq!(back.epoch, 2);
        assert_eq!(back.state_dict, ckpt.state_dict);
        assert!(Checkpoint::load(dir.path().join("absent.ckpt")).is_err());
    }
}
