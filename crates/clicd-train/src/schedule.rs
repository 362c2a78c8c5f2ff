//! Which losses and optimizers run in each epoch.
//!
//! The trainer's epoch loop is fixed; a schedule only decides the ordered
//! list of [`Phase`]s for an epoch. Each phase is one pass over the training
//! batches with one [`Objective`] stepping one [`OptimizerSlot`].

use clicd_nn::{Objective, OptimizerSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub objective: Objective,
    pub slot: OptimizerSlot,
    /// Call the model's phase-end hook afterwards.
    pub notify: bool,
}

impl Phase {
    pub fn new(objective: Objective, slot: OptimizerSlot) -> Self {
        Self {
            objective,
            slot,
            notify: false,
        }
    }

    pub fn primary(objective: Objective) -> Self {
        Self::new(objective, OptimizerSlot::Primary)
    }

    pub fn notifying(mut self) -> Self {
        self.notify = true;
        self
    }
}

pub trait EpochSchedule {
    fn name(&self) -> &'static str;

    fn phases(&self, epoch: usize) -> Vec<Phase>;

    /// Whether the schedule uses a second optimizer.
    fn needs_secondary(&self) -> bool {
        false
    }
}

/// One recommendation pass per epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Standard;

impl EpochSchedule for Standard {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn phases(&self, _epoch: usize) -> Vec<Phase> {
        vec![Phase::primary(Objective::Recommendation)]
    }
}

/// `rec` recommendation epochs followed by `kg` knowledge-graph epochs,
/// repeating. Without a cadence every epoch trains the joint loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct Alternating {
    pub cadence: Option<(usize, usize)>,
}

impl Alternating {
    pub fn new(rec: Option<usize>, kg: Option<usize>) -> Self {
        Self {
            cadence: rec.zip(kg).filter(|(r, k)| r + k > 0),
        }
    }
}

impl EpochSchedule for Alternating {
    fn name(&self) -> &'static str {
        "alternating"
    }

    fn phases(&self, epoch: usize) -> Vec<Phase> {
        match self.cadence {
            Some((rec, kg)) if epoch % (rec + kg) >= rec => vec![Phase::primary(Objective::KnowledgeGraph)],
            _ => vec![Phase::primary(Objective::Recommendation)],
        }
    }
}

/// Recommendation, then knowledge graph, then the model's update hook.
#[derive(Debug, Clone, Copy)]
pub struct RecThenKg {
    pub update_attention: bool,
}

impl EpochSchedule for RecThenKg {
    fn name(&self) -> &'static str {
        "rec_then_kg"
    }

    fn phases(&self, _epoch: usize) -> Vec<Phase> {
        let kg = Phase::primary(Objective::KnowledgeGraph);
        vec![
            Phase::primary(Objective::Recommendation),
            if self.update_attention { kg.notifying() } else { kg },
        ]
    }
}

/// Recommendation every epoch, knowledge graph every `interval` epochs.
#[derive(Debug, Clone, Copy)]
pub struct Periodic {
    pub interval: usize,
}

impl EpochSchedule for Periodic {
    fn name(&self) -> &'static str {
        "periodic"
    }

    fn phases(&self, epoch: usize) -> Vec<Phase> {
        let mut phases = vec![Phase::primary(Objective::Recommendation)];
        if self.interval > 0 && epoch % self.interval == 0 {
            phases.push(Phase::primary(Objective::KnowledgeGraph));
        }
        phases
    }
}

/// Encoder passes on the primary optimizer, then decoder passes on the
/// secondary one.
#[derive(Debug, Clone, Copy)]
pub struct EncoderDecoder {
    pub encoder_steps: usize,
    pub decoder_steps: usize,
}

impl EpochSchedule for EncoderDecoder {
    fn name(&self) -> &'static str {
        "encoder_decoder"
    }

    fn phases(&self, _epoch: usize) -> Vec<Phase> {
        let enc = Phase::new(Objective::Encoder, OptimizerSlot::Primary);
        let dec = Phase::new(Objective::Decoder, OptimizerSlot::Secondary);
        std::iter::repeat(enc)
            .take(self.encoder_steps)
            .chain(std::iter::repeat(dec).take(self.decoder_steps))
            .collect()
    }

    fn needs_secondary(&self) -> bool {
        true
    }
}
