//! CLICD CLI - graph building, training and evaluation from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Build the co-occurrence and similarity graphs once
//! clicd build-graphs -i interactions.tsv -o graphs.bin
//!
//! # Train (JSON config sections are all optional)
//! clicd train -i interactions.tsv --graphs graphs.bin --config run.json --progress
//!
//! # Meta-pretrain first, meta settings in their own file
//! clicd train -i interactions.tsv --meta-config meta.json
//!
//! # Score the test split with a saved checkpoint
//! clicd evaluate -i interactions.tsv --checkpoint saved/CLICD-interactions.ckpt --config run.json
//! ```
//!
//! A run config looks like:
//!
//! ```json
//! {
//!   "model": { "hidden_size": 64, "graphcl_enable": true },
//!   "trainer": { "epochs": 50, "learning_rate": 0.001 },
//!   "meta": { "meta_task_lengths": { "fixed": [5, 10] }, "meta_pretrain_step": 5 },
//!   "eval_kind": "full_sort"
//! }
//! ```

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use clicd_core::dataset::read_interactions;
use clicd_core::{EvalKind, EvalLoader, ExternalData, SequenceLoader, SequentialDataset};
use clicd_nn::{Clicd, ClicdConfig, Recommender};
use clicd_train::{EpochReport, MetaConfig, MetaTrainer, Trainer, TrainerConfig};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clicd")]
#[command(about = "Graph-contrastive sequential recommendation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build item graphs from an interaction file
    BuildGraphs {
        /// Interaction file (user, item, timestamp per line)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (.json or .bin)
        #[arg(short, long)]
        output: PathBuf,

        /// Similarity neighbors kept per item
        #[arg(long, default_value = "10")]
        top_k: usize,

        /// Longest history kept per user
        #[arg(long, default_value = "50")]
        max_seq_length: usize,
    },

    /// Train a model, optionally with meta-pretraining
    Train {
        /// Interaction file
        #[arg(short, long)]
        input: PathBuf,

        /// Prebuilt graphs; built from the training split when omitted
        #[arg(long)]
        graphs: Option<PathBuf>,

        /// JSON run config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON meta config; enables meta-pretraining and overrides the run config's `meta`
        #[arg(long)]
        meta_config: Option<PathBuf>,

        /// Resume from a checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Show a progress bar over epochs
        #[arg(long)]
        progress: bool,
    },

    /// Evaluate a checkpoint on the test split
    Evaluate {
        /// Interaction file
        #[arg(short, long)]
        input: PathBuf,

        /// Checkpoint to load
        #[arg(long)]
        checkpoint: PathBuf,

        /// Prebuilt graphs
        #[arg(long)]
        graphs: Option<PathBuf>,

        /// JSON run config (must match the one used for training)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RunConfig {
    model: ClicdConfig,
    trainer: TrainerConfig,
    meta: Option<MetaConfig>,
    eval_kind: EvalKind,
    /// Negatives per user for sampled evaluation.
    num_negatives: usize,
    sim_top_k: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ClicdConfig::default(),
            trainer: TrainerConfig::default(),
            meta: None,
            eval_kind: EvalKind::FullSort,
            num_negatives: 100,
            sim_top_k: 10,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::BuildGraphs {
            input,
            output,
            top_k,
            max_seq_length,
        } => cmd_build_graphs(&input, &output, top_k, max_seq_length),
        Commands::Train {
            input,
            graphs,
            config,
            meta_config,
            resume,
            progress,
        } => {
            let mut run = load_run_config(config.as_deref())?;
            if let Some(path) = meta_config {
                let text =
                    fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
                run.meta = Some(
                    serde_json::from_str(&text)
                        .with_context(|| format!("Failed to parse meta config {}", path.display()))?,
                );
            }
            cmd_train(&input, graphs.as_deref(), run, resume.as_deref(), progress)
        }
        Commands::Evaluate {
            input,
            checkpoint,
            graphs,
            config,
        } => cmd_evaluate(&input, &checkpoint, graphs.as_deref(), config.as_deref()),
    }
}

fn load_run_config(path: Option<&Path>) -> Result<RunConfig> {
    let Some(path) = path else {
        return Ok(RunConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse run config {}", path.display()))
}

fn load_dataset(path: &Path, max_seq_length: usize) -> Result<SequentialDataset> {
    let start = Instant::now();
    let records = read_interactions(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".into());
    let ds = SequentialDataset::from_records(name, &records, max_seq_length)?;
    info!(
        "loaded {}: {} users, {} items, {} interactions in {:.2?}",
        ds.name(),
        ds.num_users(),
        ds.num_items(),
        records.len(),
        start.elapsed()
    );
    Ok(ds)
}

/// Histories without their validation and test targets, so graphs never see
/// held-out interactions.
fn training_sequences(ds: &SequentialDataset) -> BTreeMap<u32, Vec<u32>> {
    ds.sequences()
        .iter()
        .map(|(&user, seq)| (user, seq[..seq.len().saturating_sub(2)].to_vec()))
        .collect()
}

fn load_graphs(path: Option<&Path>, ds: &SequentialDataset, top_k: usize) -> Result<ExternalData> {
    let data = match path {
        Some(path) if path.extension().is_some_and(|e| e == "bin") => ExternalData::load_binary(path)
            .with_context(|| format!("Failed to load binary graphs {}", path.display()))?,
        Some(path) => {
            ExternalData::load_json(path).with_context(|| format!("Failed to load graphs {}", path.display()))?
        }
        None => ExternalData::from_sequences(ds.num_items(), &training_sequences(ds), top_k)?,
    };
    if data.num_items() < ds.num_items() {
        bail!(
            "graphs cover {} items but the dataset has {}",
            data.num_items(),
            ds.num_items()
        );
    }
    Ok(data)
}

fn cmd_build_graphs(input: &Path, output: &Path, top_k: usize, max_seq_length: usize) -> Result<()> {
    let ds = load_dataset(input, max_seq_length)?;
    let start = Instant::now();
    let data = ExternalData::from_sequences(ds.num_items(), &training_sequences(&ds), top_k)?;
    info!(
        "built graphs in {:.2?}: {} adjacency edges, {} similarity edges",
        start.elapsed(),
        data.adjacency.edge_count(),
        data.similarity.edge_count()
    );

    if output.extension().is_some_and(|e| e == "bin") {
        data.save_binary(output)?;
    } else {
        data.save_json(output)?;
    }
    println!("Saved graphs to {}", output.display());
    Ok(())
}

fn build_model(run: &RunConfig, ds: &SequentialDataset, graphs: Option<&Path>) -> Result<Clicd> {
    let data = load_graphs(graphs, ds, run.sim_top_k)?;
    let model = Clicd::new(run.model.clone(), ds.num_items(), data, &Device::Cpu)?;
    Ok(model)
}

fn trainer_config(run: &RunConfig, ds: &SequentialDataset, model: &Clicd) -> TrainerConfig {
    let mut config = run.trainer.clone();
    config.model_name = model.name().to_string();
    config.dataset_name = ds.name().to_string();
    config
}

fn cmd_train(
    input: &Path,
    graphs: Option<&Path>,
    run: RunConfig,
    resume: Option<&Path>,
    progress: bool,
) -> Result<()> {
    let ds = load_dataset(input, run.model.max_seq_length)?;
    let split = ds.split_leave_one_out();
    let max_len = run.model.max_seq_length;
    let tc = &run.trainer;

    let mut train = SequenceLoader::new(split.train, tc.train_batch_size, max_len, tc.seed);
    let valid = EvalLoader::new(
        run.eval_kind,
        split.valid,
        ds.sequences(),
        ds.num_items(),
        tc.eval_batch_size,
        max_len,
        run.num_negatives,
        tc.seed,
    );
    let test = EvalLoader::new(
        run.eval_kind,
        split.test,
        ds.sequences(),
        ds.num_items(),
        tc.eval_batch_size,
        max_len,
        run.num_negatives,
        tc.seed + 1,
    );

    let model = build_model(&run, &ds, graphs)?;
    let mut trainer = Trainer::new(trainer_config(&run, &ds, &model), model)?;
    if let Some(path) = resume {
        trainer
            .resume_checkpoint(path)
            .with_context(|| format!("Failed to resume from {}", path.display()))?;
    }
    let remaining = trainer.config().epochs.saturating_sub(trainer.start_epoch());

    let pb = progress.then(|| {
        let pb = ProgressBar::new(remaining as u64);
        pb.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} epochs {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    });
    let on_epoch = |report: &EpochReport| {
        if let Some(pb) = &pb {
            let msg = match report.valid_score {
                Some(score) => format!("loss {:.4} valid {score:.4}", report.loss.total()),
                None => format!("loss {:.4}", report.loss.total()),
            };
            pb.set_message(msg);
            pb.inc(1);
        }
    };

    let start = Instant::now();
    let (outcome, mut trainer) = match run.meta.clone() {
        Some(meta) => {
            let mut meta_trainer = MetaTrainer::new(trainer, meta)?;
            let outcome = meta_trainer.fit_with_progress(&mut train, Some(&valid), on_epoch)?;
            (outcome, meta_trainer.into_trainer())
        }
        None => {
            let outcome = trainer.fit_with_progress(&mut train, Some(&valid), on_epoch)?;
            (outcome, trainer)
        }
    };
    if let Some(pb) = &pb {
        pb.finish_with_message(format!("done in {:.2?}", start.elapsed()));
    }

    println!("Best valid score: {:.6}", outcome.best_valid_score);
    if let Some(result) = &outcome.best_valid_result {
        println!("Best valid result: {}", result.summary());
    }

    let saved = trainer.saved_model_file();
    let checkpoint = saved.exists().then_some(saved.as_path());
    let result = trainer.evaluate_checkpoint(&test, checkpoint)?;
    println!("Test result: {}", result.summary());
    Ok(())
}

fn cmd_evaluate(input: &Path, checkpoint: &Path, graphs: Option<&Path>, config: Option<&Path>) -> Result<()> {
    let run = load_run_config(config)?;
    let ds = load_dataset(input, run.model.max_seq_length)?;
    let split = ds.split_leave_one_out();
    let tc = &run.trainer;
    let test = EvalLoader::new(
        run.eval_kind,
        split.test,
        ds.sequences(),
        ds.num_items(),
        tc.eval_batch_size,
        run.model.max_seq_length,
        run.num_negatives,
        tc.seed + 1,
    );

    let model = build_model(&run, &ds, graphs)?;
    let mut trainer = Trainer::new(trainer_config(&run, &ds, &model), model)?;
    let result = trainer
        .evaluate_checkpoint(&test, Some(checkpoint))
        .with_context(|| format!("Failed to evaluate {}", checkpoint.display()))?;
    println!("Test result: {}", result.summary());
    Ok(())
}
