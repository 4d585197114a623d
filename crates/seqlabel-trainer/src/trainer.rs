//! Training loop for the encoder + constrained CRF tagger.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use oorandom::Rand32;
use seqlabel_core::{
    decode_spans, ConstrainedCrf, ConstraintCompiler, ConstraintSpec, EmissionSource,
    SequenceExample, SequenceMetrics, Span, TagSet, Vocabulary, UNKNOWN_SYMBOL,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrainerConfig;
use crate::data::{load_corpus, Preprocessor};
use crate::model::{EmissionEncoder, EncoderConfig};

const CONFIG_FILE: &str = "config.json";
const ENCODER_FILE: &str = "encoder.safetensors";
const TRANSITIONS_FILE: &str = "transitions.json";
const CONSTRAINT_FILE: &str = "constraint.json";
const TAGS_FILE: &str = "tag_lookup_table.json";
const CHARS_FILE: &str = "vocabulary_lookup_table.json";
const INTENTS_FILE: &str = "intent_lookup_table.json";

#[derive(Debug, Serialize, Deserialize)]
struct TransitionsFile {
    num_tags: usize,
    transitions: Vec<f32>,
}

/// Summary of one pass over the training examples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean loss over scored examples
    pub loss: f32,
    pub scored: usize,
    /// Examples whose gold path is illegal under their intent
    pub skipped: usize,
}

/// Encoder, constrained CRF and optimizer state for one tagging model.
pub struct Trainer {
    config: TrainerConfig,
    preprocessor: Preprocessor,
    constraints: ConstraintSpec,
    varmap: VarMap,
    encoder: EmissionEncoder,
    crf: ConstrainedCrf,
    optimizer: AdamW,
}

impl Trainer {
    /// Build an untrained tagger over the vocabularies of `preprocessor`.
    pub fn new(
        config: TrainerConfig,
        preprocessor: Preprocessor,
        constraints: ConstraintSpec,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let masks = ConstraintCompiler::default().compile(
            &constraints,
            preprocessor.tags(),
            preprocessor.intents(),
        );
        let crf = ConstrainedCrf::new(preprocessor.tags(), Arc::new(masks))?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = EmissionEncoder::new(
            EncoderConfig {
                vocab_size: preprocessor.chars().size(),
                embedding_dim: config.embedding_dim,
                hidden_size: config.lstm_size,
                num_tags: preprocessor.tags().len(),
            },
            vb,
        )?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;

        Ok(Self {
            config,
            preprocessor,
            constraints,
            varmap,
            encoder,
            crf,
            optimizer,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// The constrained CRF with its current transition scores.
    pub fn crf(&self) -> &ConstrainedCrf {
        &self.crf
    }

    /// One shuffled pass over `examples`.
    pub fn train_epoch(
        &mut self,
        examples: &[SequenceExample],
        epoch: usize,
        rng: &mut Rand32,
    ) -> anyhow::Result<EpochStats> {
        let mut order: Vec<usize> = (0..examples.len()).collect();
        for i in (1..order.len()).rev() {
            let j = rng.rand_range(0..(i as u32 + 1)) as usize;
            order.swap(i, j);
        }
        let shuffled: Vec<SequenceExample> = order.iter().map(|&i| examples[i].clone()).collect();

        let batcher = self.preprocessor.batcher(self.config.max_len);
        let mut stats = EpochStats {
            epoch,
            loss: 0.0,
            scored: 0,
            skipped: 0,
        };
        let mut total_loss = 0.0f64;

        for (step, batch) in batcher.batches(&shuffled, self.config.batch_size).enumerate() {
            let batch = batch?;
            let token_ids = self.encoder.token_tensor(&batch)?;
            let emissions = self.encoder.forward(&token_ids, &batch.lengths)?;
            let scores = emissions.to_vec3::<f32>()?;

            let loss = self.crf.batch_loss(&batch, &scores)?;
            if !loss.skipped.is_empty() {
                warn!(
                    epoch,
                    step,
                    skipped = loss.skipped.len(),
                    "skipping examples whose gold tags break their domain constraint"
                );
            }
            stats.skipped += loss.skipped.len();
            if loss.scored() == 0 {
                continue;
            }

            let surrogate = self.encoder.surrogate_loss(&emissions, &loss.emission_grads)?;
            self.optimizer.backward_step(&surrogate)?;
            self.crf
                .apply_gradients(&loss.transition_grad, self.config.transition_learning_rate)?;

            total_loss += loss.loss as f64 * loss.scored() as f64;
            stats.scored += loss.scored();
            debug!(epoch, step, loss = loss.loss, "batch");
        }

        if stats.scored > 0 {
            stats.loss = (total_loss / stats.scored as f64) as f32;
        }
        Ok(stats)
    }

    /// Decode `examples` and compare against their gold tags.
    pub fn evaluate(&self, examples: &[SequenceExample]) -> anyhow::Result<SequenceMetrics> {
        let tags = self.preprocessor.tags();
        let batcher = self.preprocessor.batcher(self.config.max_len);
        let mut metrics = SequenceMetrics::new(tags.len());

        for batch in batcher.batches(examples, self.config.batch_size) {
            let batch = batch?;
            let emissions = self.encoder.emissions(&batch)?;
            let decoded = self.crf.decode_batch(&batch, &emissions)?;
            for (i, path) in decoded.iter().enumerate() {
                metrics.update(tags, batch.gold_tags(i), path)?;
            }
        }
        Ok(metrics)
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.config.model_dir.join("checkpoints")
    }

    /// Load the newest checkpoint under `model_dir` into the encoder and CRF.
    ///
    /// Returns the epoch it was written after, or 0 when there is none.
    pub fn resume(&mut self) -> anyhow::Result<usize> {
        let Some((epoch, path)) = latest_checkpoint(&self.checkpoint_dir())? else {
            return Ok(0);
        };
        self.varmap
            .load(&path)
            .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
        let transitions = path.with_extension("json");
        if transitions.exists() {
            self.read_transitions(&transitions)?;
        }
        info!(epoch, checkpoint = %path.display(), "resumed from checkpoint");
        Ok(epoch)
    }

    /// Train for the configured number of epochs, evaluating after each one
    /// when `eval` is given and checkpointing into `model_dir`.
    ///
    /// With `resume` set, epochs already covered by a checkpoint are skipped.
    pub fn fit(
        &mut self,
        train: &[SequenceExample],
        eval: Option<&[SequenceExample]>,
    ) -> anyhow::Result<Vec<EpochStats>> {
        let mut rng = Rand32::new(self.config.seed);
        let checkpoints = self.checkpoint_dir();
        fs::create_dir_all(&checkpoints)
            .with_context(|| format!("failed to create {}", checkpoints.display()))?;
        let completed = if self.config.resume { self.resume()? } else { 0 };

        let mut history = Vec::with_capacity(self.config.epochs.saturating_sub(completed));
        for epoch in (completed + 1)..=self.config.epochs {
            let stats = self.train_epoch(train, epoch, &mut rng)?;
            info!(
                epoch,
                epochs = self.config.epochs,
                loss = stats.loss,
                scored = stats.scored,
                skipped = stats.skipped,
                "epoch complete"
            );

            if let Some(eval) = eval {
                let metrics = self.evaluate(eval)?;
                info!(
                    epoch,
                    tag_accuracy = metrics.tag_accuracy(),
                    sequence_accuracy = metrics.sequence_accuracy(),
                    span_accuracy = metrics.spans().accuracy(),
                    span_f1 = metrics.spans().f1(),
                    "evaluation"
                );
            }

            let checkpoint = checkpoints.join(format!("cp-{epoch:04}.safetensors"));
            self.varmap
                .save(&checkpoint)
                .with_context(|| format!("failed to write {}", checkpoint.display()))?;
            self.write_transitions(&checkpoint.with_extension("json"))?;
            history.push(stats);
        }
        Ok(history)
    }

    /// Tag `text` under `intent`, returning its entity spans (character offsets).
    ///
    /// An intent outside the vocabulary is treated as the unknown intent.
    pub fn predict(&self, text: &str, intent: &str) -> anyhow::Result<Vec<Span>> {
        let tags = self.preprocessor.tags();
        let token_ids = self.preprocessor.encode_text(text);
        let length = token_ids.len();
        let example = SequenceExample::new(
            token_ids,
            vec![tags.outside_id(); length],
            self.preprocessor.intents().lookup(intent),
        )?;

        let batch = self.preprocessor.batcher(length.max(1)).pad(&[example])?;
        let emissions = self.encoder.emissions(&batch)?;
        let decoded = self.crf.decode_batch(&batch, &emissions)?;
        let path = decoded.first().map(Vec::as_slice).unwrap_or_default();
        Ok(decode_spans(&tags.resolve(path)?)?)
    }

    /// Write the encoder weights, transitions, vocabularies, constraints and
    /// config into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        self.varmap.save(dir.join(ENCODER_FILE))?;
        self.write_transitions(&dir.join(TRANSITIONS_FILE))?;
        fs::write(
            dir.join(CONSTRAINT_FILE),
            serde_json::to_string_pretty(&self.constraints)?,
        )?;
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&self.config)?)?;
        self.preprocessor.tags().vocabulary().save(dir.join(TAGS_FILE))?;
        self.preprocessor.chars().save(dir.join(CHARS_FILE))?;
        self.preprocessor.intents().save(dir.join(INTENTS_FILE))?;

        info!(dir = %dir.display(), "model saved");
        Ok(())
    }

    /// Restore a tagger written by [`Trainer::save`].
    pub fn load<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let config = TrainerConfig::from_file(dir.join(CONFIG_FILE))?;
        let constraints = ConstraintSpec::from_file(dir.join(CONSTRAINT_FILE))?;
        let tags = TagSet::from_vocabulary(Vocabulary::load(dir.join(TAGS_FILE))?)?;
        let chars = Vocabulary::load(dir.join(CHARS_FILE))?;
        let intents = Vocabulary::load(dir.join(INTENTS_FILE))?;

        let mut trainer = Self::new(config, Preprocessor::from_parts(tags, chars, intents), constraints)?;
        trainer
            .varmap
            .load(dir.join(ENCODER_FILE))
            .with_context(|| format!("failed to load encoder weights from {}", dir.display()))?;

        trainer.read_transitions(&dir.join(TRANSITIONS_FILE))?;
        Ok(trainer)
    }

    fn write_transitions(&self, path: &Path) -> anyhow::Result<()> {
        let transitions = TransitionsFile {
            num_tags: self.crf.num_tags(),
            transitions: self.crf.transitions().to_vec(),
        };
        fs::write(path, serde_json::to_string(&transitions)?)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn read_transitions(&mut self, path: &Path) -> anyhow::Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let transitions: TransitionsFile = serde_json::from_str(&content)?;
        anyhow::ensure!(
            transitions.num_tags == self.crf.num_tags(),
            "transition matrix has {} tags, tag set has {}",
            transitions.num_tags,
            self.crf.num_tags()
        );
        self.crf.set_transitions(transitions.transitions)?;
        Ok(())
    }
}

/// Highest-numbered `cp-NNNN.safetensors` in `dir`, with its epoch.
fn latest_checkpoint(dir: &Path) -> anyhow::Result<Option<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let epoch = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("cp-"))
            .and_then(|name| name.strip_suffix(".safetensors"))
            .and_then(|n| n.parse::<usize>().ok());
        let Some(epoch) = epoch else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| epoch > *best) {
            latest = Some((epoch, path));
        }
    }
    Ok(latest)
}

/// Load the corpora named by `config`, train, report and save the model.
pub fn run_training(config: TrainerConfig) -> anyhow::Result<()> {
    config.validate()?;

    let train_records = load_corpus(&config.train_file, &config.intent_field)?;
    anyhow::ensure!(
        !train_records.is_empty(),
        "training corpus {} is empty",
        config.train_file.display()
    );
    let chars = match &config.vocabulary_file {
        Some(path) => Some(
            Vocabulary::load_lines(path, UNKNOWN_SYMBOL)
                .with_context(|| format!("failed to load vocabulary {}", path.display()))?,
        ),
        None => None,
    };
    let preprocessor = Preprocessor::fit(&train_records, chars);
    let train = preprocessor.encode_all(&train_records);

    let eval = match &config.eval_file {
        Some(path) => Some(preprocessor.encode_all(&load_corpus(path, &config.intent_field)?)),
        None => None,
    };

    let constraints = ConstraintSpec::from_file(&config.constraint_file).with_context(|| {
        format!("failed to load constraints {}", config.constraint_file.display())
    })?;

    info!(
        train = train.len(),
        eval = eval.as_ref().map_or(0, Vec::len),
        "starting training"
    );
    let model_dir = config.model_dir.clone();
    let mut trainer = Trainer::new(config, preprocessor, constraints)?;
    trainer.fit(&train, eval.as_deref())?;

    if let Some(eval) = &eval {
        let metrics = trainer.evaluate(eval)?;
        info!("classification report\n{}", metrics.report(trainer.preprocessor().tags()));
    }

    trainer.save(&model_dir)?;
    Ok(())
}
