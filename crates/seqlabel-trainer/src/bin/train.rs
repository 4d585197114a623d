//! Command-line entry point: train, evaluate or query a tagger.

use anyhow::Result;
use clap::{Parser, Subcommand};
use seqlabel_trainer::{load_corpus, run_training, Trainer, TrainerConfig};
use std::path::PathBuf;
use tracing::info;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train and run a domain-constrained CRF entity tagger")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a JSON config file
    Train {
        /// Training config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Override the output directory
        #[arg(short, long)]
        model_dir: Option<PathBuf>,

        /// Start from scratch even if checkpoints exist
        #[arg(long)]
        fresh: bool,
    },
    /// Evaluate a saved model on a JSON-lines corpus
    Evaluate {
        #[arg(short, long)]
        model_dir: PathBuf,

        #[arg(short, long)]
        corpus: PathBuf,
    },
    /// Tag one utterance under the given intent
    Predict {
        #[arg(short, long)]
        model_dir: PathBuf,

        #[arg(short, long)]
        intent: String,

        text: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train {
            config,
            epochs,
            model_dir,
            fresh,
        } => {
            let mut config = TrainerConfig::from_file(&config)?;
            if let Some(epochs) = epochs {
                config = config.with_epochs(epochs);
            }
            if let Some(model_dir) = model_dir {
                config = config.with_model_dir(model_dir);
            }
            if fresh {
                config.resume = false;
            }
            run_training(config)?;
        }
        Commands::Evaluate { model_dir, corpus } => {
            let trainer = Trainer::load(&model_dir)?;
            let records = load_corpus(&corpus, &trainer.config().intent_field)?;
            let examples = trainer.preprocessor().encode_all(&records);
            let metrics = trainer.evaluate(&examples)?;

            println!("{}", metrics.report(trainer.preprocessor().tags()));
            println!("sequence accuracy: {:.4}", metrics.sequence_accuracy());
            println!("span accuracy:     {:.4}", metrics.spans().accuracy());
        }
        Commands::Predict {
            model_dir,
            intent,
            text,
        } => {
            let trainer = Trainer::load(&model_dir)?;
            let spans = trainer.predict(&text, &intent)?;
            info!(spans = spans.len(), "decoded");
            for span in spans {
                let surface: String = text.chars().skip(span.start).take(span.len()).collect();
                println!("{}\t{}\t{}\t{}", span.start, span.end, span.entity, surface);
            }
        }
    }

    Ok(())
}
