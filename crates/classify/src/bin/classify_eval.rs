use anyhow::{bail, Context};
use clap::Parser;
use classify::{softmax_cross_entropy, Classify, EvalMetrics};
use cli_support::init_tracing;
use image_preprocess::PreprocessConfig;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "classify_eval",
    about = "Score dumped classifier logits (top1/top5) and write predictions.yaml"
)]
struct Args {
    /// Preprocess config (TOML); supplies the background class setup and batch size.
    #[arg(long)]
    config: PathBuf,
    /// JSON dump with `names`, `labels` (dataset space) and `logits` rows.
    #[arg(long)]
    predictions: PathBuf,
    /// `labels.txt` written by pack_shards.
    #[arg(long)]
    labels: Option<PathBuf>,
    /// Dataset class count; defaults to the names in `--labels`, plus one when
    /// the dataset carries background as label 0.
    #[arg(long)]
    num_classes: Option<usize>,
    /// Directory for predictions.yaml.
    #[arg(long, default_value = "outputs")]
    output_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct LogitDump {
    names: Vec<String>,
    labels: Vec<i32>,
    logits: Vec<Vec<f32>>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = PreprocessConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let background = cfg.dataset.background_class;

    let task = match (&args.labels, args.num_classes) {
        (Some(path), n) => Classify::from_labels_file(background, path, n)?,
        (None, Some(n)) => Classify::new(background, n, Vec::new())?,
        (None, None) => bail!("pass --labels or --num-classes"),
    };

    let raw = fs::read_to_string(&args.predictions)
        .with_context(|| format!("reading {}", args.predictions.display()))?;
    let dump: LogitDump = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.predictions.display()))?;
    if dump.names.len() != dump.logits.len() || dump.labels.len() != dump.logits.len() {
        bail!(
            "dump has {} names, {} labels and {} logit rows",
            dump.names.len(),
            dump.labels.len(),
            dump.logits.len()
        );
    }
    let width = task.num_classes();
    if let Some(row) = dump.logits.iter().find(|r| r.len() != width) {
        bail!("logit row has {} values, model has {width} classes", row.len());
    }
    let logits: Vec<f32> = dump.logits.concat();
    let targets: Vec<i32> = dump.labels.iter().map(|l| l + task.label_offset()).collect();

    let batch_size = cfg.system.batch_size;
    let mut metrics = EvalMetrics::new();
    for (rows, truth) in logits.chunks(batch_size * width).zip(targets.chunks(batch_size)) {
        metrics.update(rows, width, truth)?;
    }
    let loss = if targets.is_empty() {
        0.0
    } else {
        softmax_cross_entropy(&logits, width, &targets)?
    };
    let written = task.test(&dump.names, &logits, &args.output_dir)?;

    println!(
        "samples={} batches={} {metrics} loss={loss:.4}",
        metrics.samples(),
        metrics.batches()
    );
    println!("predictions -> {}", written.display());
    Ok(())
}
