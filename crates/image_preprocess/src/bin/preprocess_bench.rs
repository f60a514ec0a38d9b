use anyhow::Context;
use clap::Parser;
use cli_support::{init_tracing, PipelineArgs};
use image_preprocess::{Batch, Mode, Preprocess, PreprocessConfig};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "preprocess_bench",
    about = "Stream preprocessed batches from a config and report throughput"
)]
struct Args {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Stop after this many batches (0 runs until the input is exhausted).
    #[arg(long, default_value_t = 100)]
    batches: usize,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = PreprocessConfig::from_path(&args.pipeline.config)
        .with_context(|| format!("loading {}", args.pipeline.config.display()))?;
    let mode: Mode = args.pipeline.mode.parse()?;
    let shape = cfg.image_shape();
    let mut pipeline = Preprocess::new(mode, args.pipeline.concurrent, cfg)?;

    let started = Instant::now();
    let mut batches = 0usize;
    let mut samples = 0usize;
    for splits in pipeline.preprocess(args.pipeline.num_devices)? {
        let splits = splits?;
        samples += splits.iter().map(Batch::len).sum::<usize>();
        batches += 1;
        if args.batches > 0 && batches >= args.batches {
            break;
        }
    }
    let threads = pipeline.thread_count();
    let report = pipeline.stop();
    let secs = started.elapsed().as_secs_f64().max(1e-3);
    println!(
        "mode={mode} shape={shape} threads={threads} batches={batches} samples={samples} elapsed={secs:.2}s rate={:.1} img/s left_running={}",
        samples as f64 / secs,
        report.still_running
    );
    Ok(())
}
