use anyhow::{bail, Context};
use clap::Parser;
use cli_support::{init_tracing, ShardOutputArgs};
use data_contracts::ImageRecord;
use image_preprocess::RecordWriter;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Parser, Debug)]
#[command(
    name = "pack_shards",
    about = "Pack a directory of class sub-directories into TFRecord shards"
)]
struct Args {
    /// Root with one sub-directory of images per class.
    #[arg(long)]
    input_root: PathBuf,
    #[command(flatten)]
    output: ShardOutputArgs,
    /// Seed for the shuffle applied before sharding.
    #[arg(long)]
    seed: Option<u64>,
}

struct Entry {
    path: PathBuf,
    label: i64,
    class: String,
}

fn sorted_dir(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = fs::read_dir(path)
        .with_context(|| format!("reading {}", path.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    out.sort();
    Ok(out)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    if args.output.images_per_shard == 0 {
        bail!("--images-per-shard must be positive");
    }

    // Label 0 stays free for a background class.
    let classes: Vec<PathBuf> = sorted_dir(&args.input_root)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect();
    if classes.is_empty() {
        bail!("no class directories under {}", args.input_root.display());
    }
    let mut entries = Vec::new();
    let mut class_names = Vec::with_capacity(classes.len());
    for (idx, dir) in classes.iter().enumerate() {
        let class = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for path in sorted_dir(dir)?.into_iter().filter(|p| is_image(p)) {
            entries.push(Entry {
                path,
                label: idx as i64 + 1,
                class: class.clone(),
            });
        }
        class_names.push(class);
    }
    if entries.is_empty() {
        bail!("no images found under {}", args.input_root.display());
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    entries.shuffle(&mut rng);

    let mut shards = 0usize;
    for (index, chunk) in entries.chunks(args.output.images_per_shard).enumerate() {
        let path = args.output.shard_path(index);
        let mut writer = RecordWriter::create(&path)?;
        for entry in chunk {
            let encoded =
                fs::read(&entry.path).with_context(|| format!("reading {}", entry.path.display()))?;
            let record = ImageRecord::new(encoded, entry.label, entry.class.clone());
            record.validate()?;
            writer.write_record(&record.encode_to_vec())?;
        }
        debug!(shard = %path.display(), records = writer.records_written(), "shard written");
        writer.finish()?;
        shards += 1;
    }

    let labels_path = args.output.labels_path();
    fs::write(&labels_path, class_names.join("\n") + "\n")
        .with_context(|| format!("writing {}", labels_path.display()))?;
    info!(
        images = entries.len(),
        classes = class_names.len(),
        shards,
        output = %args.output.output_root.display(),
        "packing complete"
    );
    Ok(())
}
