use clap::Args;
use std::path::PathBuf;

/// Pipeline selection shared by binaries that stream batches.
#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    /// Preprocess config (TOML).
    #[arg(long)]
    pub config: PathBuf,
    /// Which action list and queueing policy to run: train or validate.
    #[arg(long, default_value = "train")]
    pub mode: String,
    /// Run `system.num_threads` lanes instead of a single lane.
    #[arg(long, default_value_t = false)]
    pub concurrent: bool,
    /// Split every batch evenly across this many devices.
    #[arg(long, default_value_t = 1)]
    pub num_devices: usize,
}

/// Where and how packed shards are written.
#[derive(Debug, Clone, Args)]
pub struct ShardOutputArgs {
    /// Directory to write shards and `labels.txt` into.
    #[arg(long, default_value = "shards")]
    pub output_root: PathBuf,
    /// Shard file prefix, e.g. `train` gives `train-00000.tfrecord`.
    #[arg(long, default_value = "train")]
    pub prefix: String,
    /// Records per shard file.
    #[arg(long, default_value_t = 1024)]
    pub images_per_shard: usize,
}

impl ShardOutputArgs {
    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.output_root
            .join(format!("{}-{index:05}.tfrecord", self.prefix))
    }

    pub fn labels_path(&self) -> PathBuf {
        self.output_root.join("labels.txt")
    }
}
