//! Offline weight pass: scan every training file once, fill the per-class
//! `(log10 pT, eta)` histograms and write the weight file the resampler reads.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin build_weights -- --inputs 'data/train_*.parquet' --output weights.jwh
//! cargo run --release --bin build_weights -- --inputs 'data/*.parquet' --schema schema.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use indicatif::{HumanCount, HumanDuration, ProgressBar, ProgressStyle};
use tracing::info;

use jetstream::pipeline::LaneLimit;
use jetstream::schema::FeatureSchema;
use jetstream::source::{ParquetSourceFactory, resolve_inputs};
use jetstream::store::WeightStore;
use jetstream::weights::build_table;

#[derive(Parser, Debug)]
#[command(about = "Build per-class resampling weights from training files")]
struct Args {
    /// Glob pattern for the input Parquet files.
    #[arg(long)]
    inputs: String,

    /// Where to write the weight file.
    #[arg(long, default_value = "weights.jwh")]
    output: PathBuf,

    /// Feature schema (JSON). Defaults to the built-in jet schema.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Records per read.
    #[arg(long, default_value_t = 4096)]
    chunk: usize,

    /// Worker threads for the scan. Defaults to OMP_NUM_THREADS, else 6.
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let schema = match &args.schema {
        Some(path) => FeatureSchema::load(path)?,
        None => FeatureSchema::default(),
    };
    let files = resolve_inputs(&args.inputs)?;
    let threads = args.threads.unwrap_or_else(|| LaneLimit::from_env().get());
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    info!("Inputs:  {} ({} files)", args.inputs, files.len());
    info!("Classes: {}", schema.class_names().join(", "));
    info!("Threads: {}", threads);

    let factory = ParquetSourceFactory::new(Arc::new(schema.clone()))?;
    let start = std::time::Instant::now();

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("  Filling    {bar:40.cyan/blue} {pos}/{len} files [{elapsed_precise}]")?
            .progress_chars("##-"),
    );
    let table = build_table(&schema, &factory, &files, args.chunk, |_| pb.inc(1))?;
    pb.finish_with_message("done");

    let total: f64 = table.counts.iter().map(|h| h.integral()).sum();
    info!(
        "Filled {} in-range jets in {}",
        HumanCount(total as u64),
        HumanDuration(start.elapsed())
    );
    for (class, counts) in schema.truth.iter().zip(&table.counts) {
        info!("  {:<6} {:>12} jets", class.name, HumanCount(counts.integral() as u64));
    }

    let store = WeightStore::new(schema.truth.clone(), table)?;
    store.save(&args.output)?;
    Ok(())
}
