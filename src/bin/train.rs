//! Train the jet classifier on the resampled stream and plot what it saw.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin train -- --inputs 'data/train_*.parquet' --weights weights.jwh
//! OMP_NUM_THREADS=4 cargo run --release --bin train -- --inputs 'data/*.parquet' --no-resample
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use jetstream::pipeline::{LaneLimit, Pipeline, PipelineConfig};
use jetstream::schema::FeatureSchema;
use jetstream::source::{ParquetSourceFactory, SourceFactory, resolve_inputs};
use jetstream::store::WeightStore;
use jetstream::weights::build_table;
use llpflow::model::ClassifierConfig;
use llpflow::plot::{RenderStyle, render_diagnostics};
use llpflow::training::{TrainingConfig, train};

type Backend = Autodiff<NdArray>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(about = "Train the jet classifier on a class-balanced stream")]
struct Args {
    /// Glob pattern for the training Parquet files.
    #[arg(long)]
    inputs: String,

    /// Weight file; built from the inputs first if it does not exist.
    #[arg(long, default_value = "weights.jwh")]
    weights: PathBuf,

    /// Feature schema (JSON). Defaults to the built-in jet schema.
    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Passes over the input files.
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Stream events unweighted.
    #[arg(long)]
    no_resample: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long)]
    max_steps: Option<usize>,

    #[arg(long, default_value_t = 1e-3)]
    lr: f64,

    /// Diagnostic plot output.
    #[arg(long, default_value = "pipeline.svg")]
    plot: PathBuf,
}

fn load_or_build_store(
    path: &Path,
    schema: &FeatureSchema,
    factory: &dyn SourceFactory,
    files: &[PathBuf],
) -> Result<WeightStore, BoxError> {
    if path.exists() {
        info!("Loading weights from {}", path.display());
        let store = WeightStore::load(path)?;
        // A file left over from another schema would weight the wrong classes.
        store.check_classes(&schema.truth)?;
        return Ok(store);
    }

    info!("No weight file at {}, building it", path.display());
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("  Weights    {bar:40.cyan/blue} {pos}/{len} files [{elapsed_precise}]")?
            .progress_chars("##-"),
    );
    let table = build_table(schema, factory, files, 4096, |_| pb.inc(1))?;
    pb.finish_and_clear();

    let store = WeightStore::new(schema.truth.clone(), table)?;
    store.save(path)?;
    Ok(store)
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let schema = Arc::new(match &args.schema {
        Some(path) => FeatureSchema::load(path)?,
        None => FeatureSchema::default(),
    });
    let files = resolve_inputs(&args.inputs)?;
    let factory = Arc::new(ParquetSourceFactory::new(Arc::clone(&schema))?);
    let lanes = LaneLimit::from_env();

    info!("Inputs:  {} ({} files)", args.inputs, files.len());
    info!("Classes: {}", schema.class_names().join(", "));
    info!("Lanes:   up to {}", lanes.get());

    let resample = !args.no_resample;
    let store = if resample {
        let store = load_or_build_store(&args.weights, &schema, factory.as_ref(), &files)?;
        Some(Arc::new(store))
    } else {
        None
    };

    let config = PipelineConfig {
        batch_size: args.batch_size,
        max_lanes: lanes.get(),
        repeat: args.repeat,
        resample,
        seed: args.seed,
        ..Default::default()
    };
    let mut pipeline = Pipeline::spawn(config, Arc::clone(&schema), files, factory, store)?;

    let device = Default::default();
    let model = ClassifierConfig::for_schema(&schema).init::<Backend>(&device);
    let training = TrainingConfig::new()
        .with_learning_rate(args.lr)
        .with_max_steps(args.max_steps);
    let (_model, summary) = train(&pipeline, model, &training, &device)?;
    info!(
        "Shuffle buffer high water: {} / {}",
        pipeline.high_water(),
        pipeline.config().capacity()
    );
    pipeline.shutdown();

    for (name, class) in schema.class_names().iter().zip(0..) {
        info!("  {:<6} {:>10} jets", name, summary.diagnostics.events(class));
    }

    let style = RenderStyle {
        output: args.plot,
        ..Default::default()
    }
    .for_classes(schema.num_classes());
    render_diagnostics(&summary.diagnostics, &style)?;
    Ok(())
}
