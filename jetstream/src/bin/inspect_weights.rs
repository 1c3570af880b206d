//! Dump a weight file: header, per-class raw counts and derived weights.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect_weights -- --weights weights.jwh
//! cargo run --release --bin inspect_weights -- --weights weights.jwh --counts
//! ```

use std::path::PathBuf;

use clap::Parser;
use jetstream::histogram::Histogram2D;
use jetstream::store::WeightStore;

#[derive(Parser, Debug)]
#[command(about = "Inspect a resampling weight file")]
struct Args {
    /// Weight file written by `build_weights`.
    #[arg(long)]
    weights: PathBuf,

    /// Also print the raw fill counts.
    #[arg(long, default_value_t = false)]
    counts: bool,
}

/// One row per pT bin (flows included), one column per eta bin.
fn print_grid(hist: &Histogram2D, precision: usize) {
    let pt_edges = hist.x.edges();
    print!("  {:>13} |", "log10 pT");
    for eta_bin in 0..hist.y.n_cells() {
        print!(" {:>10}", eta_label(hist, eta_bin));
    }
    println!();
    for pt_bin in 0..hist.x.n_cells() {
        let label = if pt_bin == 0 {
            "underflow".to_string()
        } else if pt_bin > hist.x.n_bins {
            "overflow".to_string()
        } else {
            format!("[{:.2},{:.2})", pt_edges[pt_bin - 1], pt_edges[pt_bin])
        };
        print!("  {label:>13} |");
        for eta_bin in 0..hist.y.n_cells() {
            print!(" {:>10.precision$}", hist.get(pt_bin, eta_bin));
        }
        println!();
    }
}

fn eta_label(hist: &Histogram2D, eta_bin: usize) -> String {
    if eta_bin == 0 {
        "uflow".into()
    } else if eta_bin > hist.y.n_bins {
        "oflow".into()
    } else {
        format!("{:+.1}", hist.y.center(eta_bin))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let store = WeightStore::load(&args.weights)?;
    let table = store.table();

    // ── Overview ──────────────────────────────────────────────────────────
    println!("Weights: {}", args.weights.display());
    println!(
        "  pT axis:  {} bins over [{}, {}]",
        table.pt_axis.n_bins, table.pt_axis.lo, table.pt_axis.hi
    );
    println!(
        "  eta axis: {} bins over [{}, {}]",
        table.eta_axis.n_bins, table.eta_axis.lo, table.eta_axis.hi
    );
    println!("  avg events/bin: {:.3}", table.avg_events);
    println!("  min count:      {}", table.min_count);
    println!();

    // ── Classes ───────────────────────────────────────────────────────────
    for (ci, class) in store.classes().iter().enumerate() {
        let counts = &table.counts[ci];
        let weights = &table.weights[ci];
        let suppressed = (1..=counts.x.n_bins)
            .flat_map(|p| (1..=counts.y.n_bins).map(move |e| (p, e)))
            .filter(|&(p, e)| weights.get(p, e) == 0.0)
            .count();
        println!(
            "[{ci}] {}  ({})  {} jets in range, {} entries total, {} empty/suppressed bins",
            class.name,
            class.selection,
            counts.integral(),
            counts.entries(),
            suppressed
        );
        if args.counts {
            println!("  counts:");
            print_grid(counts, 0);
        }
        println!("  weights:");
        print_grid(weights, 4);
        println!();
    }
    Ok(())
}
