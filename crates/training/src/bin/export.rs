use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use training::{export_backbone, TrainingError};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if let Err(err) = run() {
        eprintln!("export failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Export the backbone of a checkpoint for inference", long_about = None)]
struct Args {
    #[arg(value_name = "CHECKPOINT", help = "Checkpoint directory (model_* folder)")]
    checkpoint: PathBuf,

    #[arg(short, long, value_name = "DIR", help = "Output directory; defaults to the checkpoint directory")]
    out: Option<PathBuf>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let out = args.out.unwrap_or_else(|| args.checkpoint.clone());
    let path = export_backbone(&args.checkpoint, &out)?;
    info!(path = %path.display(), "done");
    Ok(())
}
