use clap::{Parser, Subcommand};
use env_logger::Env;
use std::io::{self, Write};

use nucspot::context::{BatchOutcome, RunContext};
use nucspot::{crop, masks, plan, projection, segment, spot};

#[derive(Parser)]
#[command(name = "nucspot", about = "nucspot CLI: project, segment, masks, crop, spot, plan")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Maximum projection and z-center of each z-stack
    Project(projection::ProjectionArgs),
    /// Nuclear segmentation of nuclear-channel projections
    Segment(segment::SegmentArgs),
    /// Per-nucleus masks and distance transforms
    Masks(masks::MasksArgs),
    /// Crop images to nuclear masks
    Crop(crop::CropArgs),
    /// Join spots against z-centers and distance transforms
    Spot(spot::SpotArgs),
    /// Write scheduler jobs for a stage
    Plan(plan::PlanArgs),
}

fn progress(prog: f64, msg: &str) {
    let _ = writeln!(
        io::stderr(),
        "{}",
        serde_json::json!({"progress": prog, "message": msg})
    );
    let _ = io::stderr().flush();
}

fn report(outcome: BatchOutcome) {
    if outcome.failed > 0 {
        log::warn!("{} of {} items failed", outcome.failed, outcome.succeeded + outcome.failed);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let ctx = RunContext::new(&progress);
    match cli.command {
        Commands::Project(args) => report(projection::run(args, &ctx)?),
        Commands::Segment(args) => report(segment::run(args, &ctx)?),
        Commands::Masks(args) => report(masks::run(args, &ctx)?),
        Commands::Crop(args) => report(crop::run(args, &ctx)?),
        Commands::Spot(args) => report(spot::run(args, &ctx)?),
        Commands::Plan(args) => {
            let request = plan::run(args, &ctx)?;
            log::info!("wrote {} commands for {}", request.commands.len(), request.job_name);
        }
    }
    Ok(())
}
