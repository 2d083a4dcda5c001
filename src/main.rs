//! plateflow CLI: run a plate-transfer work order against simulated
//! hardware.
//!
//! Loads settings, parses the work-order XML, and drives the transfers
//! through the scheduler with mock devices standing in for the bench.

use anyhow::Context;
use clap::Parser;
use plateflow::config::Settings;
use plateflow::device::mock::{MockPipettor, MockRobotArm, MockTipBoxes, MockTransferStation};
use plateflow::device::HandoffDevice;
use plateflow::document::WorklistReader;
use plateflow::messages::SchedulerEvent;
use plateflow::scheduler::{SharedWorkQueue, TransferScheduler};
use plateflow::worklist::Barcoded;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "plateflow",
    about = "Run a plate-transfer work order against simulated hardware"
)]
struct Cli {
    /// Work-order XML file to execute.
    worklist: PathBuf,

    /// Configuration file (default: plateflow.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Parse and summarize the work order without running it.
    #[arg(long)]
    dry_run: bool,

    /// Print the work-order summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(serde::Serialize)]
struct WorkOrderSummary {
    sources: usize,
    destinations: usize,
    transfers: usize,
    liquid_classes: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.application.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database = Arc::new(settings.labware_database()?);
    let reader = WorklistReader::new(database);
    let overview = reader
        .read_file(&cli.worklist)
        .with_context(|| format!("reading work order {}", cli.worklist.display()))?;

    if cli.json {
        let summary = WorkOrderSummary {
            sources: overview.source_plates.len(),
            destinations: overview.destination_plates.len(),
            transfers: overview.transfers().len(),
            liquid_classes: overview.liquid_classes_used(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "work order: {} source plate(s), {} destination plate(s), {} transfer(s)",
            overview.source_plates.len(),
            overview.destination_plates.len(),
            overview.transfers().len()
        );
        for plate in overview.destination_plates.iter() {
            println!(
                "  destination {} ({}): usable wells {}",
                plate.barcode(),
                plate.labware_name(),
                plate.usable_wells_spec()
            );
        }
        let liquid_classes = overview.liquid_classes_used();
        if !liquid_classes.is_empty() {
            println!("  liquid classes: {}", liquid_classes.join(", "));
        }
    }
    if cli.dry_run {
        return Ok(());
    }

    let station = Arc::new(MockTransferStation::new(
        "transfer station",
        settings.scheduler.deck_positions,
    ));
    station
        .enqueue_worklist(&overview)
        .await
        .context("handing the work order to the transfer station")?;

    let (events_tx, mut events_rx) =
        broadcast::channel(settings.scheduler.event_channel_capacity);

    let mut scheduler = TransferScheduler::new("plate scheduler", settings.scheduler.clone());
    scheduler.set_hardware(vec![station]);
    scheduler.set_messenger(events_tx);
    scheduler.set_dispatcher(Arc::new(MockPipettor::new()));
    scheduler.set_shared_memory(SharedWorkQueue::new());
    scheduler.set_tip_box_manager(Arc::new(MockTipBoxes::new(settings.scheduler.tip_supply)));
    scheduler.set_robot_scheduler(Arc::new(MockRobotArm::new()));

    scheduler.add_transfers(&overview)?;
    scheduler.start_scheduler()?;
    info!("scheduler started, executing work order");

    let mut failed = 0usize;
    loop {
        match events_rx.recv().await {
            Ok(SchedulerEvent::TransferCompleted { index, transfer }) => {
                info!("transfer #{index} complete: {transfer}");
            }
            Ok(SchedulerEvent::TransferFailed { index, transfer, error }) => {
                failed += 1;
                warn!("transfer #{index} failed: {transfer}: {error}");
            }
            Ok(SchedulerEvent::WorkOrderDrained { completed }) => {
                println!("work order finished: {completed} transfer(s) completed, {failed} failed");
                break;
            }
            Ok(SchedulerEvent::Aborted { dropped }) => {
                println!("work order aborted, {dropped} transfer(s) dropped");
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event stream lagged, {skipped} event(s) skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    scheduler.stop_scheduler().await?;
    Ok(())
}
