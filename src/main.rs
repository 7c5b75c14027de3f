use std::sync::Arc;

use parcel_dispatch::config::{self, PoolConfig};
use parcel_dispatch::intake;
use parcel_dispatch::pool::{Dispatcher, Parcel, SimulatedUpload, TaskHandler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;
    let demo_parcels = config::demo_parcels_from_env()?;

    eprintln!("📦 Parcel Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.max_workers);
    eprintln!("   Queue:   {}", config.max_queue);
    eprintln!("   Parcels: {}\n", demo_parcels);

    let (intake, queue) = intake::channel(config.max_queue)?;
    let dispatcher = Dispatcher::from_config(&config)?;
    let handler: Arc<dyn TaskHandler> = Arc::new(SimulatedUpload::new());

    let pool = tokio::spawn(async move { dispatcher.dispatch(queue, handler).await });

    let parcels = (0..demo_parcels).map(|i| {
        Parcel::new(uuid::Uuid::new_v4().to_string(), format!("demo payload {i}"))
    });
    let admitted = intake.submit_batch(parcels).await?;
    tracing::info!(admitted, "Demo batch admitted");

    // Closing intake lets the dispatcher drain and stop.
    drop(intake);
    let report = pool.await??;

    for worker in &report.workers {
        eprintln!(
            "   worker {:>2}: {} completed, {} failed",
            worker.id, worker.completed, worker.failed
        );
    }
    println!("{}", serde_json::to_string_pretty(&report.stats)?);

    Ok(())
}
