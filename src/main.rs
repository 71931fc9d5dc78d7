mod cli;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use coastguard::controller::Controller;
use coastguard::discovery::{self, DiscoveryConfig};
use coastguard::metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = DiscoveryConfig::new(&cli.kubeconfig, cli.dp_contexts.clone());

    println!("Starting coastguard network policy sync...\n");
    println!("  Dataplane contexts .......... {}", config.contexts.join(", "));
    println!("  Health server ............... http://0.0.0.0:8080");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until all clusters sync, then 200)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();

    // Force-init Prometheus metrics so they appear on /metrics
    metrics::force_init();

    info!("coastguard_starting");

    let controller = Controller::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let run_handle = tokio::spawn(controller.clone().run(shutdown_tx.subscribe()));

    if let Err(e) = discovery::start(&config, &controller).await {
        let _ = shutdown_tx.send(());
        let _ = run_handle.await;
        return Err(e);
    }

    println!("Coastguard running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping coastguard...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    run_handle.await??;

    info!("coastguard_stopped");
    println!("Coastguard stopped.");
    Ok(())
}
