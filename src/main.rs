use sdx_cluster::NodeError;
use simulation::{run_scaling, run_simulation};
pub mod simulation;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<(), NodeError> {
    init_tracing();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            IN-MEMORY CLUSTER SIMULATION                     ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Small cluster, every node holds every partition
    let stats = run_simulation(3, 300, 8).await?;
    stats.print();

    // Larger cluster, three replicas per partition
    let stats = run_simulation(7, 2000, 32).await?;
    stats.print();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    run_scaling(12, 3).await?;

    println!("\n✓ Simulation completed successfully!");
    Ok(())
}
