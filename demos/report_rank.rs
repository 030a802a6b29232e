//! Brings up a pool, has every worker report where it runs, and fans a small
//! computation out across the pool.
//!
//! ```text
//! RUST_LOG=cohort=debug cargo run --example report_rank
//! ```

use std::time::Duration;

use cohort::{Builder, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut controller = Builder::new()
        .num_workers(4)
        .verbose(true)
        .registry(|rank, registry| registry.register("greeting", format!("hello from rank {rank}")))
        .build()?;
    controller.ensure_controller();
    controller.print_info();

    let reports = controller.apply(|ctx| {
        let thread = std::thread::current();
        format!(
            "rank {} of {} (pid {}, thread {})",
            ctx.rank(),
            ctx.world().size() - 1,
            ctx.pid(),
            thread.name().unwrap_or("unnamed"),
        )
    })?;
    for report in &reports {
        println!("{report}");
    }

    let greetings: Vec<String> = controller.get("greeting")?;
    println!("{greetings:?}");

    let Some(mut handle) =
        controller.map_async(|_, (a, b): (u32, u32)| a.pow(b), (vec![2, 3, 4, 5], vec![10, 5, 3, 2]))
    else {
        return Ok(());
    };
    while !handle.ready(Some(Duration::from_millis(10))) {}
    if let Some(powers) = handle.get() {
        println!("powers: {:?}", powers?);
    }

    controller.shutdown();
    Ok(())
}
