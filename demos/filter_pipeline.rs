//! Number processing pipeline demonstrating filtering and transformations
//!
//! Pipeline:
//! 1. Source: numbers 1-100
//! 2. Filter: keep only even numbers
//! 3. Transform: multiply by 10 with simulated async latency, 8 at a time
//! 4. Aggregate: sum all numbers
//!
//! Usage: cargo run --example filter_pipeline --release

use async_trait::async_trait;
use parflow::{BoxError, Inlet, Outlet, Pipeline, Stage, StageContext, StageOptions};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Component that sums all numbers
struct SumAggregator;

#[async_trait]
impl Stage<u64, ()> for SumAggregator {
    async fn run(
        self: Box<Self>,
        mut input: Inlet<u64>,
        _output: Outlet<()>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        let (mut sum, mut count) = (0u64, 0u64);
        while let Some(num) = input.recv().await {
            ctx.metrics().record_accepted();
            sum += num;
            count += 1;
            if count % 5 == 0 {
                println!("Running sum: {sum} (count: {count})");
            }
        }

        println!("\n=== Final Results ===");
        println!("Total numbers processed: {count}");
        println!("Sum of all numbers: {sum}");
        if count > 0 {
            println!("Average: {:.2}", sum as f64 / count as f64);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "sum_aggregator"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    println!("Number Processing Pipeline");
    println!("==========================");
    println!("Generating numbers 1-100, filtering evens, multiplying by 10, and summing");
    println!();

    let start = Instant::now();

    let execution = Pipeline::from_iter(1..=100u64)
        .filter(|n| n % 2 == 0, 4)
        .then(
            |n| async move {
                tokio::time::sleep(Duration::from_millis(n % 7)).await;
                n * 10
            },
            StageOptions::new().max_parallel(8).high_water_mark(16),
        )
        .pipe_stage(SumAggregator, 1)
        .into_execution();

    execution.wait().await?;

    println!("\nPipeline execution time: {:.3}s", start.elapsed().as_secs_f64());
    println!("Pipeline Metrics Summary:");
    for spec in execution.stages() {
        println!("  Stage {}: {}", spec.index(), spec.metrics().snapshot().format());
    }

    Ok(())
}
