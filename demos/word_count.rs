//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits them into words, counts frequencies and prints the top words.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use async_trait::async_trait;
use parflow::{BoxError, Inlet, Outlet, Pipeline, Stage, StageContext};
use std::collections::HashMap;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Component that counts words and periodically prints the top ones
struct WordCounterStage {
    counts: HashMap<String, usize>,
    report_every: usize,
}

impl WordCounterStage {
    fn new(report_every: usize) -> Self {
        Self {
            counts: HashMap::new(),
            report_every,
        }
    }

    fn top_n(&self, n: usize) -> Vec<(&str, usize)> {
        let mut items: Vec<_> = self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        items.truncate(n);
        items
    }

    fn print_top(&self, seen: usize) {
        println!("\n=== Top 10 Words (after {seen} words) ===");
        for (i, (word, count)) in self.top_n(10).iter().enumerate() {
            println!("{:2}. {} ({})", i + 1, word, count);
        }
    }
}

#[async_trait]
impl Stage<String, ()> for WordCounterStage {
    async fn run(
        self: Box<Self>,
        mut input: Inlet<String>,
        _output: Outlet<()>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        let mut counter = *self;
        let mut seen = 0;
        while let Some(word) = input.recv().await {
            ctx.metrics().record_accepted();
            *counter.counts.entry(word).or_insert(0) += 1;
            seen += 1;
            if seen % counter.report_every == 0 {
                counter.print_top(seen);
            }
        }
        counter.print_top(seen);
        Ok(())
    }

    fn name(&self) -> &str {
        "word_counter"
    }
}

fn clean(word: &str) -> Option<String> {
    let cleaned: String = word
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    (cleaned.len() > 2).then_some(cleaned)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let (tx, rx) = mpsc::channel(100);
    tokio::spawn(async move {
        let mut lines = BufReader::new(io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let execution = Pipeline::from_receiver(rx)
        .map(
            |line: String| {
                line.split_whitespace()
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            },
            4,
        )
        .split()
        .filter_map(|word: String| clean(&word), 8)
        .pipe_stage(WordCounterStage::new(100), 1)
        .into_execution();

    execution.wait().await?;

    println!("\n\nProcessing complete!");
    for spec in execution.stages() {
        println!("  Stage {} ({}): {}", spec.index(), spec.name(), spec.metrics().snapshot().format());
    }

    Ok(())
}
