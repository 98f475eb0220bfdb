//! Stages that change the shape of the stream: split (fan-out), batch (fan-in)
//! and the collecting sink behind `collect()`.

use crate::error::BoxError;
use crate::stage::{Inlet, Outlet, Stage, StageContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;

/// Sub-items pushed by [`Split`] between voluntary yields to the scheduler
pub const SPLIT_YIELD_EVERY: usize = 256;

/// Fan-out: emits every element of each incoming sequence as its own item, in order.
///
/// Emission goes through the outlet, which suspends while downstream is full, so a
/// huge sequence is pushed across many scheduling turns instead of all at once.
#[derive(Debug, Default)]
pub struct Split;

#[async_trait]
impl<C> Stage<C, C::Item> for Split
where
    C: IntoIterator + Send + 'static,
    C::Item: Send + 'static,
    C::IntoIter: Send,
{
    async fn run(
        self: Box<Self>,
        mut input: Inlet<C>,
        mut output: Outlet<C::Item>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        let metrics = ctx.metrics();
        while let Some(sequence) = input.recv().await {
            metrics.record_accepted();
            for (i, part) in sequence.into_iter().enumerate() {
                if !output.send(part).await {
                    return Ok(());
                }
                metrics.record_emitted();
                if (i + 1) % SPLIT_YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "split"
    }
}

/// Fan-in: groups items into fixed-size batches; a short final batch is flushed at end of input
#[derive(Debug)]
pub struct Batch {
    size: usize,
}

impl Batch {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

#[async_trait]
impl<T: Send + 'static> Stage<T, Vec<T>> for Batch {
    async fn run(
        self: Box<Self>,
        mut input: Inlet<T>,
        mut output: Outlet<Vec<T>>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        if self.size == 0 {
            return Err("batch size must be at least 1".into());
        }
        let metrics = ctx.metrics();
        let mut buffered = Vec::with_capacity(self.size);

        while let Some(item) = input.recv().await {
            metrics.record_accepted();
            buffered.push(item);
            if buffered.len() >= self.size {
                let full = mem::replace(&mut buffered, Vec::with_capacity(self.size));
                if !output.send(full).await {
                    return Ok(());
                }
                metrics.record_emitted();
            }
        }

        if !buffered.is_empty() && !input.is_halted() && output.send(buffered).await {
            metrics.record_emitted();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "batch"
    }
}

/// Serial terminal stage that extends a shared container in arrival order
pub struct Collector<C> {
    sink: Arc<Mutex<C>>,
}

impl<C> Collector<C> {
    pub fn new(sink: Arc<Mutex<C>>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<T, C> Stage<T, ()> for Collector<C>
where
    T: Send + 'static,
    C: Extend<T> + Send + 'static,
{
    async fn run(
        self: Box<Self>,
        mut input: Inlet<T>,
        _output: Outlet<()>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        while let Some(item) = input.recv().await {
            ctx.metrics().record_accepted();
            self.sink.lock().extend(Some(item));
            ctx.metrics().record_emitted();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "collect"
    }
}
