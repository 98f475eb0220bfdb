use crate::config::Limits;
use crate::error::{BoxError, PipelineError};
use crate::metrics::StageMetrics;
use crate::outcome::{Outcome, Watcher};
use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A processing stage in the pipeline.
///
/// A stage pulls items from its [`Inlet`], pushes zero or more items per input to its
/// [`Outlet`] and returns once the inlet is exhausted. Returning an error settles the
/// whole run as failed. Any type implementing this trait can be appended unmodified
/// with [`Pipeline::pipe_stage`](crate::Pipeline::pipe_stage).
#[async_trait]
pub trait Stage<I, O>: Send + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Drive the stage until its input ends or the run halts
    async fn run(
        self: Box<Self>,
        input: Inlet<I>,
        output: Outlet<O>,
        ctx: StageContext,
    ) -> Result<(), BoxError>;

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// Receiving end of a stage boundary
#[derive(Debug)]
pub struct Inlet<T> {
    rx: mpsc::Receiver<T>,
    watcher: Watcher,
}

impl<T> Inlet<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>, watcher: Watcher) -> Self {
        Self { rx, watcher }
    }

    /// Next item from upstream.
    ///
    /// Returns `None` at end of sequence, or as soon as the run has settled.
    pub async fn recv(&mut self) -> Option<T> {
        if self.watcher.is_settled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.watcher.settled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Whether the run has settled and the stage should stop
    pub fn is_halted(&self) -> bool {
        self.watcher.is_settled()
    }
}

#[derive(Debug)]
enum Sink<T> {
    Channel(mpsc::Sender<T>),
    Discard,
}

/// Sending end of a stage boundary.
///
/// The last stage of a pipeline gets a discarding outlet, so it never holds
/// results waiting for a reader that doesn't exist.
#[derive(Debug)]
pub struct Outlet<T> {
    sink: Sink<T>,
    watcher: Watcher,
    metrics: Option<StageMetrics>,
}

impl<T> Outlet<T> {
    pub(crate) fn channel(tx: mpsc::Sender<T>, watcher: Watcher) -> Self {
        Self {
            sink: Sink::Channel(tx),
            watcher,
            metrics: None,
        }
    }

    pub(crate) fn discard(watcher: Watcher) -> Self {
        Self {
            sink: Sink::Discard,
            watcher,
            metrics: None,
        }
    }

    pub(crate) fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether this outlet belongs to the last stage
    pub fn is_terminal(&self) -> bool {
        matches!(self.sink, Sink::Discard)
    }

    /// Resolves once the downstream stage has dropped its inlet.
    ///
    /// Never resolves for the last stage's discarding outlet.
    pub async fn closed(&self) {
        match &self.sink {
            Sink::Channel(tx) => tx.closed().await,
            Sink::Discard => future::pending::<()>().await,
        }
    }

    /// Owned variant of [`closed`](Outlet::closed) that can outlive a borrow of the outlet
    pub(crate) fn downstream_gone(&self) -> BoxFuture<'static, ()>
    where
        T: Send + 'static,
    {
        match &self.sink {
            Sink::Channel(tx) => {
                let tx = tx.clone();
                async move { tx.closed().await }.boxed()
            }
            Sink::Discard => future::pending::<()>().boxed(),
        }
    }

    /// Whether the downstream stage has dropped its inlet
    pub fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Channel(tx) => tx.is_closed(),
            Sink::Discard => false,
        }
    }

    /// Push an item downstream.
    ///
    /// If the downstream buffer is full the call suspends until capacity frees up.
    /// Returns `false` when the item could not be delivered because the run halted
    /// or the downstream stage is gone; the caller should stop.
    pub async fn send(&mut self, item: T) -> bool {
        let tx = match &self.sink {
            Sink::Discard => return true,
            Sink::Channel(tx) => tx,
        };
        if self.watcher.is_settled() {
            return false;
        }

        match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(item)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_stall();
                }
                tokio::select! {
                    biased;
                    _ = self.watcher.settled() => false,
                    sent = tx.send(item) => sent.is_ok(),
                }
            }
        }
    }
}

/// Runtime context handed to a live stage
#[derive(Debug, Clone)]
pub struct StageContext {
    index: usize,
    name: Arc<str>,
    limits: Limits,
    terminal: bool,
    metrics: StageMetrics,
    outcome: Outcome,
}

impl StageContext {
    pub(crate) fn new(
        index: usize,
        name: Arc<str>,
        limits: Limits,
        terminal: bool,
        metrics: StageMetrics,
        outcome: Outcome,
    ) -> Self {
        Self {
            index,
            name,
            limits,
            terminal,
            metrics,
            outcome,
        }
    }

    /// Position of the stage in the pipeline, starting at 0
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Whether this is the last stage before the sink
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Whether the run has already settled
    pub fn is_halted(&self) -> bool {
        self.outcome.is_settled()
    }

    /// Settle the run as failed by this stage. Ignored if the run already settled.
    pub fn fail(&self, err: BoxError) {
        let failure = PipelineError::stage_failure(self.index, self.name.as_ref(), err);
        if self.outcome.settle(Err(failure.clone())) {
            tracing::warn!(stage = %self.name, index = self.index, error = %failure, "stage failed");
        }
    }
}

/// A stage that forwards every item unchanged
#[derive(Debug, Default)]
pub struct PassthroughStage;

#[async_trait]
impl<T: Send + 'static> Stage<T, T> for PassthroughStage {
    async fn run(
        self: Box<Self>,
        mut input: Inlet<T>,
        mut output: Outlet<T>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        while let Some(item) = input.recv().await {
            ctx.metrics().record_accepted();
            if !output.send(item).await {
                break;
            }
            ctx.metrics().record_emitted();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}
