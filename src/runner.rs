//! Stage scheduler.
//!
//! Turns a built pipeline into live tokio tasks: one pump for the source, one task per
//! stage, connected by bounded channels sized to the receiving stage's high-water mark.
//! A supervisor joins every task and settles the run as successful once all of them
//! have finished; any failure settles it earlier.

use crate::config::{Limits, PipelineConfig};
use crate::error::{BoxError, PanicError, PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::outcome::Outcome;
use crate::pipeline::{StageKind, StageSpec};
use crate::source::Source;
use crate::stage::{Inlet, Outlet, Stage, StageContext};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::future::IntoFuture;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Upstream part of a pipeline that can be wired onto a given outlet
pub(crate) trait Link<T>: Send {
    fn connect(self: Box<Self>, wiring: &mut Wiring, outlet: Outlet<T>);
}

pub(crate) struct SourceLink<T> {
    source: Source<T>,
}

impl<T> SourceLink<T> {
    pub fn new(source: Source<T>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> Link<T> for SourceLink<T> {
    fn connect(self: Box<Self>, wiring: &mut Wiring, outlet: Outlet<T>) {
        wiring.spawn_source(self.source, outlet);
    }
}

pub(crate) struct StageLink<I, O> {
    upstream: Box<dyn Link<I>>,
    stage: Box<dyn Stage<I, O>>,
    index: usize,
    name: Arc<str>,
    metrics: StageMetrics,
}

impl<I, O> StageLink<I, O> {
    pub fn new(
        upstream: Box<dyn Link<I>>,
        stage: Box<dyn Stage<I, O>>,
        spec: &StageSpec,
    ) -> Self {
        Self {
            upstream,
            stage,
            index: spec.index(),
            name: Arc::from(spec.name()),
            metrics: spec.metrics().clone(),
        }
    }
}

impl<I, O> Link<O> for StageLink<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn connect(self: Box<Self>, wiring: &mut Wiring, outlet: Outlet<O>) {
        let limits = wiring.limits[self.index];
        let (tx, rx) = mpsc::channel(limits.high_water_mark);
        let ctx = StageContext::new(
            self.index,
            self.name,
            limits,
            outlet.is_terminal(),
            self.metrics.clone(),
            wiring.outcome.clone(),
        );
        let input = Inlet::new(rx, wiring.outcome.subscribe());
        wiring.spawn_stage(self.stage, input, outlet.with_metrics(self.metrics), ctx);

        let upstream_outlet = Outlet::channel(tx, wiring.outcome.subscribe());
        self.upstream.connect(wiring, upstream_outlet);
    }
}

/// Live wiring state while a pipeline is being started
pub(crate) struct Wiring {
    handle: Handle,
    tasks: JoinSet<()>,
    outcome: Outcome,
    limits: Vec<Limits>,
}

impl Wiring {
    fn new(handle: Handle, outcome: Outcome, limits: Vec<Limits>) -> Self {
        Self {
            handle,
            tasks: JoinSet::new(),
            outcome,
            limits,
        }
    }

    fn spawn_stage<I, O>(
        &mut self,
        stage: Box<dyn Stage<I, O>>,
        input: Inlet<I>,
        output: Outlet<O>,
        ctx: StageContext,
    ) where
        I: Send + 'static,
        O: Send + 'static,
    {
        let task = async move {
            ctx.metrics().mark_started();
            tracing::trace!(stage = %ctx.name(), index = ctx.index(), "stage started");

            // a stage idling on its inlet is cancelled once nothing reads its output,
            // which drops the inlet in turn and lets upstream wind down the same way
            let downstream_gone = output.downstream_gone();
            let run = AssertUnwindSafe(stage.run(input, output, ctx.clone())).catch_unwind();
            let finished = tokio::select! {
                biased;
                finished = run => finished,
                _ = downstream_gone => {
                    tracing::trace!(stage = %ctx.name(), index = ctx.index(), "downstream closed");
                    return;
                }
            };
            match finished {
                Ok(Ok(())) => {
                    tracing::trace!(stage = %ctx.name(), index = ctx.index(), "stage finished");
                }
                Ok(Err(err)) => ctx.fail(err),
                Err(payload) => ctx.fail(Box::new(PanicError::from_payload(payload))),
            }
        };
        self.tasks.spawn_on(task, &self.handle);
    }

    fn spawn_source<T: Send + 'static>(&mut self, source: Source<T>, mut outlet: Outlet<T>) {
        let outcome = self.outcome.clone();
        let mut halt = outcome.subscribe();

        let pump = async move {
            let mut items = source.into_stream();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = halt.settled() => break,
                    _ = outlet.closed() => {
                        tracing::trace!("source pump stopped: first stage closed");
                        break;
                    }
                    next = items.next() => next,
                };
                match next {
                    Some(Ok(item)) => {
                        if !outlet.send(item).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        let failure = PipelineError::source_failure(err);
                        if outcome.settle(Err(failure.clone())) {
                            tracing::warn!(error = %failure, "source failed");
                        }
                        break;
                    }
                    None => break,
                }
            }
        };

        let outcome = self.outcome.clone();
        self.tasks.spawn_on(
            async move {
                if let Err(payload) = AssertUnwindSafe(pump).catch_unwind().await {
                    let err: BoxError = Box::new(PanicError::from_payload(payload));
                    outcome.settle(Err(PipelineError::source_failure(err)));
                }
            },
            &self.handle,
        );
    }

    /// Join every task, then settle the run as successful
    fn supervise(self) {
        let Wiring {
            handle,
            mut tasks,
            outcome,
            ..
        } = self;

        handle.spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "pipeline task did not finish");
                    outcome.settle(Err(PipelineError::Shutdown));
                }
            }
            outcome.settle(Ok(()));
        });
    }
}

type Connect = Box<dyn FnOnce(&mut Wiring) + Send>;

enum Plan {
    Built(Connect),
    Started,
    Rejected(PipelineError),
}

struct Inner {
    plan: Mutex<Plan>,
    held: AtomicBool,
    outcome: Outcome,
    specs: Vec<StageSpec>,
    config: PipelineConfig,
}

impl Inner {
    /// Resolve every stage's limits and find a runtime to start on
    fn prepare(&self) -> Result<(Handle, Vec<Limits>)> {
        if self.specs.is_empty() {
            return Err(PipelineError::NoStages);
        }
        self.config.validate()?;

        let limits = self
            .specs
            .iter()
            .map(|spec| {
                if let StageKind::Batch { size: 0 } = spec.kind() {
                    return Err(PipelineError::Config(format!(
                        "stage {} ({}): batch size must be at least 1",
                        spec.index(),
                        spec.name()
                    )));
                }
                spec.options().resolve(&self.config)
            })
            .collect::<Result<Vec<_>>>()?;

        let handle = Handle::try_current().map_err(|_| PipelineError::RuntimeUnavailable)?;
        Ok((handle, limits))
    }
}

/// Handle to one run of a pipeline.
///
/// Moves through Built, Started and Settled. Clones share the same run: any number of
/// callers may start it (only the first call does anything) and all of them observe the
/// same terminal outcome.
#[derive(Clone)]
pub struct Execution {
    inner: Arc<Inner>,
}

impl Execution {
    pub(crate) fn new<T: Send + 'static>(
        chain: Box<dyn Link<T>>,
        specs: Vec<StageSpec>,
        config: PipelineConfig,
        held: bool,
    ) -> Self {
        // the last stage consumes; nothing reads past it
        let connect: Connect = Box::new(move |wiring: &mut Wiring| {
            let sink = Outlet::discard(wiring.outcome.subscribe());
            chain.connect(wiring, sink);
        });
        let auto_start = config.auto_start_after();
        let execution = Self {
            inner: Arc::new(Inner {
                plan: Mutex::new(Plan::Built(connect)),
                held: AtomicBool::new(held),
                outcome: Outcome::new(),
                specs,
                config,
            }),
        };

        if let (Some(window), Ok(handle), false) = (auto_start, Handle::try_current(), held) {
            let pending = execution.clone();
            handle.spawn(async move {
                tokio::time::sleep(window).await;
                if pending.inner.held.load(Ordering::Acquire) || pending.is_started() {
                    return;
                }
                tracing::debug!("auto-starting idle pipeline");
                if let Err(err) = pending.start() {
                    tracing::debug!(error = %err, "auto-start rejected");
                }
            });
        }
        execution
    }

    /// Wire the stages and begin pulling from the source.
    ///
    /// Idempotent: only the first call starts the run. Usage errors are returned here and
    /// also become the run's terminal outcome.
    pub fn start(&self) -> Result<()> {
        let mut plan = self.inner.plan.lock();
        let connect = match mem::replace(&mut *plan, Plan::Started) {
            Plan::Built(connect) => connect,
            Plan::Started => return Ok(()),
            Plan::Rejected(err) => {
                *plan = Plan::Rejected(err.clone());
                return Err(err);
            }
        };

        let (handle, limits) = match self.inner.prepare() {
            Ok(prepared) => prepared,
            Err(err) => {
                *plan = Plan::Rejected(err.clone());
                self.inner.outcome.settle(Err(err.clone()));
                return Err(err);
            }
        };

        tracing::debug!(stages = self.inner.specs.len(), "starting pipeline");
        let mut wiring = Wiring::new(handle, self.inner.outcome.clone(), limits);
        connect(&mut wiring);
        wiring.supervise();
        Ok(())
    }

    /// Start if needed and wait for the terminal outcome
    pub async fn wait(&self) -> Result<()> {
        self.start()?;
        self.inner.outcome.subscribe().settled().await
    }

    /// Hold the run: it will not auto-start and only runs once started or awaited
    pub fn stop(&self) {
        self.inner.held.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        !matches!(*self.inner.plan.lock(), Plan::Built(_))
    }

    pub fn is_settled(&self) -> bool {
        self.inner.outcome.is_settled()
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.inner.specs
    }

    pub fn stage_metrics(&self, index: usize) -> Option<&StageMetrics> {
        self.inner.specs.get(index).map(StageSpec::metrics)
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("stages", &self.inner.specs.len())
            .field("started", &self.is_started())
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl IntoFuture for Execution {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}
