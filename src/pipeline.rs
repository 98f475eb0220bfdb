use crate::config::{PipelineConfig, StageOptions};
use crate::error::{BoxError, Result};
use crate::metrics::StageMetrics;
use crate::runner::{Execution, Link, SourceLink, StageLink};
use crate::source::Source;
use crate::stage::Stage;
use crate::structural::{Batch, Collector, Split};
use crate::transform::{Emitter, InvokeResult, Invoke, KeepIf, ParallelTransform};
use futures::future::{self, BoxFuture};
use futures::stream::Stream;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::{Future, IntoFuture};
use std::hash::Hash;
use std::mem;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What kind of stage a [`StageSpec`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Transform,
    Filter,
    Split,
    Batch { size: usize },
    Component,
    Collect,
}

/// Descriptor of one appended stage
#[derive(Debug, Clone)]
pub struct StageSpec {
    index: usize,
    name: String,
    kind: StageKind,
    options: StageOptions,
    metrics: StageMetrics,
}

impl StageSpec {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn options(&self) -> StageOptions {
        self.options
    }

    /// Metrics of the live stage; usable before the pipeline starts
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }
}

/// Builder for an ordered chain of stages over one source.
///
/// Building does no work. The chain runs once it is started through
/// [`into_execution`](Pipeline::into_execution) or awaited directly. A builder dropped
/// without being run, and not held with [`stop`](Pipeline::stop), auto-starts once the
/// configured window elapses:
///
/// ```ignore
/// let doubled = Pipeline::from_iter(0..10u32)
///     .then(|x| async move { x * 2 }, 4)
///     .filter(|x| x % 3 != 0, 1)
///     .collect()
///     .await?;
/// ```
pub struct Pipeline<T: Send + 'static> {
    /// Taken once the builder is consumed
    chain: Option<Box<dyn Link<T>>>,
    specs: Vec<StageSpec>,
    config: PipelineConfig,
    held: bool,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn from_source(source: Source<T>) -> Self {
        Self {
            chain: Some(Box::new(SourceLink::new(source))),
            specs: Vec::new(),
            config: PipelineConfig::default(),
            held: false,
        }
    }

    /// Pipeline over a single value
    pub fn once(value: T) -> Self {
        Self::from_source(Source::once(value))
    }

    pub fn from_iter<It>(items: It) -> Self
    where
        It: IntoIterator<Item = T>,
        It::IntoIter: Send + 'static,
    {
        Self::from_source(Source::from_iter(items))
    }

    pub fn from_stream<S>(items: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_source(Source::from_stream(items))
    }

    pub fn from_try_stream<S, E>(items: S) -> Self
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::from_source(Source::from_try_stream(items))
    }

    pub fn from_receiver(rx: mpsc::Receiver<T>) -> Self {
        Self::from_source(Source::from_receiver(rx))
    }

    /// Replace the pipeline-wide defaults
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Hold the pipeline: it never auto-starts and runs only when started or awaited
    pub fn stop(mut self) -> Self {
        self.held = true;
        self
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.specs
    }

    pub fn stage_metrics(&self, index: usize) -> Option<&StageMetrics> {
        self.specs.get(index).map(StageSpec::metrics)
    }

    /// Move the chain and its descriptors out, leaving nothing for `Drop` to start
    fn take_parts(&mut self) -> (Box<dyn Link<T>>, Vec<StageSpec>, PipelineConfig) {
        // every consuming method takes the chain exactly once, so the fallback is never wired
        let chain = self
            .chain
            .take()
            .unwrap_or_else(|| Box::new(SourceLink::new(Source::from_iter(Vec::new()))));
        (chain, mem::take(&mut self.specs), mem::take(&mut self.config))
    }

    fn append<U: Send + 'static>(
        mut self,
        stage: Box<dyn Stage<T, U>>,
        kind: StageKind,
        options: StageOptions,
    ) -> Pipeline<U> {
        let (chain, mut specs, config) = self.take_parts();
        let held = self.held;

        let spec = StageSpec {
            index: specs.len(),
            name: stage.name().to_owned(),
            kind,
            options,
            metrics: StageMetrics::new(),
        };
        let link = StageLink::new(chain, stage, &spec);
        specs.push(spec);

        Pipeline {
            chain: Some(Box::new(link)),
            specs,
            config,
            held,
        }
    }

    fn transform<U: Send + 'static>(
        self,
        name: &str,
        kind: StageKind,
        invoker: impl Invoke<T, U>,
        opts: impl Into<StageOptions>,
    ) -> Pipeline<U> {
        self.append(
            Box::new(ParallelTransform::new(name, invoker)),
            kind,
            opts.into(),
        )
    }

    /// Append an async, fallible function producing zero or one output per item.
    ///
    /// `Ok(None)` drops the item; an error fails the whole run.
    pub fn pipe<U, F, Fut, E>(self, f: F, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let invoker = move |item: T, _: Emitter<U>| -> BoxFuture<'static, InvokeResult<U>> {
            let fut = f(item);
            async move { fut.await.map_err(Into::<BoxError>::into) }.boxed()
        };
        self.transform("pipe", StageKind::Transform, invoker, opts)
    }

    /// Like [`pipe`](Pipeline::pipe), with an [`Emitter`] for pushing extra outputs
    pub fn pipe_emit<U, F, Fut, E>(self, f: F, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(T, Emitter<U>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let invoker = move |item: T, emitter: Emitter<U>| -> BoxFuture<'static, InvokeResult<U>> {
            let fut = f(item, emitter);
            async move { fut.await.map_err(Into::<BoxError>::into) }.boxed()
        };
        self.transform("pipe", StageKind::Transform, invoker, opts)
    }

    pub fn map<U, F>(self, f: F, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let invoker = move |item: T, _: Emitter<U>| -> BoxFuture<'static, InvokeResult<U>> {
            future::ready(Ok::<_, BoxError>(Some(f(item)))).boxed()
        };
        self.transform("map", StageKind::Transform, invoker, opts)
    }

    pub fn try_map<U, F, E>(self, f: F, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(T) -> std::result::Result<U, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let invoker = move |item: T, _: Emitter<U>| -> BoxFuture<'static, InvokeResult<U>> {
            let result: InvokeResult<U> = f(item).map(Some).map_err(Into::into);
            future::ready(result).boxed()
        };
        self.transform("try_map", StageKind::Transform, invoker, opts)
    }

    /// Synchronous transform where `None` drops the item
    pub fn filter_map<U, F>(self, f: F, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        let invoker = move |item: T, _: Emitter<U>| -> BoxFuture<'static, InvokeResult<U>> {
            future::ready(Ok::<_, BoxError>(f(item))).boxed()
        };
        self.transform("filter_map", StageKind::Transform, invoker, opts)
    }

    /// Async, infallible transform
    pub fn then<U, F, Fut>(self, f: F, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        let invoker = move |item: T, _: Emitter<U>| -> BoxFuture<'static, InvokeResult<U>> {
            let fut = f(item);
            async move { Ok::<_, BoxError>(Some(fut.await)) }.boxed()
        };
        self.transform("then", StageKind::Transform, invoker, opts)
    }

    /// Keep the items for which `predicate` returns true
    pub fn filter<P>(self, predicate: P, opts: impl Into<StageOptions>) -> Pipeline<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let keep = KeepIf::new(move |item: &T| future::ready(predicate(item)));
        self.transform("filter", StageKind::Filter, keep, opts)
    }

    /// Keep the items for which the async `predicate` resolves to true
    pub fn filter_async<P, Fut>(self, predicate: P, opts: impl Into<StageOptions>) -> Pipeline<T>
    where
        P: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.transform("filter", StageKind::Filter, KeepIf::new(predicate), opts)
    }

    /// Emit each element of every incoming sequence as its own item
    pub fn split(self) -> Pipeline<T::Item>
    where
        T: IntoIterator,
        T::Item: Send + 'static,
        T::IntoIter: Send,
    {
        self.append(Box::new(Split), StageKind::Split, StageOptions::default())
    }

    /// Group items into batches of `size`; the last batch may be shorter
    pub fn batch(self, size: usize) -> Pipeline<Vec<T>> {
        self.append(
            Box::new(Batch::new(size)),
            StageKind::Batch { size },
            StageOptions::default(),
        )
    }

    /// Append a pre-built stage as-is
    pub fn pipe_stage<U, S>(self, component: S, opts: impl Into<StageOptions>) -> Pipeline<U>
    where
        U: Send + 'static,
        S: Stage<T, U>,
    {
        self.append(Box::new(component), StageKind::Component, opts.into())
    }

    /// Run the pipeline and gather every output in order
    pub async fn collect(self) -> Result<Vec<T>> {
        self.collect_as().await
    }

    /// Run the pipeline and gather the distinct outputs
    pub async fn collect_set(self) -> Result<HashSet<T>>
    where
        T: Eq + Hash,
    {
        self.collect_as().await
    }

    async fn collect_as<C>(self) -> Result<C>
    where
        C: Default + Extend<T> + Send + 'static,
    {
        let sink = Arc::new(Mutex::new(C::default()));
        let options = StageOptions {
            max_parallel: Some(1),
            high_water_mark: Some(self.config.default_high_water_mark),
        };
        self.append(
            Box::new(Collector::new(Arc::clone(&sink))),
            StageKind::Collect,
            options,
        )
        .await?;

        let collected = mem::take(&mut *sink.lock());
        Ok(collected)
    }

    /// Turn the builder into a startable, observable run
    pub fn into_execution(mut self) -> Execution {
        let (chain, specs, config) = self.take_parts();
        Execution::new(chain, specs, config, self.held)
    }

    /// Start right away and return the handle
    pub fn start(self) -> Result<Execution> {
        let execution = self.into_execution();
        execution.start()?;
        Ok(execution)
    }
}

impl<T: Send + 'static> Drop for Pipeline<T> {
    fn drop(&mut self) {
        if self.held || self.specs.is_empty() {
            return;
        }
        if let Some(chain) = self.chain.take() {
            // arms the auto-start timer; the timer keeps the run alive
            Execution::new(
                chain,
                mem::take(&mut self.specs),
                mem::take(&mut self.config),
                false,
            );
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("specs", &self.specs)
            .field("config", &self.config)
            .field("held", &self.held)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntoFuture for Pipeline<T> {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        self.into_execution().into_future()
    }
}
