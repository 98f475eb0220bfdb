//! Order-preserving concurrent transform.
//!
//! [`ParallelTransform`] turns a possibly-async one-in/zero-or-one-out function into a
//! stage that runs up to `max_parallel` invocations at once and still emits results in
//! arrival order. Filters are the same adapter driven by the [`KeepIf`] policy.

use crate::backpressure::CapacityGate;
use crate::buffer::ReorderBuffer;
use crate::error::{BoxError, PanicError};
use crate::metrics::StageMetrics;
use crate::stage::{Inlet, Outlet, Stage, StageContext};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// What one invocation resolves to: a replacement value, `None` to drop the item, or an error
pub type InvokeResult<O> = Result<Option<O>, BoxError>;

/// Per-item policy run by a [`ParallelTransform`].
///
/// `invoke` is called synchronously when the item is accepted, in arrival order; only
/// the returned future runs concurrently with other invocations.
pub trait Invoke<I, O>: Send + Sync + 'static {
    fn invoke(&self, item: I, emitter: Emitter<O>) -> BoxFuture<'static, InvokeResult<O>>;
}

impl<I, O, F> Invoke<I, O> for F
where
    F: Fn(I, Emitter<O>) -> BoxFuture<'static, InvokeResult<O>> + Send + Sync + 'static,
{
    fn invoke(&self, item: I, emitter: Emitter<O>) -> BoxFuture<'static, InvokeResult<O>> {
        self(item, emitter)
    }
}

/// Keep the original item when the predicate resolves to `true`
pub struct KeepIf<P> {
    predicate: P,
}

impl<P> KeepIf<P> {
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }
}

impl<T, P, Fut> Invoke<T, T> for KeepIf<P>
where
    T: Send + 'static,
    P: Fn(&T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn invoke(&self, item: T, _emitter: Emitter<T>) -> BoxFuture<'static, InvokeResult<T>> {
        let verdict = (self.predicate)(&item);
        async move { Ok::<_, BoxError>(verdict.await.then_some(item)) }.boxed()
    }
}

/// Side channel for pushing extra items out of a single invocation.
///
/// Items emitted through the handle are forwarded in emission order, ahead of the
/// invocation's own return value, once the invocation reaches the front of the reorder
/// buffer. After the invocation settles the handle is closed and further emits are dropped.
pub struct Emitter<O> {
    slot: Arc<Mutex<Option<Vec<O>>>>,
}

impl<O> Clone for Emitter<O> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<O> Emitter<O> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Push an extra item. Returns `false` if the invocation already settled.
    ///
    /// Emitted items are held in memory until the invocation settles and reaches the
    /// front of the reorder buffer. They do not count against the high-water mark, so
    /// an invocation that emits a large sequence buffers all of it.
    pub fn emit(&self, item: O) -> bool {
        match self.slot.lock().as_mut() {
            Some(items) => {
                items.push(item);
                true
            }
            None => false,
        }
    }

    fn close(&self) -> Vec<O> {
        self.slot.lock().take().unwrap_or_default()
    }
}

/// A settled invocation waiting for its turn
struct Settled<O> {
    extras: Vec<O>,
    value: Option<O>,
}

/// Wraps an [`Invoke`] policy into a bounded, order-preserving concurrent stage
pub struct ParallelTransform<I, O> {
    name: String,
    invoker: Arc<dyn Invoke<I, O>>,
}

impl<I, O> ParallelTransform<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(name: impl Into<String>, invoker: impl Invoke<I, O>) -> Self {
        Self {
            name: name.into(),
            invoker: Arc::new(invoker),
        }
    }

    fn launch(
        &self,
        seq: u64,
        item: I,
        metrics: &StageMetrics,
    ) -> BoxFuture<'static, (u64, Result<Settled<O>, BoxError>)> {
        let emitter = Emitter::new();
        let started = Instant::now();
        let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
            self.invoker.invoke(item, emitter.clone())
        }));
        let metrics = metrics.clone();

        async move {
            let result = match invoked {
                Ok(fut) => AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(Box::new(PanicError::from_payload(payload)) as BoxError)),
                Err(payload) => Err(Box::new(PanicError::from_payload(payload)) as BoxError),
            };
            metrics.record_latency(started.elapsed());

            let extras = emitter.close();
            (seq, result.map(|value| Settled { extras, value }))
        }
        .boxed()
    }
}

/// Forward a settled slot downstream. Returns `false` if the outlet stopped accepting.
async fn deliver<O>(settled: Settled<O>, output: &mut Outlet<O>, metrics: &StageMetrics) -> bool {
    for extra in settled.extras {
        if !output.send(extra).await {
            return false;
        }
        metrics.record_emitted();
    }
    match settled.value {
        Some(value) => {
            if !output.send(value).await {
                return false;
            }
            metrics.record_emitted();
        }
        None => metrics.record_dropped(),
    }
    true
}

/// Let in-flight invocations run to completion and throw their results away
async fn wind_down<F>(mut in_flight: FuturesUnordered<F>)
where
    F: Future,
{
    while in_flight.next().await.is_some() {}
}

#[async_trait]
impl<I, O> Stage<I, O> for ParallelTransform<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn run(
        self: Box<Self>,
        mut input: Inlet<I>,
        mut output: Outlet<O>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        let limits = ctx.limits();
        let metrics = ctx.metrics().clone();
        let mut gate = CapacityGate::new(limits.high_water_mark, metrics.clone());
        let mut reorder: ReorderBuffer<Settled<O>> =
            ReorderBuffer::with_capacity(limits.high_water_mark);
        let mut in_flight = FuturesUnordered::new();
        let mut exhausted = false;

        loop {
            while let Some(settled) = reorder.pop_ready() {
                let delivered = deliver(settled, &mut output, &metrics).await;
                gate.release();
                if !delivered {
                    wind_down(mem::take(&mut in_flight)).await;
                    return Ok(());
                }
            }

            if exhausted && reorder.is_empty() {
                break;
            }

            let can_accept =
                !exhausted && in_flight.len() < limits.max_parallel && gate.has_room();

            tokio::select! {
                Some((seq, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(settled) => reorder.complete(seq, settled),
                        Err(err) => {
                            ctx.fail(err);
                            wind_down(mem::take(&mut in_flight)).await;
                            return Ok(());
                        }
                    }
                }
                next = input.recv(), if can_accept => match next {
                    Some(item) => {
                        let seq = reorder.admit();
                        gate.acquire();
                        metrics.record_accepted();
                        in_flight.push(self.launch(seq, item, &metrics));
                    }
                    None if input.is_halted() => {
                        wind_down(mem::take(&mut in_flight)).await;
                        return Ok(());
                    }
                    None => exhausted = true,
                },
                _ = output.closed(), if !exhausted => {
                    wind_down(mem::take(&mut in_flight)).await;
                    return Ok(());
                }
                // every admitted item is either in flight or was drained above
                else => break,
            }
        }

        tracing::trace!(stage = %self.name, emitted = metrics.total_emitted(), "transform drained");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
