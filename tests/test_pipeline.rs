use async_trait::async_trait;
use futures::stream;
use parflow::{
    BoxError, Inlet, Outlet, PanicError, PassthroughStage, Pipeline, PipelineConfig,
    PipelineError, Stage, StageContext, StageOptions,
};
use parking_lot::Mutex;
use rand::Rng;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("item {0} rejected")]
struct Rejected(u32);

fn random_delay(max_ms: u64) -> Duration {
    Duration::from_millis(rand::rng().random_range(1..=max_ms))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_preserved_under_random_latency() {
    let completion_order = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&completion_order);

    let out = Pipeline::from_iter(vec!['a', 'b', 'c', 'd', 'e'])
        .then(
            move |c: char| {
                let delay = random_delay(30);
                let captured = Arc::clone(&captured);
                async move {
                    tokio::time::sleep(delay).await;
                    captured.lock().push(c);
                    c.to_ascii_uppercase()
                }
            },
            5,
        )
        .collect()
        .await
        .unwrap();

    assert_eq!(out, vec!['A', 'B', 'C', 'D', 'E']);
    let mut completed = completion_order.lock().clone();
    completed.sort_unstable();
    assert_eq!(completed, vec!['a', 'b', 'c', 'd', 'e']);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_preserved_across_many_items() {
    let input: Vec<u32> = (0..200).collect();
    let out = Pipeline::from_iter(input.clone())
        .then(
            |x| {
                let delay = random_delay(5);
                async move {
                    tokio::time::sleep(delay).await;
                    x
                }
            },
            16,
        )
        .then(
            |x| {
                let delay = random_delay(3);
                async move {
                    tokio::time::sleep(delay).await;
                    x * 2
                }
            },
            7,
        )
        .collect()
        .await
        .unwrap();

    let expected: Vec<u32> = input.iter().map(|x| x * 2).collect();
    assert_eq!(out, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_contained_by_high_water_mark() {
    const H: usize = 4;
    let pipeline = Pipeline::from_iter(0..60u32).then(
        |x| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            x
        },
        StageOptions::new().max_parallel(H).high_water_mark(H),
    );
    let upstream = pipeline.stage_metrics(0).cloned().unwrap();
    let observed = upstream.clone();
    let max_seen = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&max_seen);

    let out = pipeline
        .then(
            move |x| {
                seen.fetch_max(observed.in_flight(), Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    x
                }
            },
            1,
        )
        .collect()
        .await
        .unwrap();

    assert_eq!(out, (0..60).collect::<Vec<_>>());
    assert!(max_seen.load(Ordering::SeqCst) <= H);
    assert!(upstream.peak_in_flight() <= H);
    assert!(upstream.total_stalls() > 0, "slow downstream should push back");
    assert!(upstream.total_blocks() > 0, "full stage should stop accepting");
}

#[tokio::test]
async fn test_config_default_limits_apply() {
    let config = PipelineConfig::from_toml_str("default_high_water_mark = 2\n").unwrap();
    let pipeline = Pipeline::from_iter(0..20u32)
        .with_config(config)
        .then(
            |x| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                x
            },
            StageOptions::default(),
        );
    let metrics = pipeline.stage_metrics(0).cloned().unwrap();

    pipeline.collect().await.unwrap();
    assert!(metrics.peak_in_flight() <= 2);
    assert_eq!(metrics.total_emitted(), 20);
}

#[tokio::test]
async fn test_filter_sync_predicate() {
    let out = Pipeline::from_iter(0..10u32)
        .filter(|n| *n >= 5, 3)
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn test_filter_async_predicate() {
    let out = Pipeline::from_iter(0..10u32)
        .filter_async(
            |n| {
                let n = *n;
                let delay = random_delay(10);
                async move {
                    tokio::time::sleep(delay).await;
                    n >= 5
                }
            },
            4,
        )
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn test_split_flattens_sequence() {
    let out = Pipeline::once(vec!['a', 'b', 'c'])
        .split()
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec!['a', 'b', 'c']);
}

#[tokio::test]
async fn test_split_large_sequences() {
    let big: Vec<u32> = (0..3000).collect();
    let out = Pipeline::from_iter(vec![big.clone(), big.clone()])
        .split()
        .map(|x| x + 1, 2)
        .collect()
        .await
        .unwrap();

    assert_eq!(out.len(), 6000);
    assert!(out[..3000].iter().copied().eq(1..=3000));
    assert!(out[3000..].iter().copied().eq(1..=3000));
}

#[tokio::test]
async fn test_batch_sizes() {
    let out = Pipeline::from_iter(0..23u32).batch(5).collect().await.unwrap();
    assert_eq!(out.len(), 5);
    assert!(out[..4].iter().all(|b| b.len() == 5));
    assert_eq!(out[4], vec![20, 21, 22]);
    assert_eq!(out.concat(), (0..23).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_batch_of_batch_heads() {
    let out = Pipeline::from_iter(0..250u32)
        .batch(50)
        .map(|batch| batch[0], 2)
        .batch(3)
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![vec![0, 50, 100], vec![150, 200]]);
}

#[tokio::test]
async fn test_lazy_start() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pulls = Arc::new(AtomicUsize::new(0));
    let (c, p) = (Arc::clone(&calls), Arc::clone(&pulls));

    let execution = Pipeline::from_iter((0..5u32).inspect(move |_| {
        p.fetch_add(1, Ordering::SeqCst);
    }))
    .map(
        move |x| {
            c.fetch_add(1, Ordering::SeqCst);
            x
        },
        2,
    )
    .into_execution();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pulls.load(Ordering::SeqCst), 0);
    assert!(!execution.is_started());

    execution.start().unwrap();
    execution.wait().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(pulls.load(Ordering::SeqCst), 5);
}

fn counting_pipeline(calls: &Arc<AtomicUsize>) -> Pipeline<u32> {
    let c = Arc::clone(calls);
    let config = PipelineConfig::default().with_auto_start_after(Duration::from_millis(10));
    Pipeline::from_iter(0..4u32).with_config(config).map(
        move |x| {
            c.fetch_add(1, Ordering::SeqCst);
            x
        },
        1,
    )
}

#[tokio::test]
async fn test_dropped_builder_auto_starts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = counting_pipeline(&calls);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    drop(pipeline);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_dropped_held_builder_never_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    drop(counting_pipeline(&calls).stop());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_await_pipeline_runs_terminal_stage() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);

    // the last stage's outputs are never read; the run still completes
    Pipeline::from_iter(0..1000u32)
        .map(
            move |x| {
                c.fetch_add(1, Ordering::SeqCst);
                x
            },
            2,
        )
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1000);
}

#[tokio::test]
async fn test_failure_short_circuits() {
    let collected = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&collected);

    let result = Pipeline::from_iter(0..10u32)
        .pipe(
            |x| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if x == 4 {
                    Err(Rejected(x))
                } else {
                    Ok(Some(x))
                }
            },
            2,
        )
        .map(
            move |x| {
                done.fetch_add(1, Ordering::SeqCst);
                x
            },
            1,
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.stage_index(), Some(0));
    assert_eq!(err.downcast_ref::<Rejected>(), Some(&Rejected(4)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(collected.load(Ordering::SeqCst) < 10);
}

#[tokio::test]
async fn test_first_error_wins() {
    let result = Pipeline::from_iter(0..10u32)
        .pipe(
            |x| async move {
                if x == 1 {
                    Err(Rejected(x))
                } else {
                    Ok(Some(x))
                }
            },
            1,
        )
        .try_map(|x| Err::<u32, _>(Rejected(x + 100)), 1)
        .collect()
        .await;

    // item 0 reaches stage 1 before item 1 fails in stage 0
    let err = result.unwrap_err();
    let rejected = err.downcast_ref::<Rejected>().unwrap();
    assert!(*rejected == Rejected(1) || *rejected == Rejected(100));
}

#[tokio::test]
async fn test_start_twice_and_many_observers() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let p = Arc::clone(&pulls);

    let execution = Pipeline::from_iter((0..8u32).inspect(move |_| {
        p.fetch_add(1, Ordering::SeqCst);
    }))
    .then(|x| async move { x + 1 }, 4)
    .into_execution();

    execution.start().unwrap();
    execution.start().unwrap();

    let observers: Vec<_> = (0..3)
        .map(|_| tokio::spawn(execution.clone().into_future()))
        .collect();
    for observer in observers {
        assert!(observer.await.unwrap().is_ok());
    }
    execution.wait().await.unwrap();
    assert_eq!(pulls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_observers_share_failure() {
    let execution = Pipeline::from_iter(0..5u32)
        .try_map(|x| if x == 2 { Err(Rejected(x)) } else { Ok(x) }, 1)
        .into_execution();

    let first = execution.clone();
    let second = execution.clone();
    let (a, b) = tokio::join!(first.wait(), second.wait());
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert_eq!(a.downcast_ref::<Rejected>(), Some(&Rejected(2)));
    assert_eq!(b.downcast_ref::<Rejected>(), Some(&Rejected(2)));
    assert!(execution.is_settled());
}

#[tokio::test]
async fn test_emitter_side_channel_order() {
    let out = Pipeline::from_iter(1..=3u32)
        .pipe_emit(
            |x, emitter| async move {
                tokio::time::sleep(Duration::from_millis(u64::from(4 - x))).await;
                emitter.emit(x * 10);
                emitter.emit(x * 10 + 1);
                Ok::<_, BoxError>(Some(x))
            },
            3,
        )
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![10, 11, 1, 20, 21, 2, 30, 31, 3]);
}

#[tokio::test]
async fn test_collect_set() {
    let out = Pipeline::from_iter(vec!["a", "b", "a", "c", "b"])
        .map(str::to_owned, 2)
        .collect_set()
        .await
        .unwrap();
    assert_eq!(out.len(), 3);
    assert!(out.contains("a") && out.contains("b") && out.contains("c"));
}

#[tokio::test]
async fn test_source_error_fails_run() {
    let items = stream::iter(vec![
        Ok(1u32),
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")),
        Ok(3),
    ]);
    let result = Pipeline::from_try_stream(items)
        .map(|x| x, 1)
        .collect()
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Source { .. }));
    assert_eq!(
        err.downcast_ref::<std::io::Error>().map(|e| e.to_string()).as_deref(),
        Some("disk gone")
    );
}

#[tokio::test]
async fn test_panic_becomes_stage_failure() {
    let result = Pipeline::from_iter(0..5u32)
        .map(
            |x| {
                if x == 2 {
                    panic!("boom at {x}");
                }
                x
            },
            1,
        )
        .collect()
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.stage_index(), Some(0));
    let panic = err.downcast_ref::<PanicError>().unwrap();
    assert!(panic.message.contains("boom at 2"));
}

#[tokio::test]
async fn test_zero_limits_rejected() {
    let result = Pipeline::from_iter(0..3u32).map(|x| x, 0).collect().await;
    assert!(matches!(result, Err(PipelineError::Config(_))));

    let result = Pipeline::from_iter(0..3u32).batch(0).await;
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[tokio::test]
async fn test_no_stages_rejected() {
    let result = Pipeline::from_iter(0..3u32).await;
    assert!(matches!(result, Err(PipelineError::NoStages)));
}

/// Component that reports each word's length
struct WordLengths;

#[async_trait]
impl Stage<String, usize> for WordLengths {
    async fn run(
        self: Box<Self>,
        mut input: Inlet<String>,
        mut output: Outlet<usize>,
        ctx: StageContext,
    ) -> Result<(), BoxError> {
        while let Some(word) = input.recv().await {
            ctx.metrics().record_accepted();
            if word.is_empty() {
                return Err("empty word".into());
            }
            if !output.send(word.len()).await {
                break;
            }
            ctx.metrics().record_emitted();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "word_lengths"
    }
}

/// Component that stops after the first item
struct TakeFirst;

#[async_trait]
impl Stage<u32, u32> for TakeFirst {
    async fn run(
        self: Box<Self>,
        mut input: Inlet<u32>,
        mut output: Outlet<u32>,
        _ctx: StageContext,
    ) -> Result<(), BoxError> {
        if let Some(first) = input.recv().await {
            output.send(first).await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_component_stage() {
    let pipeline = Pipeline::from_iter(vec!["one", "three", "seven"])
        .map(str::to_owned, 2)
        .pipe_stage(WordLengths, 1)
        .pipe_stage(PassthroughStage, 1);
    assert_eq!(pipeline.stages()[1].name(), "word_lengths");

    let out = pipeline.collect().await.unwrap();
    assert_eq!(out, vec![3, 5, 5]);
}

#[tokio::test]
async fn test_component_error_propagates() {
    let result = Pipeline::from_iter(vec!["ok", "", "late"])
        .map(str::to_owned, 1)
        .pipe_stage(WordLengths, 1)
        .collect()
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.stage_index(), Some(1));
    assert_eq!(err.cause().map(|c| c.to_string()).as_deref(), Some("empty word"));
}

#[tokio::test]
async fn test_component_finishing_early_ends_run() {
    let out = Pipeline::from_iter(0..100u32)
        .pipe_stage(TakeFirst, 1)
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![0]);
}

#[tokio::test]
async fn test_component_finishing_early_with_idle_source() {
    let (tx, rx) = mpsc::channel(4);
    tx.send(7u32).await.unwrap();

    // the sender stays open, so the source never ends on its own
    let run = Pipeline::from_receiver(rx).pipe_stage(TakeFirst, 1).collect();
    let out = tokio::time::timeout(Duration::from_millis(500), run)
        .await
        .expect("run should settle once the component returns")
        .unwrap();
    assert_eq!(out, vec![7]);
    drop(tx);
}

#[tokio::test]
async fn test_early_finish_unwinds_through_transforms() {
    let (tx, rx) = mpsc::channel(4);
    tx.send(1u32).await.unwrap();
    tx.send(2).await.unwrap();

    let run = Pipeline::from_receiver(rx)
        .map(|x| x * 10, 2)
        .filter(|x| *x > 0, 1)
        .pipe_stage(TakeFirst, 1)
        .collect();
    let out = tokio::time::timeout(Duration::from_millis(500), run)
        .await
        .expect("run should settle once the component returns")
        .unwrap();
    assert_eq!(out, vec![10]);
    drop(tx);
}

#[tokio::test]
async fn test_receiver_source() {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        for i in 0..50u32 {
            if tx.send(i).await.is_err() {
                break;
            }
        }
    });

    let out = Pipeline::from_receiver(rx)
        .filter(|x| x % 10 == 0, 2)
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![0, 10, 20, 30, 40]);
}

#[tokio::test]
async fn test_stream_source() {
    let out = Pipeline::from_stream(stream::iter(vec![3u32, 1, 2]))
        .map(|x| x * 3, 2)
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![9, 3, 6]);
}

#[tokio::test]
async fn test_stage_metrics_after_run() {
    let pipeline = Pipeline::from_iter(0..10u32)
        .filter(|x| x % 2 == 0, 2)
        .map(|x| x, 2);
    let execution = pipeline.into_execution();
    execution.wait().await.unwrap();

    let filter = execution.stage_metrics(0).unwrap().snapshot();
    assert_eq!(filter.total_accepted, 10);
    assert_eq!(filter.total_emitted, 5);
    assert_eq!(filter.total_dropped, 5);
    assert_eq!(execution.stage_metrics(1).unwrap().total_emitted(), 5);
    assert!(execution.stage_metrics(2).is_none());
}
