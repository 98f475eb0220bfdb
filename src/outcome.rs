//! Terminal outcome of a pipeline run.
//!
//! A single watch channel carries the outcome. Settling is first-wins; every later
//! attempt is ignored. Settlement also serves as the pipeline-wide halt signal: stages
//! watch it and stop accepting or forwarding once it flips.

use crate::error::{PipelineError, Result};
use std::sync::Arc;
use tokio::sync::watch;

type State = Option<std::result::Result<(), PipelineError>>;

#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    tx: Arc<watch::Sender<State>>,
}

impl Outcome {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Settle the outcome. Returns whether this call was the one that settled it.
    pub fn settle(&self, result: Result<()>) -> bool {
        let mut pending = Some(result);
        let settled = self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = pending.take();
            true
        });

        if settled {
            match self.tx.borrow().as_ref() {
                Some(Err(err)) => tracing::debug!(error = %err, "pipeline settled with failure"),
                _ => tracing::debug!("pipeline completed"),
            }
        }
        settled
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> Watcher {
        Watcher {
            rx: self.tx.subscribe(),
            outcome: self.clone(),
        }
    }
}

/// Observer of an [`Outcome`]
#[derive(Debug)]
pub(crate) struct Watcher {
    rx: watch::Receiver<State>,
    // keeps the sender alive for as long as anyone is watching
    outcome: Outcome,
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        self.outcome.subscribe()
    }
}

impl Watcher {
    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until the outcome is settled and return it
    pub async fn settled(&mut self) -> Result<()> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Ok(())),
            Err(_) => Err(PipelineError::Shutdown),
        }
    }
}
