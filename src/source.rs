use crate::error::BoxError;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Lazily-polled producer feeding the first stage.
///
/// Nothing is pulled before the pipeline starts. An `Err` item is the source's error
/// signal and fails the run; end of stream ends the input.
pub struct Source<T> {
    stream: BoxStream<'static, Result<T, BoxError>>,
}

impl<T: Send + 'static> Source<T> {
    /// A single value
    pub fn once(value: T) -> Self {
        Self::from_iter(std::iter::once(value))
    }

    /// A finite ordered sequence
    pub fn from_iter<It>(items: It) -> Self
    where
        It: IntoIterator<Item = T>,
        It::IntoIter: Send + 'static,
    {
        Self {
            stream: stream::iter(items).map(Ok).boxed(),
        }
    }

    /// An infallible external producer
    pub fn from_stream<S>(items: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            stream: items.map(Ok).boxed(),
        }
    }

    /// A fallible external producer; the first `Err` fails the run
    pub fn from_try_stream<S, E>(items: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self {
            stream: items.map(|item| item.map_err(Into::into)).boxed(),
        }
    }

    /// An external push producer; ends once every sender is dropped
    pub fn from_receiver(rx: mpsc::Receiver<T>) -> Self {
        Self::from_stream(ReceiverStream::new(rx))
    }

    pub(crate) fn into_stream(self) -> BoxStream<'static, Result<T, BoxError>> {
        self.stream
    }
}

impl<T> std::fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").finish_non_exhaustive()
    }
}
