//! Bounded producer/consumer prefetching over a shared source

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver};
use tracing::debug;

use crate::error::{Error, Result};
use crate::source::SharedSource;

/// Default capacity of the prefetch queue
pub const DEFAULT_PREFETCH_LIMIT: usize = 20;

/// Default number of worker threads in unordered mode
pub const DEFAULT_EXECUTORS: usize = 4;

/// A transformation applied to each raw item on a worker thread.
///
/// Returning `Ok(None)` is a failure, not a skip: the consumer receives an
/// [`Error::EmptyTransform`] in place of the missing item. Implemented for
/// any `Fn(I) -> Result<Option<O>>` closure.
pub trait Transform<I>: Send + Sync {
    /// The type of transformed items
    type Output: Send;

    /// Transform one raw item
    fn transform(&self, item: I) -> Result<Option<Self::Output>>;
}

impl<I, O, F> Transform<I> for F
where
    F: Fn(I) -> Result<Option<O>> + Send + Sync,
    O: Send,
{
    type Output = O;

    fn transform(&self, item: I) -> Result<Option<O>> {
        self(item)
    }
}

/// Configuration for a [`Prefetcher`]
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Capacity of the bounded work queue; workers block once it is full
    pub prefetch_limit: usize,

    /// Number of worker threads when `ordered` is false
    pub executors: usize,

    /// When true, a single worker drains the source so output order equals
    /// source order. When false, workers race and only the set of yielded
    /// items is guaranteed.
    pub ordered: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            executors: DEFAULT_EXECUTORS,
            ordered: true,
        }
    }
}

/// A pipelined iterator: worker threads pull raw items from a shared
/// source, transform them, and push results into a bounded queue that this
/// iterator drains.
///
/// The bounded queue provides backpressure in both directions: workers
/// block on a full queue, the consumer blocks on an empty one. Exhaustion
/// is signaled structurally: each worker drops its queue handle when it
/// exits, and the stream is done exactly when the queue is disconnected and
/// drained. Transform failures are delivered to the consumer as `Err`
/// items at the position the item would have occupied; items yielded
/// before a failure remain valid.
///
/// Dropping the prefetcher mid-stream disconnects the queue, which stops
/// blocked workers, and joins every worker thread before returning.
pub struct Prefetcher<T> {
    receiver: Option<Receiver<Result<T>>>,
    workers: Vec<JoinHandle<()>>,
    produced: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Prefetcher<T> {
    /// Start prefetching from `source`, applying `transform` to each item
    /// on a worker thread.
    ///
    /// In-memory sequences are turned into lazy iterators by `into_iter`;
    /// remote sources (paginators) are consumed one item at a time under
    /// the shared-source lock.
    pub fn spawn<S, F>(source: S, transform: F, config: PrefetchConfig) -> Result<Self>
    where
        S: IntoIterator,
        S::IntoIter: Send + 'static,
        S::Item: Send + 'static,
        F: Transform<S::Item, Output = T> + 'static,
    {
        let capacity = config.prefetch_limit.max(1);
        let executors = if config.ordered {
            1
        } else {
            config.executors.max(1)
        };

        let shared = SharedSource::new(source.into_iter());
        let transform = Arc::new(transform);
        let produced = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let (sender, receiver) = bounded::<Result<T>>(capacity);
        let mut workers = Vec::with_capacity(executors);

        for index in 0..executors {
            let mut source = shared.clone();
            let worker_sender = sender.clone();
            let transform = Arc::clone(&transform);
            let produced = Arc::clone(&produced);
            let errors = Arc::clone(&errors);

            let spawned = std::thread::Builder::new()
                .name(format!("annofeed-prefetch-{index}"))
                .spawn(move || {
                    let mut local = 0usize;
                    while let Some(item) = source.next() {
                        let outcome = match transform.transform(item) {
                            Ok(Some(value)) => Ok(value),
                            Ok(None) => Err(Error::EmptyTransform),
                            Err(error) => Err(error),
                        };
                        match outcome {
                            Ok(value) => {
                                if worker_sender.send(Ok(value)).is_err() {
                                    debug!(worker = index, "consumer dropped, stopping");
                                    return;
                                }
                                local += 1;
                                produced.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(error) => {
                                debug!(
                                    worker = index,
                                    error = %error,
                                    "transform failed, stopping worker"
                                );
                                errors.fetch_add(1, Ordering::Relaxed);
                                let _ = worker_sender.send(Err(error));
                                return;
                            }
                        }
                    }
                    debug!(worker = index, produced = local, "source exhausted");
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    // Disconnect the queue so already-running workers exit,
                    // then join them before reporting the failure.
                    drop(sender);
                    drop(receiver);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(Error::Io(error));
                }
            }
        }
        drop(sender);

        Ok(Self {
            receiver: Some(receiver),
            workers,
            produced,
            errors,
        })
    }
}

impl<T> Prefetcher<T> {
    /// Number of items handed to the consumer queue so far
    pub fn produced_count(&self) -> usize {
        self.produced.load(Ordering::Relaxed)
    }

    /// Number of transform failures encountered so far
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Number of items currently buffered in the queue
    pub fn queue_len(&self) -> usize {
        self.receiver.as_ref().map_or(0, Receiver::len)
    }

    /// Whether every worker has finished and the queue has been drained
    pub fn is_exhausted(&self) -> bool {
        self.receiver.is_none()
    }

    fn shutdown(&mut self) {
        self.receiver = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T> Iterator for Prefetcher<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let receiver = self.receiver.as_ref()?;
        match receiver.recv() {
            Ok(item) => Some(item),
            // Disconnected and drained: every worker has exited
            Err(_) => {
                self.shutdown();
                None
            }
        }
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
