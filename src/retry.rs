// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry executor.
//!
//! A [`RetryBlock`] owns a bounded queue and a dispatcher task. The
//! dispatcher takes a [`Bulkhead`] permit per item and runs the handler on
//! a worker task, so at most `max_concurrency` items are in flight.
//!
//! ```text
//! post() ──→ [bounded mpsc] ──→ dispatcher ──permit──→ worker
//!                                                        │
//!                                  fail: sleep backoff ←─┤
//!                                  success / exhausted ←─┘
//! ```
//!
//! An item that keeps failing is attempted exactly `maximum_attempts` times,
//! then logged at `error!` and dropped. [`drain()`](RetryBlock::drain)
//! closes the queue and waits for queued and in-flight items;
//! [`shutdown()`](RetryBlock::shutdown) additionally abandons items that
//! are waiting out a backoff.

use crate::config::RetryBlockConfig;
use crate::error::{ProgressError, Result};
use crate::metrics;
use crate::resilience::{sleep_or_shutdown, Bulkhead, RetrySchedule};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info_span, trace, warn, Instrument};

type Attempt = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Handler<T> = Arc<dyn Fn(T) -> Attempt + Send + Sync>;

/// A unit of work and the attempts already spent on it.
#[derive(Debug, Clone)]
pub struct RetryItem<T> {
    pub item: T,
    pub attempts: u32,
}

/// Counters for a retry block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Items whose handler eventually succeeded.
    pub completed: u64,
    /// Individual failed attempts.
    pub failed_attempts: u64,
    /// Items dropped after `maximum_attempts` failures.
    pub exhausted: u64,
    /// Items dropped because shutdown interrupted their backoff.
    pub abandoned: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed_attempts: AtomicU64,
    exhausted: AtomicU64,
    abandoned: AtomicU64,
}

struct Worker<T> {
    name: String,
    handler: Handler<T>,
    schedule: RetrySchedule,
    maximum_attempts: u32,
    counters: Counters,
}

impl<T: Clone + Send + 'static> Worker<T> {
    /// One attempt. Returns the error on failure.
    async fn attempt(&self, retry: &mut RetryItem<T>) -> Result<()> {
        retry.attempts += 1;
        let result = (self.handler)(retry.item.clone()).await;
        match &result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::record_retry_attempt(&self.name, true);
            }
            Err(_) => {
                self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                metrics::record_retry_attempt(&self.name, false);
            }
        }
        result
    }

    fn exhausted(&self, retry: &RetryItem<T>, e: &ProgressError) -> bool {
        if retry.attempts < self.maximum_attempts {
            return false;
        }
        error!(
            block = %self.name,
            attempts = retry.attempts,
            error = %e,
            "Retry attempts exhausted, discarding item"
        );
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        metrics::record_retry_exhausted(&self.name);
        true
    }

    async fn process(&self, mut retry: RetryItem<T>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if retry.attempts > 0 {
                let delay = self.schedule.delay_for_attempt(retry.attempts);
                if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    warn!(
                        block = %self.name,
                        attempts = retry.attempts,
                        "Shutdown during backoff, abandoning item"
                    );
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }

            match self.attempt(&mut retry).await {
                Ok(()) => {
                    if retry.attempts > 1 {
                        debug!(block = %self.name, attempts = retry.attempts, "Item succeeded after retry");
                    }
                    return;
                }
                Err(e) => {
                    if self.exhausted(&retry, &e) {
                        return;
                    }
                    debug!(
                        block = %self.name,
                        attempts = retry.attempts,
                        error = %e,
                        "Attempt failed, will retry"
                    );
                }
            }
        }
    }
}

/// Bounded-concurrency executor with per-item retry and backoff.
pub struct RetryBlock<T> {
    worker: Arc<Worker<T>>,
    sender: Mutex<Option<mpsc::Sender<RetryItem<T>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Clone + Send + Sync + 'static> RetryBlock<T> {
    /// Create the block and spawn its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F, Fut>(name: impl Into<String>, config: &RetryBlockConfig, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |item| -> Attempt { Box::pin(handler(item)) });
        let worker = Arc::new(Worker {
            name: name.into(),
            handler,
            schedule: config.schedule(),
            maximum_attempts: config.maximum_attempts.max(1),
            counters: Counters::default(),
        });

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bulkhead = Arc::new(Bulkhead::new(config.max_concurrency));

        let span = info_span!("retry_block", block = %worker.name);
        let dispatcher = tokio::spawn(
            dispatch(Arc::clone(&worker), rx, bulkhead, shutdown_rx).instrument(span),
        );

        Self {
            worker,
            sender: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.worker.name
    }

    async fn enqueue(&self, retry: RetryItem<T>) -> Result<()> {
        let sender = self.sender.lock().await.clone().ok_or(ProgressError::Shutdown)?;
        sender.send(retry).await.map_err(|_| ProgressError::Shutdown)
    }

    /// Queue an item for processing. Waits only if the queue is full.
    ///
    /// Fails with [`ProgressError::Shutdown`] once the block is draining.
    pub async fn post(&self, item: T) -> Result<()> {
        self.enqueue(RetryItem { item, attempts: 0 }).await
    }

    /// Attempt the item on the caller's task; on failure queue it for
    /// retry with one attempt already spent.
    pub async fn post_async(&self, item: T) -> Result<()> {
        if self.sender.lock().await.is_none() {
            return Err(ProgressError::Shutdown);
        }
        let mut retry = RetryItem { item, attempts: 0 };
        match self.worker.attempt(&mut retry).await {
            Ok(()) => Ok(()),
            Err(e) if self.worker.exhausted(&retry, &e) => Ok(()),
            Err(e) => {
                debug!(block = %self.worker.name, error = %e, "Immediate attempt failed, queueing");
                self.enqueue(retry).await
            }
        }
    }

    /// Stop accepting items and wait until every queued and in-flight item
    /// has completed or been discarded.
    pub async fn drain(&self) {
        self.sender.lock().await.take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(block = %self.worker.name, error = %e, "Retry dispatcher panicked");
            }
        }
    }

    /// Like [`drain()`](Self::drain), but items waiting on a backoff are
    /// abandoned instead of retried.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.drain().await;
    }

    pub fn stats(&self) -> RetryStats {
        let c = &self.worker.counters;
        RetryStats {
            completed: c.completed.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch<T: Clone + Send + Sync + 'static>(
    worker: Arc<Worker<T>>,
    mut rx: mpsc::Receiver<RetryItem<T>>,
    bulkhead: Arc<Bulkhead>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut workers = JoinSet::new();

    while let Some(retry) = rx.recv().await {
        let permit = match bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "Bulkhead closed, dropping item");
                break;
            }
        };
        trace!(in_flight = bulkhead.in_flight(), limit = bulkhead.limit(), "Dispatching item");
        let worker = Arc::clone(&worker);
        let shutdown_rx = shutdown_rx.clone();
        workers.spawn(async move {
            let _permit = permit;
            worker.process(retry, shutdown_rx).await;
        });

        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Retry worker panicked");
            }
        }
    }

    while let Some(finished) = workers.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Retry worker panicked");
        }
    }
    debug!("Retry dispatcher stopped");
}
