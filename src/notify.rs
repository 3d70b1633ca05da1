//! Subscriber callbacks and notification fan-out.
//!
//! Every subscriber uses one calling convention: an `Arc`'d closure returning a boxed
//! future that resolves to `anyhow::Result<()>`. The `Notifier` runs all callbacks for
//! an event concurrently and contains their failures, so a broken subscriber can
//! neither starve the others nor fail the operation that raised the event.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::events::{Event, LogEvent};

/// Receives each line of server output.
pub type LogCallback = Arc<dyn Fn(LogEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Told that some server's state changed.
pub type StatusCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`LogCallback`].
pub fn log_callback<F, Fut>(f: F) -> LogCallback
where
    F: Fn(LogEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Wraps an async closure as a [`StatusCallback`].
pub fn status_callback<F, Fut>(f: F) -> StatusCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Forwards log lines into an event channel.
///
/// A full channel drops the event instead of stalling the output drain; the lines
/// themselves are already in the log ring.
pub fn channel_log_callback(tx: mpsc::Sender<Event>) -> LogCallback {
    log_callback(move |event| {
        let result = match tx.try_send(Event::Log(event)) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(anyhow!("event channel closed")),
        };
        async move { result }
    })
}

/// Forwards status changes into an event channel.
///
/// Status changes carry no payload, so one already queued stands in for any that
/// arrive while the channel is full.
pub fn channel_status_callback(tx: mpsc::Sender<Event>) -> StatusCallback {
    status_callback(move || {
        let result = match tx.try_send(Event::StatusChanged) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(anyhow!("event channel closed")),
        };
        async move { result }
    })
}

/// Where a managed process writes its output.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// One decoded line, in the order it was read.
    async fn line(&self, event: LogEvent);

    /// The output stream of `server` reached EOF or failed.
    async fn closed(&self, _server: &str) {}
}

/// Ordered lists of log and status subscribers.
#[derive(Default)]
pub struct Notifier {
    log_callbacks: RwLock<Vec<LogCallback>>,
    status_callbacks: RwLock<Vec<StatusCallback>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_log_callback(&self, callback: LogCallback) {
        self.log_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub fn add_status_callback(&self, callback: StatusCallback) {
        self.status_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Delivers `event` to every log subscriber.
    pub async fn log(&self, event: LogEvent) {
        let callbacks = self
            .log_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let deliveries = callbacks.into_iter().enumerate().map(|(idx, callback)| {
            let event = event.clone();
            guarded("log", idx, async move { callback(event).await })
        });
        join_all(deliveries).await;
    }

    /// Tells every status subscriber that something changed.
    pub async fn status_changed(&self) {
        let callbacks = self
            .status_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let deliveries = callbacks
            .into_iter()
            .enumerate()
            .map(|(idx, callback)| guarded("status", idx, async move { callback().await }));
        join_all(deliveries).await;
    }
}

#[async_trait]
impl OutputSink for Notifier {
    async fn line(&self, event: LogEvent) {
        self.log(event).await;
    }

    async fn closed(&self, _server: &str) {
        self.status_changed().await;
    }
}

async fn guarded<F>(kind: &'static str, idx: usize, delivery: F)
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(delivery).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("{} subscriber #{} failed: {:#}", kind, idx, err),
        Err(_) => warn!("{} subscriber #{} panicked", kind, idx),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    fn counting_log(counter: Arc<AtomicUsize>) -> LogCallback {
        log_callback(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn failing_subscribers_do_not_block_others() {
        let notifier = Notifier::new();
        let counter = Arc::new(AtomicUsize::new(0));
        notifier.add_log_callback(log_callback(|_event| async { bail!("boom") }));
        notifier.add_log_callback(log_callback(|event: LogEvent| async move {
            assert!(event.line.is_empty(), "subscriber bug");
            Ok(())
        }));
        notifier.add_log_callback(counting_log(Arc::clone(&counter)));

        notifier.log(LogEvent::now("api", "hello", true)).await;
        notifier.log(LogEvent::now("api", "again", true)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn status_subscribers_all_fire() {
        let notifier = Notifier::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            notifier.add_status_callback(status_callback(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        notifier.add_status_callback(status_callback(|| async { bail!("closed") }));
        notifier.status_changed().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sink_preserves_line_order() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            notifier.add_log_callback(log_callback(move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(event.line);
                    Ok(())
                }
            }));
        }
        for idx in 0..20 {
            notifier.line(LogEvent::now("api", format!("{idx}"), true)).await;
        }
        let expected: Vec<String> = (0..20).map(|idx| idx.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn channel_callbacks_report_closed_receivers() {
        let (tx, rx) = mpsc::channel(1);
        let callback = channel_log_callback(tx.clone());
        callback(LogEvent::now("api", "one", true)).await.unwrap();
        // Full channel: dropped, not an error.
        callback(LogEvent::now("api", "overflow", true)).await.unwrap();
        drop(rx);
        assert!(callback(LogEvent::now("api", "two", true)).await.is_err());
        assert!(channel_status_callback(tx)().await.is_err());
    }
}
