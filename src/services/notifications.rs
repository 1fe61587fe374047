use crate::config::NotificationConfig;
use crate::models::Notification;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Delivery failed: {0}")]
    Transport(String),

    #[error("Receiver answered with status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        SendError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<(), SendError>;
}

/// POSTs each notification as JSON. Any non-2xx answer is a failed attempt.
pub struct WebhookSender {
    http: reqwest::Client,
    url: String,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        let response = self.http.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SendError::Status(status.as_u16()))
        }
    }
}

/// Writes notifications to the log instead of delivering them.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), SendError> {
        info!(
            notification_id = %notification.id,
            kind = ?notification.kind,
            recipient = %notification.recipient,
            subject = %notification.subject,
            "Notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub sender: String,
    pub max_retries: u32,
    pub enqueued: u64,
    pub pending: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub attempts: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    attempts: AtomicU64,
}

struct Delivery {
    sender: Arc<dyn NotificationSender>,
    max_attempts: u32,
    retry_delay: Duration,
    counters: Counters,
}

impl Delivery {
    async fn deliver(&self, notification: Notification) {
        for attempt in 1..=self.max_attempts {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            match self.sender.send(&notification).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(notification_id = %notification.id, attempt, "Notification delivered");
                    return;
                }
                Err(e) => {
                    warn!(
                        notification_id = %notification.id,
                        attempt,
                        max_attempts = self.max_attempts,
                        "Notification attempt failed: {}",
                        e
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            subject = %notification.subject,
            "Dropping notification after exhausting retries"
        );
    }
}

struct RunningTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Unbounded queue drained by one task. Enqueueing never waits on delivery.
pub struct NotificationDispatcher {
    queue: mpsc::UnboundedSender<Notification>,
    inbox: Arc<Mutex<mpsc::UnboundedReceiver<Notification>>>,
    delivery: Arc<Delivery>,
    task: Mutex<Option<RunningTask>>,
}

impl NotificationDispatcher {
    pub fn new(sender: Arc<dyn NotificationSender>, max_retries: u32, retry_delay: Duration) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            queue,
            inbox: Arc::new(Mutex::new(inbox)),
            delivery: Arc::new(Delivery {
                sender,
                max_attempts: max_retries.max(1),
                retry_delay,
                counters: Counters::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        let sender: Arc<dyn NotificationSender> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookSender::new(url.clone())?),
            None => Arc::new(LogSender),
        };
        Ok(Self::new(sender, config.max_retries, config.retry_delay))
    }

    pub fn enqueue(&self, notification: Notification) {
        debug!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            "Queueing notification"
        );
        // The receiver lives as long as `self`, so the channel cannot be closed.
        if self.queue.send(notification).is_ok() {
            self.delivery.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false) {
            warn!("Notification dispatcher already running");
            return false;
        }

        let shutdown = CancellationToken::new();
        let inbox = self.inbox.clone();
        let delivery = self.delivery.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            info!(sender = delivery.sender.name(), "Notification dispatcher started");
            let mut inbox = inbox.lock().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = inbox.recv() => match next {
                        Some(notification) => delivery.deliver(notification).await,
                        None => break,
                    },
                }
            }
            info!("Notification dispatcher stopped");
        });

        *task = Some(RunningTask { shutdown, handle });
        true
    }

    /// Finishes the delivery in progress; anything still queued stays queued
    /// for the next start.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let Some(RunningTask { shutdown, mut handle }) = self.task.lock().await.take() else {
            return true;
        };
        shutdown.cancel();

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Notification dispatcher task failed: {}", e);
                false
            }
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Notification dispatcher did not stop in time, forcing shutdown"
                );
                handle.abort();
                false
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn status(&self) -> DispatcherStatus {
        let counters = &self.delivery.counters;
        let enqueued = counters.enqueued.load(Ordering::Relaxed);
        let delivered = counters.delivered.load(Ordering::Relaxed);
        let dropped = counters.dropped.load(Ordering::Relaxed);
        DispatcherStatus {
            running: self.is_running().await,
            sender: self.delivery.sender.name().to_string(),
            max_retries: self.delivery.max_attempts,
            enqueued,
            pending: enqueued.saturating_sub(delivered + dropped),
            delivered,
            dropped,
            attempts: counters.attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` attempts, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationSender for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn send(&self, _notification: &Notification) -> Result<(), SendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(SendError::Transport("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn note() -> Notification {
        Notification::new(NotificationKind::PaymentCompleted, "payer@example.com", "Paid", "Thanks")
    }

    async fn settle(dispatcher: &NotificationDispatcher) -> DispatcherStatus {
        for _ in 0..100 {
            let status = dispatcher.status().await;
            if status.pending == 0 {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dispatcher.status().await
    }

    #[tokio::test]
    async fn retries_until_delivered() {
        let sender = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NotificationDispatcher::new(sender.clone(), 3, Duration::from_millis(1));
        dispatcher.start().await;
        dispatcher.enqueue(note());

        let status = settle(&dispatcher).await;
        assert_eq!(status.delivered, 1);
        assert_eq!(status.dropped, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
        dispatcher.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn drops_after_max_retries() {
        let sender = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NotificationDispatcher::new(sender.clone(), 3, Duration::from_millis(1));
        dispatcher.start().await;
        dispatcher.enqueue(note());
        dispatcher.enqueue(note());

        let status = settle(&dispatcher).await;
        assert_eq!(status.dropped, 2);
        assert_eq!(status.delivered, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 6);
        dispatcher.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn zero_retries_still_attempts_once() {
        let sender = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NotificationDispatcher::new(sender.clone(), 0, Duration::ZERO);
        dispatcher.start().await;
        dispatcher.enqueue(note());
        assert_eq!(settle(&dispatcher).await.delivered, 1);
    }

    #[tokio::test]
    async fn queue_survives_restart() {
        let sender = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NotificationDispatcher::new(sender.clone(), 1, Duration::ZERO);
        dispatcher.enqueue(note());
        assert_eq!(dispatcher.status().await.pending, 1);

        assert!(dispatcher.start().await);
        assert_eq!(settle(&dispatcher).await.delivered, 1);
        assert!(dispatcher.stop(Duration::from_secs(1)).await);
        assert!(!dispatcher.is_running().await);
    }
}
