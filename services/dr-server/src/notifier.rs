//! Fire-and-forget notifications to agent hosts.
//!
//! Each host gets its own bounded queue drained by one delivery task, so
//! messages to a single host go out in send order and a slow host never
//! delays another. Nothing is retried: when a queue is full or delivery
//! fails the message is dropped and the agent's periodic sync catches up.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dynroute_events::{AgentNotification, DR_AGENT_TOPIC};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Default per-host queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Delivers one notification to one agent host.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, host: &str, notification: &AgentNotification) -> Result<()>;
}

// =============================================================================
// HTTP transport
// =============================================================================

/// POSTs the notification envelope to the agent's listener.
pub struct HttpTransport {
    client: reqwest::Client,
    port: u16,
}

impl HttpTransport {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, port })
    }

    fn url(&self, host: &str) -> String {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("http://[{addr}]:{}/v1/notifications", self.port),
            _ => format!("http://{host}:{}/v1/notifications", self.port),
        }
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    async fn deliver(&self, host: &str, notification: &AgentNotification) -> Result<()> {
        let url = self.url(host);
        let response = self.client.post(&url).json(notification).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("agent {host} rejected notification: {status} - {body}");
        }
        Ok(())
    }
}

// =============================================================================
// Recording transport
// =============================================================================

/// Keeps every delivered notification in memory. Used by tests.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, AgentNotification)>>,
    delivered: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `(host, notification)` pairs in delivery order.
    pub fn sent(&self) -> Vec<(String, AgentNotification)> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Wait until at least `count` notifications were delivered, or until
    /// `timeout` elapses. Returns whatever was delivered.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(String, AgentNotification)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.delivered.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent();
            }
        }
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn deliver(&self, host: &str, notification: &AgentNotification) -> Result<()> {
        match self.sent.lock() {
            Ok(mut sent) => sent.push((host.to_string(), notification.clone())),
            Err(poisoned) => poisoned
                .into_inner()
                .push((host.to_string(), notification.clone())),
        }
        self.delivered.notify_waiters();
        Ok(())
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Pushes binding changes to the agent that must act on them.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    transport: Arc<dyn NotificationTransport>,
    queues: Mutex<HashMap<String, mpsc::Sender<AgentNotification>>>,
    queue_depth: usize,
}

impl Notifier {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self::with_queue_depth(transport, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(transport: Arc<dyn NotificationTransport>, queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                transport,
                queues: Mutex::new(HashMap::new()),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    /// Queue a notification for `host`. Never blocks and never fails the
    /// caller. Must be called from within a tokio runtime.
    pub fn notify(&self, host: &str, notification: AgentNotification) {
        let method = notification.method();
        let sender = self.sender_for(host);

        match sender.try_send(notification) {
            Ok(()) => {
                debug!(
                    topic = %format!("{DR_AGENT_TOPIC}.{host}"),
                    method,
                    "Queued agent notification"
                );
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(host, method, "Notification queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(host, method, "Notification queue closed, dropping notification");
            }
        }
    }

    fn sender_for(&self, host: &str) -> mpsc::Sender<AgentNotification> {
        let mut queues = match self.inner.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(sender) = queues.get(host) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_depth);
        tokio::spawn(deliver_loop(
            host.to_string(),
            rx,
            Arc::clone(&self.inner.transport),
        ));
        queues.insert(host.to_string(), tx.clone());
        tx
    }
}

async fn deliver_loop(
    host: String,
    mut rx: mpsc::Receiver<AgentNotification>,
    transport: Arc<dyn NotificationTransport>,
) {
    while let Some(notification) = rx.recv().await {
        match transport.deliver(&host, &notification).await {
            Ok(()) => debug!(host = %host, method = notification.method(), "Delivered notification"),
            Err(e) => warn!(
                host = %host,
                method = notification.method(),
                error = %e,
                "Failed to deliver notification"
            ),
        }
    }
    debug!(host = %host, "Notification queue closed");
}
