use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::notify::{Dispatcher, Notification};
use crate::observability::{NOTIFICATIONS_DROPPED_TOTAL, NOTIFICATIONS_FAILED_TOTAL};

/// Posts notifications as JSON to an HTTP endpoint.
///
/// `dispatch` only enqueues. A single worker drains the queue in order; a
/// full queue drops the notification, a failed POST is logged and counted.
pub struct WebhookDispatcher {
    tx: mpsc::Sender<Notification>,
}

impl WebhookDispatcher {
    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(url: String, timeout: Duration, queue: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let (tx, rx) = mpsc::channel(queue.max(1));
        tokio::spawn(delivery_loop(client, url, rx));
        Ok(Self { tx })
    }
}

impl Dispatcher for WebhookDispatcher {
    fn dispatch(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(kind = %n.kind, ticket = %n.ticket_id, "webhook queue full, dropping notification");
                metrics::counter!(NOTIFICATIONS_DROPPED_TOTAL).increment(1);
            }
            Err(TrySendError::Closed(n)) => {
                warn!(kind = %n.kind, ticket = %n.ticket_id, "webhook worker stopped, dropping notification");
                metrics::counter!(NOTIFICATIONS_DROPPED_TOTAL).increment(1);
            }
        }
    }
}

async fn delivery_loop(client: reqwest::Client, url: String, mut rx: mpsc::Receiver<Notification>) {
    while let Some(n) = rx.recv().await {
        if let Err(e) = deliver(&client, &url, &n).await {
            warn!(kind = %n.kind, ticket = %n.ticket_id, "notification delivery failed: {e}");
            metrics::counter!(NOTIFICATIONS_FAILED_TOTAL, "kind" => n.kind.as_str()).increment(1);
        }
    }
}

async fn deliver(client: &reqwest::Client, url: &str, n: &Notification) -> Result<(), reqwest::Error> {
    client.post(url).json(n).send().await?.error_for_status()?;
    Ok(())
}
