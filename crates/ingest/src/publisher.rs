use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use appstore_core::messages::{Envelope, MessageType, StatusNotifier, StatusUpdate};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for connecting plus one confirmed publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent publisher on the topic exchange. Connects lazily, waits for
/// broker confirms and reconnects after a failed publish.
pub struct Publisher {
    url: String,
    exchange: String,
    source: String,
    timeout: Duration,
    link: Mutex<Option<(Connection, Channel)>>,
}

impl Publisher {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            source: source.into(),
            timeout: DEFAULT_PUBLISH_TIMEOUT,
            link: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn open(&self) -> Result<(Connection, Channel)> {
        let conn = Connection::connect(&self.url, ConnectionProperties::default()).await.context("connecting to broker")?;
        let channel = conn.create_channel().await.context("opening channel")?;
        channel.confirm_select(ConfirmSelectOptions::default()).await.context("enabling publisher confirms")?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("declaring exchange {}", self.exchange))?;
        Ok((conn, channel))
    }

    /// Wrap `payload` in an envelope and publish it under the type's routing
    /// key. Returns the envelope id once the broker has confirmed it.
    pub async fn publish<P: Serialize + Sync>(&self, kind: MessageType, payload: &P) -> Result<String> {
        let env = Envelope::new(kind, uuid::Uuid::new_v4().to_string(), &self.source, payload)?;
        let body = serde_json::to_vec(&env)?;
        match tokio::time::timeout(self.timeout, self.send(kind, &env, body)).await {
            Ok(res) => res,
            Err(_) => {
                // The link may be half-open; start over next time.
                *self.link.lock().await = None;
                anyhow::bail!("publishing {} timed out after {}s", kind, self.timeout.as_secs_f32())
            }
        }
    }

    async fn send(&self, kind: MessageType, env: &Envelope, body: Vec<u8>) -> Result<String> {
        let props = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(env.id.clone().into())
            .with_timestamp(env.timestamp.timestamp().max(0) as u64)
            .with_kind(kind.routing_key().into());

        let mut link = self.link.lock().await;
        if link.as_ref().map_or(true, |(conn, _)| !conn.status().connected()) {
            *link = Some(self.open().await?);
        }
        let Some((_, channel)) = link.as_ref() else {
            anyhow::bail!("no broker channel");
        };
        let res = async {
            let confirm = channel
                .basic_publish(&self.exchange, kind.routing_key(), BasicPublishOptions::default(), &body, props)
                .await?
                .await?;
            Ok::<_, lapin::Error>(confirm)
        }
        .await;
        match res {
            Ok(confirm) if confirm.is_nack() => anyhow::bail!("broker refused {} {}", kind, env.id),
            Ok(_) => {
                debug!(msg_id = %env.id, kind = %kind, "message published");
                Ok(env.id.clone())
            }
            Err(e) => {
                *link = None;
                Err(anyhow::Error::new(e).context(format!("publishing {}", kind)))
            }
        }
    }
}

/// Sends `status.update` messages for settled reconciles. `notify` only
/// queues; a background task does the publishing, so a slow or unreachable
/// broker never holds up a reconcile. Updates are dropped when the queue is
/// full.
pub struct StatusPublisher {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusPublisher {
    pub fn spawn(publisher: Arc<Publisher>, capacity: usize, token: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(drain(publisher, rx, token));
        (Self { tx }, task)
    }
}

async fn drain(publisher: Arc<Publisher>, mut rx: mpsc::Receiver<StatusUpdate>, token: CancellationToken) {
    loop {
        let update = tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(u) => u,
                None => break,
            },
        };
        match publisher.publish(MessageType::StatusUpdate, &update).await {
            Ok(_) => counter!("status_updates_published_total", 1u64, "result" => "ok"),
            Err(e) => {
                counter!("status_updates_published_total", 1u64, "result" => "error");
                warn!(name = %update.name, ns = %update.namespace, error = %format!("{:#}", e), "status update not published");
            }
        }
    }
    info!("status publisher stopped");
}

#[async_trait]
impl StatusNotifier for StatusPublisher {
    async fn notify(&self, update: StatusUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                counter!("status_updates_published_total", 1u64, "result" => "dropped");
                warn!(name = %update.name, ns = %update.namespace, "status update queue full; dropping update");
            }
            Err(TrySendError::Closed(update)) => {
                counter!("status_updates_published_total", 1u64, "result" => "dropped");
                debug!(name = %update.name, ns = %update.namespace, "status publisher stopped; dropping update");
            }
        }
    }
}
