use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use appstore_core::messages::{MessageType, EXCHANGE, QUEUE_DEPLOYMENTS};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::dispatch;
use crate::handler::{Disposition, MessageHandler};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub url: String,
    pub exchange: String,
    pub queue: String,
    /// Unacknowledged deliveries in flight.
    pub prefetch: u16,
    /// Wait between failed connection attempts.
    pub retry_delay: Duration,
    /// Declared as `x-dead-letter-exchange` on the queue when set.
    pub dead_letter_exchange: Option<String>,
    pub consumer_tag: String,
}

impl ConsumerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: EXCHANGE.to_string(),
            queue: QUEUE_DEPLOYMENTS.to_string(),
            prefetch: 10,
            retry_delay: Duration::from_secs(5),
            dead_letter_exchange: None,
            consumer_tag: "appstore-operator".to_string(),
        }
    }
}

/// Why a broker session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Cancellation observed; do not reconnect.
    Stopped,
    /// Reconnect after `after`.
    Retry { error: anyhow::Error, after: Duration },
}

/// Long-lived consumer of the deployment queue. Handles one delivery at a time.
pub struct Consumer {
    cfg: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
}

impl Consumer {
    pub fn new(cfg: ConsumerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self { cfg, handler }
    }

    /// Connect, declare, consume; repeat until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            match self.session(&token).await {
                SessionEnd::Stopped => {
                    info!(queue = %self.cfg.queue, "consumer stopped");
                    return;
                }
                SessionEnd::Retry { error, after } => {
                    warn!(queue = %self.cfg.queue, error = %format!("{:#}", error), retry_in_ms = after.as_millis() as u64, "consumer session ended");
                    tokio::select! {
                        _ = token.cancelled() => {
                            info!(queue = %self.cfg.queue, "consumer stopped");
                            return;
                        }
                        _ = tokio::time::sleep(after) => {}
                    }
                }
            }
        }
    }

    async fn session(&self, token: &CancellationToken) -> SessionEnd {
        let delay = self.cfg.retry_delay;
        let conn = tokio::select! {
            _ = token.cancelled() => return SessionEnd::Stopped,
            res = Connection::connect(&self.cfg.url, ConnectionProperties::default()) => match res {
                Ok(c) => c,
                Err(e) => return SessionEnd::Retry { error: anyhow!(e).context("connecting to broker"), after: delay },
            },
        };
        let channel = match self.declare(&conn).await {
            Ok(ch) => ch,
            Err(error) => {
                let _ = conn.close(0, "declare failed").await;
                return SessionEnd::Retry { error, after: delay };
            }
        };
        let mut deliveries = match channel
            .basic_consume(&self.cfg.queue, &self.cfg.consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let _ = conn.close(0, "consume failed").await;
                return SessionEnd::Retry { error: anyhow!(e).context("starting consumer"), after: delay };
            }
        };
        info!(queue = %self.cfg.queue, exchange = %self.cfg.exchange, prefetch = self.cfg.prefetch, "consuming deployment messages");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = channel.close(200, "shutdown").await;
                    let _ = conn.close(200, "shutdown").await;
                    return SessionEnd::Stopped;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(error) = self.handle(delivery).await {
                            return SessionEnd::Retry { error, after: Duration::ZERO };
                        }
                    }
                    Some(Err(e)) => {
                        return SessionEnd::Retry { error: anyhow!(e).context("connection lost"), after: Duration::ZERO };
                    }
                    None => {
                        return SessionEnd::Retry { error: anyhow!("delivery stream closed by broker"), after: Duration::ZERO };
                    }
                }
            }
        }
    }

    /// Idempotent topology: exchange, queue, bindings.
    async fn declare(&self, conn: &Connection) -> Result<Channel> {
        let channel = conn.create_channel().await.context("opening channel")?;
        channel.basic_qos(self.cfg.prefetch, BasicQosOptions::default()).await.context("setting prefetch")?;
        channel
            .exchange_declare(
                &self.cfg.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("declaring exchange {}", self.cfg.exchange))?;
        let mut args = FieldTable::default();
        if let Some(dlx) = &self.cfg.dead_letter_exchange {
            args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(dlx.clone().into()));
        }
        channel
            .queue_declare(&self.cfg.queue, QueueDeclareOptions { durable: true, ..Default::default() }, args)
            .await
            .with_context(|| format!("declaring queue {}", self.cfg.queue))?;
        for key in MessageType::deployment_keys() {
            channel
                .queue_bind(&self.cfg.queue, &self.cfg.exchange, key, QueueBindOptions::default(), FieldTable::default())
                .await
                .with_context(|| format!("binding {} to {}", key, self.cfg.queue))?;
        }
        Ok(channel)
    }

    async fn handle(&self, delivery: Delivery) -> Result<()> {
        let outcome = dispatch(self.handler.as_ref(), &delivery.data).await;
        let kind = outcome.kind.as_deref().unwrap_or("?");
        let id = outcome.id.as_deref().unwrap_or("?");
        match outcome.disposition() {
            Disposition::Ack => {
                debug!(msg_id = %id, kind, redelivered = delivery.redelivered, "message handled");
                delivery.acker.ack(BasicAckOptions::default()).await.context("acking delivery")?;
            }
            Disposition::Requeue => {
                if let Err(e) = &outcome.result {
                    warn!(msg_id = %id, kind, error = %e, "message failed; requeueing");
                }
                delivery
                    .acker
                    .nack(BasicNackOptions { requeue: true, ..Default::default() })
                    .await
                    .context("nacking delivery")?;
            }
            Disposition::Reject => {
                if let Err(e) = &outcome.result {
                    warn!(msg_id = %id, kind, error = %e, "message rejected");
                }
                delivery.acker.reject(BasicRejectOptions { requeue: false }).await.context("rejecting delivery")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_wire_contract() {
        let cfg = ConsumerConfig::new("amqp://localhost:5672/%2f");
        assert_eq!(cfg.exchange, "appstore");
        assert_eq!(cfg.queue, "appstore.deployments");
        assert_eq!(cfg.prefetch, 10);
        assert_eq!(cfg.retry_delay, Duration::from_secs(5));
        assert!(cfg.dead_letter_exchange.is_none());
    }
}
