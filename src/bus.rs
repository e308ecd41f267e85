//! Wires the bus together: inbound messages to the queueing service,
//! outbound sends and publications to the journal, subscription tracking
//! and the transport collaborator.

use std::sync::Arc;

use bon::Builder;
use chrono::Utc;
use url::Url;

use crate::error::Error;
use crate::headers::names;
use crate::journal::MessageJournalingService;
use crate::message::Message;
use crate::service::Service;
use crate::subscriptions::SubscriptionTrackingService;

/// Ships messages to remote endpoints. Supplied by the host; the bus only
/// consumes it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &Url, message: &Message) -> eyre::Result<()>;
}

#[derive(Builder)]
pub struct Bus {
    queueing: Arc<Service>,
    journaling: MessageJournalingService,
    subscriptions: SubscriptionTrackingService,
    transport: Arc<dyn Transport>,
    #[builder(into)]
    inbox_queue: String,
}

impl Bus {
    /// Accepts a raw inbound message from the transport: journals it as
    /// Received, then enqueues it on the inbox queue. The caller identity,
    /// if any, rides in the `SecurityToken` header and is restored at
    /// dispatch.
    pub async fn handle_receive(&self, message: Message) -> Result<(), Error> {
        self.journaling.journal_received(&message).await?;
        self.queueing.enqueue(&self.inbox_queue, message, None).await
    }

    /// Journals the message as Sent and ships it to its `Destination`
    /// header endpoint.
    pub async fn send(&self, mut message: Message) -> Result<(), Error> {
        if message.headers.sent().is_none() {
            message.headers.set_sent(Utc::now());
        }
        let destination = message.headers.destination().ok_or(Error::InvalidHeader {
            header: names::DESTINATION.into(),
        })?;

        self.journaling.journal_sent(&message).await?;
        self.transport
            .send(&destination, &message)
            .await
            .map_err(Error::internal)?;
        Ok(())
    }

    /// Publishes to a topic: exactly one Published journal entry, then
    /// fan-out to every live subscriber. A subscriber that cannot be
    /// reached is logged and skipped; the remaining fan-out continues.
    pub async fn publish(&self, topic: &str, mut message: Message) -> Result<(), Error> {
        message.headers.set_topic(topic);
        if message.headers.sent().is_none() {
            message.headers.set_sent(Utc::now());
        }

        self.journaling.journal_published(topic, &message).await?;

        let subscribers = self.subscriptions.get_subscribers(topic, Utc::now()).await?;
        tracing::debug!(topic, subscribers = subscribers.len(), "publishing");

        for subscriber in subscribers {
            if let Err(e) = self.transport.send(&subscriber, &message).await {
                tracing::warn!(topic, subscriber = %subscriber, error = %e,
                    "failed to deliver publication to subscriber");
            }
        }
        Ok(())
    }

    pub fn queueing(&self) -> &Arc<Service> {
        &self.queueing
    }

    pub fn journaling(&self) -> &MessageJournalingService {
        &self.journaling
    }

    pub fn subscriptions(&self) -> &SubscriptionTrackingService {
        &self.subscriptions
    }
}
