//! RabbitMQ side channel: member notifications for an external mailer, and a
//! TTL timer queue that dead-letters expired waitlist offers back to us.
//!
//! Nothing here is required for correctness. When the broker is unreachable
//! publishing is skipped and offers still expire lazily on the next waitlist
//! read.

use std::sync::Arc;

use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments, Channel,
        ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
    consumer::AsyncConsumer,
    BasicProperties, Deliver, FieldTable,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::actions::{self, Transition};
use crate::config::AmqpConfig;
use crate::db::DbPool;
use crate::models::{MembershipTier, WaitlistEntry};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

const NOTIFICATION_EXCHANGE: &str = "membership.notifications";
const MAILER_QUEUE: &str = "membership.mailer";
const OFFER_TIMER_QUEUE: &str = "waitlist.offer.timer";
const DEAD_LETTER_EXCHANGE: &str = "waitlist.dead.letter";
const EXPIRED_OFFER_QUEUE: &str = "waitlist.offer.expired";
const EXPIRED_ROUTING_KEY: &str = "offer.expired";

/// Messages for the mailer, published on the notifications topic exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    RegistrationConfirmed {
        user_id: Uuid,
        event_id: Uuid,
        registration_id: Uuid,
        confirmation_code: String,
    },
    RegistrationCancelled {
        user_id: Uuid,
        event_id: Uuid,
        registration_id: Uuid,
    },
    WaitlistJoined {
        user_id: Uuid,
        event_id: Uuid,
        position: Option<i32>,
    },
    SeatOffered {
        user_id: Uuid,
        event_id: Uuid,
        entry_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    },
    MembershipActivated {
        user_id: Uuid,
        tier: Option<MembershipTier>,
        expires_at: Option<DateTime<Utc>>,
    },
    RefundIssued {
        user_id: Uuid,
        event_id: Uuid,
        registration_id: Uuid,
        amount_cents: i32,
        currency: String,
    },
}

impl Notification {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Notification::RegistrationConfirmed { .. } => "registration.confirmed",
            Notification::RegistrationCancelled { .. } => "registration.cancelled",
            Notification::WaitlistJoined { .. } => "waitlist.joined",
            Notification::SeatOffered { .. } => "waitlist.offered",
            Notification::MembershipActivated { .. } => "membership.activated",
            Notification::RefundIssued { .. } => "registration.refunded",
        }
    }

    pub fn seat_offered(entry: &WaitlistEntry) -> Self {
        Notification::SeatOffered {
            user_id: entry.user_id,
            event_id: entry.event_id,
            entry_id: entry.id,
            expires_at: entry.offer_expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OfferExpirationMessage {
    entry_id: Uuid,
    event_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Message TTL for an offer timer: time left until expiry plus a second of slack.
fn timer_ttl_ms(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_milliseconds().max(0) + 1_000
}

struct ExpiredOfferConsumer {
    service: QueueService,
}

#[async_trait::async_trait]
impl AsyncConsumer for ExpiredOfferConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        if let Err(e) = self.handle_expired_offer(channel, deliver, content).await {
            error!("Failed to process expired waitlist offer: {:?}", e);
        }
    }
}

impl ExpiredOfferConsumer {
    async fn handle_expired_offer(&mut self, channel: &Channel, deliver: Deliver, content: Vec<u8>) -> Result<()> {
        let message = match serde_json::from_slice::<OfferExpirationMessage>(&content) {
            Ok(message) => message,
            Err(e) => {
                // Malformed: drop it, requeueing would loop forever.
                channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, false))
                    .await?;
                return Err(e.into());
            }
        };
        debug!("Offer timer fired for waitlist entry {}", message.entry_id);

        let pool = self.service.db_pool.clone();
        let entry_id = message.entry_id;
        let outcome = match tokio::task::spawn_blocking(move || -> Result<Transition<bool>> {
            let mut conn = pool.get()?;
            Ok(actions::waitlist::expire_offer(&mut conn, entry_id, Utc::now())?)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(transition) => {
                if transition.value {
                    info!("Expired waitlist offer {} for event {}", message.entry_id, message.event_id);
                }
                channel.basic_ack(BasicAckArguments::new(deliver.delivery_tag(), false)).await?;
                self.service.announce_offers(&transition.offers).await;
                Ok(())
            }
            Err(e) => {
                channel
                    .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, true))
                    .await?;
                Err(e)
            }
        }
    }
}

#[derive(Clone)]
pub struct QueueService {
    db_pool: DbPool,
    amqp: AmqpConfig,
    connection: Option<Arc<Connection>>,
}

impl QueueService {
    pub fn new(db_pool: DbPool, amqp: AmqpConfig) -> Self {
        Self { db_pool, amqp, connection: None }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        info!("Connecting to RabbitMQ at {}:{}", self.amqp.host, self.amqp.port);

        let connection = Connection::open(&OpenConnectionArguments::new(
            &self.amqp.host,
            self.amqp.port,
            &self.amqp.user,
            &self.amqp.password,
        ))
        .await?;
        connection.register_callback(DefaultConnectionCallback).await?;

        let setup = connection.open_channel(None).await?;
        setup.register_callback(DefaultChannelCallback).await?;

        setup
            .exchange_declare(ExchangeDeclareArguments::new(NOTIFICATION_EXCHANGE, "topic").durable(true).finish())
            .await?;
        setup
            .queue_declare(QueueDeclareArguments::new(MAILER_QUEUE).durable(true).finish())
            .await?;
        setup
            .queue_bind(QueueBindArguments::new(MAILER_QUEUE, NOTIFICATION_EXCHANGE, "#").finish())
            .await?;

        setup
            .exchange_declare(ExchangeDeclareArguments::new(DEAD_LETTER_EXCHANGE, "direct").durable(true).finish())
            .await?;
        setup
            .queue_declare(QueueDeclareArguments::new(EXPIRED_OFFER_QUEUE).durable(true).finish())
            .await?;
        setup
            .queue_bind(QueueBindArguments::new(EXPIRED_OFFER_QUEUE, DEAD_LETTER_EXCHANGE, EXPIRED_ROUTING_KEY).finish())
            .await?;

        // Timer queue: nobody consumes it, messages dead-letter when their TTL runs out.
        let mut args = FieldTable::new();
        args.insert("x-dead-letter-exchange".try_into()?, DEAD_LETTER_EXCHANGE.to_string().into());
        args.insert("x-dead-letter-routing-key".try_into()?, EXPIRED_ROUTING_KEY.to_string().into());
        setup
            .queue_declare(QueueDeclareArguments::new(OFFER_TIMER_QUEUE).durable(true).arguments(args).finish())
            .await?;

        let _ = setup.close().await;
        self.connection = Some(Arc::new(connection));
        info!("Connected to RabbitMQ and declared notification and timer queues");
        Ok(())
    }

    async fn get_fresh_channel(&self) -> Result<Channel> {
        match &self.connection {
            Some(connection) => {
                let channel = connection.open_channel(None).await?;
                channel.register_callback(DefaultChannelCallback).await?;
                Ok(channel)
            }
            None => Err("RabbitMQ connection not initialized".into()),
        }
    }

    /// Retries once with backoff, then logs and gives up. Queue failures never
    /// propagate to the request that caused them.
    async fn safe_queue_operation<F, Fut>(&self, what: &str, operation: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if self.connection.is_none() {
            debug!("Broker not connected, skipping {}", what);
            return;
        }

        let max_retries = 2;
        let mut delay_ms = 25;
        for attempt in 1..=max_retries {
            match operation().await {
                Ok(()) => return,
                Err(e) if attempt < max_retries => {
                    warn!("{} failed (attempt {}/{}), retrying: {:?}", what, attempt, max_retries, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    delay_ms *= 2;
                }
                Err(e) => error!("{} failed after {} attempts, giving up: {:?}", what, max_retries, e),
            }
        }
    }

    async fn publish_raw(&self, exchange: &str, routing_key: &str, body: Vec<u8>, expiration_ms: Option<i64>) -> Result<()> {
        let channel = self.get_fresh_channel().await?;
        let mut properties = BasicProperties::default();
        properties.with_delivery_mode(2).with_content_type("application/json");
        if let Some(ms) = expiration_ms {
            properties.with_expiration(&ms.to_string());
        }
        channel
            .basic_publish(properties.finish(), body, BasicPublishArguments::new(exchange, routing_key))
            .await?;
        let _ = channel.close().await;
        Ok(())
    }

    pub async fn publish(&self, notification: Notification) {
        let body = match serde_json::to_vec(&notification) {
            Ok(body) => body,
            Err(e) => {
                error!("Could not encode notification {:?}: {}", notification, e);
                return;
            }
        };
        let key = notification.routing_key();
        self.safe_queue_operation(key, || self.publish_raw(NOTIFICATION_EXCHANGE, key, body.clone(), None))
            .await;
    }

    /// Arms the expiry timer for an offered entry.
    pub async fn schedule_offer_expiry(&self, entry: &WaitlistEntry) {
        let Some(expires_at) = entry.offer_expires_at else {
            return;
        };
        let message = OfferExpirationMessage { entry_id: entry.id, event_id: entry.event_id, expires_at };
        let body = match serde_json::to_vec(&message) {
            Ok(body) => body,
            Err(e) => {
                error!("Could not encode offer timer for {}: {}", entry.id, e);
                return;
            }
        };
        let ttl = timer_ttl_ms(expires_at, Utc::now());
        self.safe_queue_operation("offer timer", || self.publish_raw("", OFFER_TIMER_QUEUE, body.clone(), Some(ttl)))
            .await;
    }

    /// Notifies newly offered members and arms their timers.
    pub async fn announce_offers(&self, offers: &[WaitlistEntry]) {
        for entry in offers {
            self.publish(Notification::seat_offered(entry)).await;
            self.schedule_offer_expiry(entry).await;
        }
    }

    pub async fn start_consuming_expired_offers(&self) -> Result<()> {
        let channel = self.get_fresh_channel().await?;
        let consumer_tag = format!("expired_offer_consumer_{}", Uuid::new_v4());
        let args = BasicConsumeArguments::new(EXPIRED_OFFER_QUEUE, &consumer_tag)
            .manual_ack(true)
            .finish();
        let consumer = ExpiredOfferConsumer { service: self.clone() };

        channel.basic_consume(consumer, args).await?;
        info!("Consuming expired waitlist offers from {}", EXPIRED_OFFER_QUEUE);

        // The consumer lives as long as its channel.
        tokio::spawn(async move {
            let _channel = channel;
            std::future::pending::<()>().await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn timer_ttl_covers_the_remaining_window() {
        let now = Utc::now();
        assert_eq!(timer_ttl_ms(now + Duration::seconds(10), now), 11_000);
        assert_eq!(timer_ttl_ms(now - Duration::seconds(10), now), 1_000);
    }

    #[test]
    fn notifications_are_tagged_by_type() {
        let n = Notification::WaitlistJoined { user_id: Uuid::nil(), event_id: Uuid::nil(), position: Some(2) };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "waitlist_joined");
        assert_eq!(json["position"], 2);
        assert_eq!(n.routing_key(), "waitlist.joined");
    }
}
