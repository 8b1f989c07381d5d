use anyhow::Result;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

use shared::db::DbPool;
use shared::models::*;
use shared::schema::*;

/// Publishes allocation and promotion events written in the same transaction
/// as the ticket changes.
pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
}

pub fn topic_for(event_type: &str) -> &'static str {
    match event_type {
        "ReleaseAllocated" => "release-events",
        "TicketPromoted" => "ticket-events",
        "PaidTicketsMissing" => "payment-events",
        _ => "domain-events",
    }
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer) -> Self {
        Self { pool, producer }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let unprocessed_events = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for event in unprocessed_events {
            if let Err(e) = self.publish_event(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            info!(event_type = %event.event_type, "Published outbox event: {}", event.id);
        }

        Ok(())
    }

    async fn publish_event(&self, event: &DbOutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(topic_for(&event.event_type))
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_route_to_their_topics() {
        assert_eq!(topic_for("TicketPromoted"), "ticket-events");
        assert_eq!(topic_for("ReleaseAllocated"), "release-events");
        assert_eq!(topic_for("PaidTicketsMissing"), "payment-events");
        assert_eq!(topic_for("Unknown"), "domain-events");
    }
}
