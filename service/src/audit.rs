use async_trait::async_trait;
use durable::{Delivery, EntryHandler, HandlerError};
use events::Event;
use log::*;

/// Default durable consumer: writes one audit record per event to the log.
///
/// Recording the same entry twice is harmless, so redelivery after a claim
/// needs no deduplication here.
pub struct AuditLogHandler;

#[async_trait]
impl EntryHandler for AuditLogHandler {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let entry = &delivery.entry;
        let event: Event = serde_json::from_str(&entry.payload).map_err(|e| {
            HandlerError::Permanent(format!("undecodable event in {}: {e}", entry.stream))
        })?;

        info!(
            "audit stream={} entry={} topic={} audience={} produced_at={} attempt={}",
            entry.stream,
            entry.id,
            event.topic,
            event.audience,
            event.produced_at.to_rfc3339(),
            delivery.delivery_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use durable::{Entry, EntryId};
    use events::Audience;
    use serde_json::json;

    fn delivery(payload: String) -> Delivery {
        Delivery {
            entry: Entry {
                id: EntryId::new(1, 0),
                stream: "events:tasks".to_string(),
                payload,
                produced_at: Utc::now(),
                target_group: None,
            },
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn well_formed_events_are_recorded() {
        let event = Event::new("tasks", Audience::channel("org-42"), json!({"id": 3}));
        let payload = serde_json::to_string(&event).unwrap();

        assert_eq!(AuditLogHandler.handle(&delivery(payload)).await, Ok(()));
    }

    #[tokio::test]
    async fn malformed_payloads_fail_permanently() {
        let result = AuditLogHandler
            .handle(&delivery("{\"topic\":".to_string()))
            .await;

        assert!(matches!(result, Err(HandlerError::Permanent(_))));
    }
}
