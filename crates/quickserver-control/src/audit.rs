use quickserver_types::FleetEvent;

use crate::ports::EventLog;

/// Appends to the fleet event log. A failed write is logged and otherwise ignored.
pub async fn record(events: &dyn EventLog, actor_id: &str, message: impl Into<String>) {
    let event = FleetEvent::new(message, actor_id);
    let message = event.message.clone();

    if let Err(err) = events.append(event).await {
        tracing::warn!(%err, actor_id, %message, "failed to write fleet event");
    }
}
