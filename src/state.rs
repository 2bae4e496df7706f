use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};
use tokio::sync::broadcast;

use crate::config::AppConfig;

/// Change notification fanned out to live board viewers.
///
/// The payload is a wake-up signal only; subscribers re-fetch `/api/data`
/// for authoritative state. `code` carries the last product touched so the
/// board can flash the affected row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum ChangeEvent {
    /// `code` is the last product reconciled, or null when a snapshot held
    /// no product lines (a deletion-only sync still wakes viewers up).
    Order { code: Option<String> },
    Stock { code: String },
    Reset { code: String },
}

impl ChangeEvent {
    pub(crate) fn reset() -> Self {
        ChangeEvent::Reset { code: "RESET".to_string() }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    /// Subscriber registry for the SSE stream; receivers deregister by drop.
    pub(crate) bus: broadcast::Sender<ChangeEvent>,
}

impl AppState {
    pub(crate) fn new(cfg: Arc<AppConfig>, db: Pool<Postgres>) -> Self {
        let (bus, _rx) = broadcast::channel(cfg.events.bus_capacity);
        Self { cfg, db, bus }
    }

    /// Best-effort fan-out. A send error only means nobody is listening;
    /// the mutating request that triggered it must not fail on that.
    pub(crate) fn notify(&self, event: ChangeEvent) {
        let n = self.bus.send(event.clone()).unwrap_or(0);
        tracing::debug!(?event, subscribers = n, "change event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_events_serialize_to_wire_shape() {
        let e = ChangeEvent::Order { code: Some("MOZ30".to_string()) };
        assert_eq!(
            serde_json::to_value(&e).unwrap(),
            serde_json::json!({"type": "order", "code": "MOZ30"})
        );
        assert_eq!(
            serde_json::to_value(ChangeEvent::reset()).unwrap(),
            serde_json::json!({"type": "reset", "code": "RESET"})
        );
    }

    #[test]
    fn order_event_without_a_product_carries_null_code() {
        let e = ChangeEvent::Order { code: None };
        assert_eq!(
            serde_json::to_value(&e).unwrap(),
            serde_json::json!({"type": "order", "code": null})
        );
    }
}
