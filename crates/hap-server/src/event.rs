//! Event message construction.

use serde_json::{json, Value};

/// One characteristic change queued for delivery.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub aid: u64,
    pub iid: u64,
    pub value: Value,
}

/// Build the event body pushed to a subscribed connection.
///
/// Every change accumulated for the connection lands in one message:
/// `{"characteristics":[{"aid":..,"iid":..,"value":..},...]}`.
pub fn event_payload(entries: &[PendingNotification]) -> Vec<u8> {
    let characteristics: Vec<Value> = entries
        .iter()
        .map(|n| json!({ "aid": n.aid, "iid": n.iid, "value": n.value }))
        .collect();
    json!({ "characteristics": characteristics }).to_string().into_bytes()
}
