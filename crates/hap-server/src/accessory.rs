//! Accessory object model: the capability traits the engine dispatches to.

use async_trait::async_trait;
use hap_core::Result;
use serde_json::Value;
use std::sync::Arc;

/// A single readable/writable characteristic.
///
/// Implementations provide the smart-home behavior; the engine only
/// depends on this capability surface. Reads are async so a slow
/// characteristic never blocks its siblings in a batched get.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Instance id, unique within the owning accessory.
    fn instance_id(&self) -> u64;

    /// Current value.
    async fn read(&self) -> Result<Value>;

    /// Apply a new value.
    async fn write(&self, value: &Value) -> Result<()>;

    /// Whether this characteristic supports event subscriptions.
    fn is_eventable(&self) -> bool;

    /// Full JSON description for the /accessories snapshot, including
    /// the current value.
    async fn to_json(&self) -> Result<Value>;
}

/// A grouping of characteristics within an accessory.
#[derive(Clone)]
pub struct Service {
    /// HAP service type identifier.
    pub service_type: String,
    pub characteristics: Vec<Arc<dyn Characteristic>>,
}

impl Service {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: Arc<dyn Characteristic>) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// An accessory exposed by the bridge.
///
/// `services()` may fail; the registry isolates such failures to the
/// one accessory (it is treated as serviceless).
pub trait Accessory: Send + Sync {
    /// Accessory id. Must be >= 1; id 1 is reserved for the bridge root.
    fn id(&self) -> u64;

    fn name(&self) -> String;

    fn services(&self) -> Result<Vec<Service>>;
}
