//! Collaborator traits at the engine boundary.

use hap_core::Result;

/// mDNS advertisement control.
///
/// The engine drives discoverability from the pairing state: paired
/// accessories stop advertising as available for setup, and advertise
/// again when the last pairing is removed.
pub trait Advertiser: Send + Sync {
    /// Start advertising the accessory.
    fn advertise(&self, label: &str, device_id: &str, port: u16, config_index: u32) -> Result<()>;

    /// Toggle the "available for pairing" state.
    fn set_discoverable(&self, discoverable: bool) -> Result<()>;

    /// Bump the configuration index (TXT record revision). Must be >= 1.
    fn set_configuration_index(&self, index: u32) -> Result<()>;

    /// Stop advertising.
    fn stop(&self) -> Result<()>;
}

/// Outbound half of a connection, for unsolicited server pushes.
///
/// Implementations deliver the frame on the already-open connection.
/// Delivery is best effort; a closed connection drops the frame.
pub trait TransportSink: Send + Sync {
    fn send(&self, frame: Vec<u8>);
}

/// A connection as seen by the subscription table.
///
/// The table holds these by reference to push event messages. Pushes to
/// a connection that is not verified, or that has closed, are dropped.
pub trait EventConnection: Send + Sync {
    /// Stable id, unique per accepted connection.
    fn id(&self) -> u64;

    /// True while the session is verified and the connection is open.
    fn can_receive_events(&self) -> bool;

    /// Encrypt and push one event body. Best effort.
    fn push_event(&self, body: Vec<u8>);
}
