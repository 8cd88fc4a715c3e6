//! Bridge root: advertisement lifecycle and accessory management.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use hap_core::{Error, Result};
use rand::Rng;

use crate::accessory::Accessory;
use crate::context::ServerContext;

/// The bridge itself. Accessory id 1 is reserved for it; bridged
/// accessories use ids from 2 up.
pub struct BridgeRoot {
    context: Arc<ServerContext>,
    port: u16,
    configuration_index: AtomicU32,
    started: AtomicBool,
}

impl BridgeRoot {
    pub fn new(context: Arc<ServerContext>, port: u16) -> Self {
        Self {
            context,
            port,
            configuration_index: AtomicU32::new(1),
            started: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Publish the bridge on the network.
    ///
    /// A bridge with no pairings advertises as available for setup;
    /// a paired bridge advertises but is not discoverable for pairing.
    pub fn start(&self) -> Result<()> {
        let label = match self.context.registry.read() {
            Ok(registry) => registry.label().to_string(),
            Err(_) => return Err(Error::Accessory("registry lock poisoned".to_string())),
        };
        self.context.advertiser.advertise(
            &label,
            &self.context.auth.device_id(),
            self.port,
            self.configuration_index.load(Ordering::Relaxed),
        )?;
        self.context
            .advertiser
            .set_discoverable(!self.context.auth.has_user())?;
        self.started.store(true, Ordering::Relaxed);
        tracing::info!(label = %label, port = self.port, "bridge published");
        Ok(())
    }

    /// Withdraw the bridge and drop all event subscriptions.
    pub fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Relaxed);
        self.context.subscriptions.clear();
        self.context.advertiser.stop()?;
        tracing::info!("bridge withdrawn");
        Ok(())
    }

    /// Add a bridged accessory and rebuild the lookup caches.
    pub fn add_accessory(&self, accessory: Arc<dyn Accessory>) -> Result<()> {
        if accessory.id() == 1 {
            return Err(Error::Accessory(
                "accessory id 1 is reserved for the bridge".to_string(),
            ));
        }
        match self.context.registry.write() {
            Ok(mut registry) => {
                registry.add(accessory);
                registry.reset();
                Ok(())
            }
            Err(_) => Err(Error::Accessory("registry lock poisoned".to_string())),
        }
    }

    /// Remove a bridged accessory and rebuild the lookup caches.
    pub fn remove_accessory(&self, aid: u64) -> Result<()> {
        match self.context.registry.write() {
            Ok(mut registry) => {
                registry.remove(aid);
                registry.reset();
                Ok(())
            }
            Err(_) => Err(Error::Accessory("registry lock poisoned".to_string())),
        }
    }

    /// Set the advertised configuration index. Controllers refetch the
    /// attribute database when it changes. Must be >= 1.
    pub fn set_configuration_index(&self, index: u32) -> Result<()> {
        if index < 1 {
            return Err(Error::Accessory(
                "configuration index must be at least 1".to_string(),
            ));
        }
        self.configuration_index.store(index, Ordering::Relaxed);
        if self.started.load(Ordering::Relaxed) {
            self.context.advertiser.set_configuration_index(index)?;
        }
        Ok(())
    }

    pub fn configuration_index(&self) -> u32 {
        self.configuration_index.load(Ordering::Relaxed)
    }

    /// Allow plaintext access to data endpoints. Test hook only.
    pub fn allow_unauthenticated_requests(&self, allow: bool) {
        self.context
            .allow_unauthenticated
            .store(allow, Ordering::Relaxed);
    }
}

/// SRP salt for a fresh accessory identity.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill(&mut salt);
    salt
}

/// Ed25519 seed for a fresh accessory identity.
pub fn generate_identity_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill(&mut seed);
    seed
}

/// Random device id in locally-administered MAC form.
pub fn generate_device_id() -> String {
    let mut octets = [0u8; 6];
    rand::thread_rng().fill(&mut octets);
    // Locally administered, unicast
    octets[0] = (octets[0] | 0x02) & 0xFE;
    octets
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Setup codes Apple documents as too guessable to issue.
const FORBIDDEN_PINS: [&str; 12] = [
    "000-00-000",
    "111-11-111",
    "222-22-222",
    "333-33-333",
    "444-44-444",
    "555-55-555",
    "666-66-666",
    "777-77-777",
    "888-88-888",
    "999-99-999",
    "123-45-678",
    "876-54-321",
];

/// Random setup code in `XXX-XX-XXX` form, avoiding the forbidden list.
pub fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let digits: u32 = rng.gen_range(0..1_000_000_000);
        let pin = format!(
            "{:03}-{:02}-{:03}",
            digits / 1_000_000,
            (digits / 1_000) % 100,
            digits % 1_000
        );
        if !FORBIDDEN_PINS.contains(&pin.as_str()) {
            return pin;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::traits::Advertiser;
    use async_trait::async_trait;
    use hap_core::Result;
    use hap_pairing::{AuthStore, PairedController};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAdvertiser {
        discoverable: Mutex<Vec<bool>>,
        config_indices: Mutex<Vec<u32>>,
        advertised: Mutex<bool>,
        stopped: Mutex<bool>,
    }

    impl Advertiser for RecordingAdvertiser {
        fn advertise(&self, _: &str, _: &str, _: u16, index: u32) -> Result<()> {
            *self.advertised.lock().unwrap() = true;
            self.config_indices.lock().unwrap().push(index);
            Ok(())
        }
        fn set_discoverable(&self, discoverable: bool) -> Result<()> {
            self.discoverable.lock().unwrap().push(discoverable);
            Ok(())
        }
        fn set_configuration_index(&self, index: u32) -> Result<()> {
            self.config_indices.lock().unwrap().push(index);
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            *self.stopped.lock().unwrap() = true;
            Ok(())
        }
    }

    struct StubAuthStore {
        paired: bool,
    }

    impl AuthStore for StubAuthStore {
        fn pin(&self) -> String {
            "031-45-154".to_string()
        }
        fn device_id(&self) -> String {
            "AA:BB:CC:DD:EE:FF".to_string()
        }
        fn salt(&self) -> [u8; 16] {
            [7u8; 16]
        }
        fn identity_seed(&self) -> [u8; 32] {
            [9u8; 32]
        }
        fn has_user(&self) -> bool {
            self.paired
        }
        fn add_user(&self, _user: PairedController) -> Result<()> {
            Ok(())
        }
        fn remove_user(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn list_users(&self) -> Result<Vec<PairedController>> {
            Ok(Vec::new())
        }
        fn user_ltpk(&self, _id: &str) -> Option<[u8; 32]> {
            None
        }
        fn user_is_admin(&self, _id: &str) -> bool {
            false
        }
    }

    struct LightAccessory {
        id: u64,
    }

    struct OnCharacteristic;

    #[async_trait]
    impl crate::accessory::Characteristic for OnCharacteristic {
        fn instance_id(&self) -> u64 {
            5
        }
        async fn read(&self) -> Result<Value> {
            Ok(json!(false))
        }
        async fn write(&self, _value: &Value) -> Result<()> {
            Ok(())
        }
        fn is_eventable(&self) -> bool {
            true
        }
        async fn to_json(&self) -> Result<Value> {
            Ok(json!({ "iid": 5 }))
        }
    }

    impl Accessory for LightAccessory {
        fn id(&self) -> u64 {
            self.id
        }
        fn name(&self) -> String {
            "light".to_string()
        }
        fn services(&self) -> Result<Vec<crate::accessory::Service>> {
            Ok(vec![crate::accessory::Service::new("lightbulb")
                .with_characteristic(Arc::new(OnCharacteristic))])
        }
    }

    fn root_with(paired: bool) -> (BridgeRoot, Arc<RecordingAdvertiser>) {
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let context = Arc::new(ServerContext::new(
            Registry::new("Test Bridge"),
            Arc::new(StubAuthStore { paired }),
            advertiser.clone(),
        ));
        (BridgeRoot::new(context, 9123), advertiser)
    }

    #[test]
    fn unpaired_bridge_starts_discoverable() {
        let (root, advertiser) = root_with(false);
        root.start().unwrap();
        assert!(*advertiser.advertised.lock().unwrap());
        assert_eq!(*advertiser.discoverable.lock().unwrap(), vec![true]);
    }

    #[test]
    fn paired_bridge_starts_undiscoverable() {
        let (root, advertiser) = root_with(true);
        root.start().unwrap();
        assert_eq!(*advertiser.discoverable.lock().unwrap(), vec![false]);
    }

    #[test]
    fn stop_withdraws_and_clears_subscriptions() {
        let (root, advertiser) = root_with(true);
        root.start().unwrap();
        root.stop().unwrap();
        assert!(*advertiser.stopped.lock().unwrap());
    }

    #[test]
    fn accessories_become_visible_after_add() {
        let (root, _) = root_with(false);
        root.add_accessory(Arc::new(LightAccessory { id: 2 })).unwrap();

        let registry = root.context().registry.read().unwrap();
        assert!(registry.find(2, 5).is_some());
    }

    #[test]
    fn bridge_id_is_reserved() {
        let (root, _) = root_with(false);
        assert!(root.add_accessory(Arc::new(LightAccessory { id: 1 })).is_err());
    }

    #[test]
    fn remove_accessory_drops_lookups() {
        let (root, _) = root_with(false);
        root.add_accessory(Arc::new(LightAccessory { id: 2 })).unwrap();
        root.remove_accessory(2).unwrap();

        let registry = root.context().registry.read().unwrap();
        assert!(registry.find(2, 5).is_none());
    }

    #[test]
    fn configuration_index_is_validated_and_republished() {
        let (root, advertiser) = root_with(true);
        assert!(root.set_configuration_index(0).is_err());

        // Not yet started: stored but not pushed
        root.set_configuration_index(3).unwrap();
        assert!(advertiser.config_indices.lock().unwrap().is_empty());

        root.start().unwrap();
        root.set_configuration_index(4).unwrap();
        assert_eq!(*advertiser.config_indices.lock().unwrap(), vec![3, 4]);
    }

    mod generators {
        use super::*;

        #[test]
        fn pin_has_setup_code_shape() {
            for _ in 0..64 {
                let pin = generate_pin();
                assert_eq!(pin.len(), 10);
                let bytes = pin.as_bytes();
                assert_eq!(bytes[3], b'-');
                assert_eq!(bytes[6], b'-');
                assert!(pin
                    .chars()
                    .filter(|c| *c != '-')
                    .all(|c| c.is_ascii_digit()));
                assert!(!FORBIDDEN_PINS.contains(&pin.as_str()));
            }
        }

        #[test]
        fn device_id_is_locally_administered_mac() {
            let id = generate_device_id();
            assert_eq!(id.len(), 17);
            let first = u8::from_str_radix(&id[0..2], 16).unwrap();
            assert_eq!(first & 0x02, 0x02);
            assert_eq!(first & 0x01, 0x00);
            assert_eq!(id.matches(':').count(), 5);
        }

        #[test]
        fn salts_and_seeds_are_random() {
            assert_ne!(generate_salt(), generate_salt());
            assert_ne!(generate_identity_seed(), generate_identity_seed());
        }
    }
}
