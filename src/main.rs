//! Demo bridge wired entirely in-process.
//!
//! Builds a bridge with one switch accessory, opens a connection against
//! the engine and walks it through discovery, a pair-setup M1 exchange,
//! and (with the unauthenticated test hook) characteristic traffic with
//! an event subscription.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use hap_core::Result;
use hap_crypto::tlv::{Tlv8, TlvMethod, TlvType};
use hap_pairing::{AuthStore, PairedController};
use hap_server::{
    root, Accessory, Advertiser, BridgeRoot, Characteristic, Connection, HttpRequest, Method,
    Registry, ServerContext, Service, TransportSink,
};

struct MemoryAuthStore {
    pin: String,
    device_id: String,
    salt: [u8; 16],
    seed: [u8; 32],
    users: Mutex<Vec<PairedController>>,
}

impl MemoryAuthStore {
    fn new() -> Self {
        Self {
            pin: root::generate_pin(),
            device_id: root::generate_device_id(),
            salt: root::generate_salt(),
            seed: root::generate_identity_seed(),
            users: Mutex::new(Vec::new()),
        }
    }
}

impl AuthStore for MemoryAuthStore {
    fn pin(&self) -> String {
        self.pin.clone()
    }
    fn device_id(&self) -> String {
        self.device_id.clone()
    }
    fn salt(&self) -> [u8; 16] {
        self.salt
    }
    fn identity_seed(&self) -> [u8; 32] {
        self.seed
    }
    fn has_user(&self) -> bool {
        !self.users.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }
    fn add_user(&self, controller: PairedController) -> Result<()> {
        let mut users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        users.retain(|u| u.id != controller.id);
        users.push(controller);
        Ok(())
    }
    fn remove_user(&self, id: &str) -> Result<()> {
        self.users
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|u| u.id != id);
        Ok(())
    }
    fn list_users(&self) -> Result<Vec<PairedController>> {
        Ok(self.users.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
    fn user_ltpk(&self, id: &str) -> Option<[u8; 32]> {
        self.users
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.ltpk)
    }
    fn user_is_admin(&self, id: &str) -> bool {
        self.users
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|u| u.id == id && u.admin)
    }
}

/// Advertiser that only logs; a real deployment plugs in mDNS here.
struct LoggingAdvertiser;

impl Advertiser for LoggingAdvertiser {
    fn advertise(&self, label: &str, device_id: &str, port: u16, config_index: u32) -> Result<()> {
        tracing::info!(label, device_id, port, config_index, "advertising bridge");
        Ok(())
    }
    fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        tracing::info!(discoverable, "pairing availability changed");
        Ok(())
    }
    fn set_configuration_index(&self, index: u32) -> Result<()> {
        tracing::info!(index, "configuration index changed");
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        tracing::info!("advertisement stopped");
        Ok(())
    }
}

struct LoggingSink;

impl TransportSink for LoggingSink {
    fn send(&self, frame: Vec<u8>) {
        tracing::info!(bytes = frame.len(), "event frame pushed to controller");
    }
}

struct SwitchCharacteristic {
    value: Mutex<Value>,
}

#[async_trait]
impl Characteristic for SwitchCharacteristic {
    fn instance_id(&self) -> u64 {
        5
    }
    async fn read(&self) -> Result<Value> {
        Ok(self.value.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
    async fn write(&self, value: &Value) -> Result<()> {
        tracing::info!(%value, "switch written");
        *self.value.lock().unwrap_or_else(|p| p.into_inner()) = value.clone();
        Ok(())
    }
    fn is_eventable(&self) -> bool {
        true
    }
    async fn to_json(&self) -> Result<Value> {
        Ok(json!({ "iid": 5, "type": "25", "value": self.read().await? }))
    }
}

struct SwitchAccessory;

impl Accessory for SwitchAccessory {
    fn id(&self) -> u64 {
        2
    }
    fn name(&self) -> String {
        "Demo Switch".to_string()
    }
    fn services(&self) -> Result<Vec<Service>> {
        Ok(vec![Service::new("49").with_characteristic(Arc::new(
            SwitchCharacteristic {
                value: Mutex::new(json!(false)),
            },
        ))])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let auth = Arc::new(MemoryAuthStore::new());
    tracing::info!(pin = %auth.pin(), device_id = %auth.device_id(), "bridge identity");

    let context = Arc::new(ServerContext::new(
        Registry::new("Demo Bridge"),
        auth,
        Arc::new(LoggingAdvertiser),
    ));
    let bridge = BridgeRoot::new(context.clone(), 9123);
    bridge.add_accessory(Arc::new(SwitchAccessory))?;
    bridge.start()?;

    let connection = Connection::new(context.clone(), Arc::new(LoggingSink));

    // Pair-setup is reachable on a fresh plaintext connection
    let mut m1 = Tlv8::new();
    m1.set(TlvType::State, vec![0x01]);
    m1.set(TlvType::Method, vec![TlvMethod::PairSetup as u8]);
    let m2 = connection
        .handle_request(HttpRequest::new(Method::Post, "/pair-setup").with_body(m1.encode()))
        .await;
    tracing::info!(status = m2.status, bytes = m2.body.len(), "pair-setup M2 produced");

    // Data traffic, using the unauthenticated test hook instead of a
    // full scripted handshake
    bridge.allow_unauthenticated_requests(true);

    let snapshot = connection
        .handle_request(HttpRequest::new(Method::Get, "/accessories"))
        .await;
    tracing::info!(
        status = snapshot.status,
        body = %String::from_utf8_lossy(&snapshot.body),
        "accessory snapshot"
    );

    let put = json!({ "characteristics": [{ "aid": 2, "iid": 5, "value": true }] });
    let response = connection
        .handle_request(
            HttpRequest::new(Method::Put, "/characteristics")
                .with_body(put.to_string().into_bytes()),
        )
        .await;
    tracing::info!(status = response.status, "switch turned on");

    let read = connection
        .handle_request(HttpRequest::new(Method::Get, "/characteristics").with_query("id=2.5"))
        .await;
    tracing::info!(
        status = read.status,
        body = %String::from_utf8_lossy(&read.body),
        "switch read back"
    );

    connection.close();
    bridge.stop()?;
    Ok(())
}
