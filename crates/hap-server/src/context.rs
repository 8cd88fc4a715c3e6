//! Shared state handed to every connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use hap_pairing::AuthStore;

use crate::registry::Registry;
use crate::subscriptions::SubscriptionTable;
use crate::traits::Advertiser;

/// Everything a connection needs beyond its own session state.
///
/// Connections hold an `Arc<ServerContext>`; nothing here is global.
pub struct ServerContext {
    pub registry: Arc<RwLock<Registry>>,
    pub subscriptions: Arc<SubscriptionTable>,
    pub auth: Arc<dyn AuthStore>,
    pub advertiser: Arc<dyn Advertiser>,
    /// When set, data endpoints answer plaintext requests. Test hook.
    pub allow_unauthenticated: AtomicBool,
    next_connection_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        registry: Registry,
        auth: Arc<dyn AuthStore>,
        advertiser: Arc<dyn Advertiser>,
    ) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            subscriptions: Arc::new(SubscriptionTable::new()),
            auth,
            advertiser,
            allow_unauthenticated: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Hand out a unique id for a new connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allows_unauthenticated(&self) -> bool {
        self.allow_unauthenticated.load(Ordering::Relaxed)
    }
}
