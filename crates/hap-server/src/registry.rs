//! Accessory registry with derived lookup caches.

use std::collections::HashMap;
use std::sync::Arc;

use crate::accessory::{Accessory, Characteristic, Service};

/// Maps accessory ids to accessories and caches the derived
/// service/characteristic lookups.
///
/// `add`/`remove` mutate only the accessory map; `reset` rebuilds the
/// caches. Between the two, readers see a stale but internally
/// consistent snapshot.
pub struct Registry {
    label: String,
    accessories: HashMap<u64, Arc<dyn Accessory>>,
    services: HashMap<u64, Vec<Service>>,
    characteristics: HashMap<u64, HashMap<u64, Arc<dyn Characteristic>>>,
}

impl Registry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            accessories: HashMap::new(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Rebuild the derived caches from the accessory map.
    ///
    /// An accessory whose service construction fails is kept with an
    /// empty service list so one faulty accessory cannot take down the
    /// rest of the bridge.
    pub fn reset(&mut self) {
        self.services.clear();
        self.characteristics.clear();

        for (aid, accessory) in &self.accessories {
            let services = match accessory.services() {
                Ok(services) => services,
                Err(e) => {
                    tracing::warn!(
                        aid,
                        name = %accessory.name(),
                        error = %e,
                        "could not instantiate services, treating accessory as serviceless"
                    );
                    Vec::new()
                }
            };

            let mut by_iid: HashMap<u64, Arc<dyn Characteristic>> = HashMap::new();
            for service in &services {
                for characteristic in &service.characteristics {
                    by_iid.insert(characteristic.instance_id(), Arc::clone(characteristic));
                }
            }

            self.services.insert(*aid, services);
            self.characteristics.insert(*aid, by_iid);
        }
    }

    /// Add an accessory. Call `reset` to materialize it in the caches.
    pub fn add(&mut self, accessory: Arc<dyn Accessory>) {
        self.accessories.insert(accessory.id(), accessory);
    }

    /// Remove an accessory. Call `reset` to materialize the removal.
    pub fn remove(&mut self, aid: u64) {
        self.accessories.remove(&aid);
    }

    /// Accessories ordered by id (stable snapshot order).
    pub fn accessories(&self) -> Vec<Arc<dyn Accessory>> {
        let mut list: Vec<_> = self.accessories.values().cloned().collect();
        list.sort_by_key(|a| a.id());
        list
    }

    /// Cached services for an accessory; empty for an unknown id.
    pub fn services(&self, aid: u64) -> Vec<Service> {
        self.services.get(&aid).cloned().unwrap_or_default()
    }

    /// Cached characteristic map for an accessory; empty for an unknown
    /// id, never an error.
    pub fn get_characteristics(&self, aid: u64) -> HashMap<u64, Arc<dyn Characteristic>> {
        self.characteristics.get(&aid).cloned().unwrap_or_default()
    }

    /// Resolve one characteristic.
    pub fn find(&self, aid: u64, iid: u64) -> Option<Arc<dyn Characteristic>> {
        self.characteristics.get(&aid)?.get(&iid).cloned()
    }
}
