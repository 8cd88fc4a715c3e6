//! Read/write/subscribe dispatch against the registry.

use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};

use crate::accessory::Characteristic;
use crate::http::HttpResponse;
use crate::registry::Registry;
use crate::subscriptions::SubscriptionTable;
use crate::traits::EventConnection;

/// Handles GET/PUT /characteristics and the /accessories snapshot.
pub struct CharacteristicsController {
    registry: Arc<RwLock<Registry>>,
    subscriptions: Arc<SubscriptionTable>,
}

impl CharacteristicsController {
    pub fn new(registry: Arc<RwLock<Registry>>, subscriptions: Arc<SubscriptionTable>) -> Self {
        Self {
            registry,
            subscriptions,
        }
    }

    /// Batched read: `?id=aid.iid,aid.iid,...`.
    ///
    /// Unknown ids are skipped with a warning; a syntactically malformed
    /// id fails the whole request. All reads are started before any is
    /// awaited, and results are collected in request order.
    pub async fn get(&self, query: Option<&str>) -> HttpResponse {
        let ids = match query.and_then(id_param).map(parse_ids) {
            Some(Ok(ids)) => ids,
            _ => return HttpResponse::not_found(),
        };

        let resolved: Vec<(u64, u64, Arc<dyn Characteristic>)> = {
            let registry = match self.registry.read() {
                Ok(guard) => guard,
                Err(_) => return HttpResponse::internal_error(),
            };
            ids.into_iter()
                .filter_map(|(aid, iid)| match registry.find(aid, iid) {
                    Some(characteristic) => Some((aid, iid, characteristic)),
                    None => {
                        tracing::warn!(aid, iid, "read for unknown characteristic, skipping");
                        None
                    }
                })
                .collect()
        };

        // Fan out: start every read, then join in request order
        let reads = resolved
            .iter()
            .map(|(_, _, characteristic)| characteristic.read());
        let values = join_all(reads).await;

        let mut entries = Vec::with_capacity(resolved.len());
        for ((aid, iid, _), value) in resolved.iter().zip(values) {
            match value {
                Ok(value) => entries.push(json!({ "aid": aid, "iid": iid, "value": value })),
                Err(e) => {
                    tracing::warn!(aid, iid, error = %e, "characteristic read failed, skipping");
                }
            }
        }

        let body = json!({ "characteristics": entries }).to_string().into_bytes();
        HttpResponse::ok_json(body)
    }

    /// Batched write/subscribe.
    ///
    /// Entries are processed in array order. Item-local failures are
    /// logged and skipped; notifications produced by the writes are
    /// flushed together when the batch guard drops.
    pub async fn put(&self, body: &[u8], connection: &Arc<dyn EventConnection>) -> HttpResponse {
        let entries = match parse_put_entries(body) {
            Some(entries) => entries,
            None => return HttpResponse::bad_request(),
        };

        let _batch = self.subscriptions.batch_guard();

        for entry in entries {
            let (aid, iid) = match (entry.get("aid").and_then(Value::as_u64), entry.get("iid").and_then(Value::as_u64)) {
                (Some(aid), Some(iid)) => (aid, iid),
                _ => return HttpResponse::bad_request(),
            };

            let characteristic = {
                let registry = match self.registry.read() {
                    Ok(guard) => guard,
                    Err(_) => return HttpResponse::internal_error(),
                };
                registry.find(aid, iid)
            };
            let characteristic = match characteristic {
                Some(characteristic) => characteristic,
                None => {
                    tracing::warn!(aid, iid, "write for unknown characteristic, skipping");
                    continue;
                }
            };

            if let Some(value) = entry.get("value") {
                match characteristic.write(value).await {
                    Ok(()) => self.subscriptions.publish(aid, iid, value.clone()),
                    Err(e) => {
                        tracing::warn!(aid, iid, error = %e, "characteristic write failed, skipping");
                    }
                }
            }

            if let Some(ev) = entry.get("ev").and_then(Value::as_bool) {
                if characteristic.is_eventable() {
                    if ev {
                        self.subscriptions
                            .add_subscription(aid, iid, Arc::clone(connection));
                    } else {
                        self.subscriptions
                            .remove_subscription(aid, iid, connection.id());
                    }
                } else {
                    tracing::debug!(aid, iid, "subscription request for non-eventable characteristic");
                }
            }
        }

        HttpResponse::no_content()
    }

    /// Full registry snapshot for GET /accessories.
    pub async fn snapshot(&self) -> HttpResponse {
        let accessories: Vec<(u64, Vec<crate::accessory::Service>)> = {
            let registry = match self.registry.read() {
                Ok(guard) => guard,
                Err(_) => return HttpResponse::internal_error(),
            };
            registry
                .accessories()
                .iter()
                .map(|a| (a.id(), registry.services(a.id())))
                .collect()
        };

        let mut accessory_entries = Vec::with_capacity(accessories.len());
        for (aid, services) in accessories {
            let mut service_entries = Vec::with_capacity(services.len());
            for service in services {
                let descriptions = join_all(
                    service
                        .characteristics
                        .iter()
                        .map(|characteristic| characteristic.to_json()),
                )
                .await;

                let mut characteristic_entries = Vec::new();
                for (characteristic, description) in
                    service.characteristics.iter().zip(descriptions)
                {
                    match description {
                        Ok(description) => characteristic_entries.push(description),
                        Err(e) => {
                            tracing::warn!(
                                aid,
                                iid = characteristic.instance_id(),
                                error = %e,
                                "characteristic description failed, skipping"
                            );
                        }
                    }
                }
                service_entries.push(json!({
                    "type": service.service_type,
                    "characteristics": characteristic_entries,
                }));
            }
            accessory_entries.push(json!({ "aid": aid, "services": service_entries }));
        }

        let body = json!({ "accessories": accessory_entries }).to_string().into_bytes();
        HttpResponse::ok_json(body)
    }
}

/// Extract the `id` parameter from a query string.
fn id_param(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("id="))
}

/// Parse `aid.iid,aid.iid,...`; any malformed pair fails the lot.
fn parse_ids(raw: &str) -> Result<Vec<(u64, u64)>, ()> {
    raw.split(',')
        .map(|pair| {
            let mut parts = pair.split('.');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(aid), Some(iid), None) => {
                    let aid = aid.parse::<u64>().map_err(|_| ())?;
                    let iid = iid.parse::<u64>().map_err(|_| ())?;
                    Ok((aid, iid))
                }
                _ => Err(()),
            }
        })
        .collect()
}

/// Accept either `{"characteristics":[...]}` or a bare array.
fn parse_put_entries(body: &[u8]) -> Option<Vec<Value>> {
    let parsed: Value = serde_json::from_slice(body).ok()?;
    let array = match parsed {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("characteristics") {
            Some(Value::Array(entries)) => entries,
            _ => return None,
        },
        _ => return None,
    };
    if array.iter().all(Value::is_object) {
        Some(array)
    } else {
        None
    }
}
