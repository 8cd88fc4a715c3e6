//! Pairing management on a verified session (add/remove/list).
//!
//! Controllers send these as TLV8 bodies with a Method item. All three
//! operations require the requesting controller to be an admin.

use hap_core::error::{PairingError, Result};
use hap_crypto::tlv::{Tlv8, TlvError, TlvMethod, TlvType};
use std::sync::Arc;

use crate::auth::{AuthStore, PairedController};

/// Result of a pairing management request.
pub struct PairingsOutput {
    /// TLV8 response body.
    pub body: Vec<u8>,
    /// True when the last pairing was removed and the accessory should
    /// advertise as unpaired again.
    pub unpaired: bool,
}

impl PairingsOutput {
    fn reply(body: Vec<u8>) -> Self {
        Self {
            body,
            unpaired: false,
        }
    }
}

/// Handles POST /pairings for a verified connection.
pub struct PairingsController {
    auth: Arc<dyn AuthStore>,
}

impl PairingsController {
    pub fn new(auth: Arc<dyn AuthStore>) -> Self {
        Self { auth }
    }

    /// Process a pairing management request from `requester_id`.
    pub fn handle(&self, requester_id: &str, body: &[u8]) -> Result<PairingsOutput> {
        let tlv = Tlv8::parse(body)?;
        let method = tlv
            .method()
            .ok_or(PairingError::MissingTlv(TlvType::Method as u8))?;

        if !self.auth.user_is_admin(requester_id) {
            tracing::warn!(controller = %requester_id, "pairing management from non-admin");
            return Ok(PairingsOutput::reply(
                Tlv8::error_response(0x02, TlvError::Authentication).encode(),
            ));
        }

        if method == TlvMethod::AddPairing as u8 {
            self.add_pairing(&tlv)
        } else if method == TlvMethod::RemovePairing as u8 {
            self.remove_pairing(&tlv)
        } else if method == TlvMethod::ListPairings as u8 {
            self.list_pairings()
        } else {
            tracing::warn!(method, "unknown pairing management method");
            Ok(PairingsOutput::reply(
                Tlv8::error_response(0x02, TlvError::Unknown).encode(),
            ))
        }
    }

    fn add_pairing(&self, tlv: &Tlv8) -> Result<PairingsOutput> {
        let id = String::from_utf8(tlv.require(TlvType::Identifier)?.to_vec())
            .map_err(|_| PairingError::Protocol("controller id is not UTF-8".to_string()))?;
        let ltpk = tlv.require(TlvType::PublicKey)?;
        let permissions = tlv.require(TlvType::Permissions)?;

        if ltpk.len() != 32 {
            return Ok(PairingsOutput::reply(
                Tlv8::error_response(0x02, TlvError::Unknown).encode(),
            ));
        }
        let mut ltpk_arr = [0u8; 32];
        ltpk_arr.copy_from_slice(ltpk);

        // Re-adding an existing pairing with a different key is an error;
        // with the same key it only updates permissions.
        if let Some(existing) = self.auth.user_ltpk(&id) {
            if existing != ltpk_arr {
                tracing::warn!(controller = %id, "add-pairing key mismatch");
                return Ok(PairingsOutput::reply(
                    Tlv8::error_response(0x02, TlvError::Unknown).encode(),
                ));
            }
        }

        let admin = permissions.first().map(|p| p & 0x01 == 0x01).unwrap_or(false);
        self.auth.add_user(PairedController {
            id: id.clone(),
            ltpk: ltpk_arr,
            admin,
        })?;

        tracing::info!(controller = %id, admin, "pairing added");
        Ok(PairingsOutput::reply(success_body()))
    }

    fn remove_pairing(&self, tlv: &Tlv8) -> Result<PairingsOutput> {
        let id = String::from_utf8(tlv.require(TlvType::Identifier)?.to_vec())
            .map_err(|_| PairingError::Protocol("controller id is not UTF-8".to_string()))?;

        self.auth.remove_user(&id)?;
        let unpaired = !self.auth.has_user();
        if unpaired {
            tracing::info!("last pairing removed, accessory is unpaired");
        } else {
            tracing::info!(controller = %id, "pairing removed");
        }

        Ok(PairingsOutput {
            body: success_body(),
            unpaired,
        })
    }

    fn list_pairings(&self) -> Result<PairingsOutput> {
        // Repeated items per controller rule out the map-based builder;
        // encode the list by hand.
        let mut body = Vec::new();
        append_item(&mut body, TlvType::State as u8, &[0x02]);

        let users = self.auth.list_users()?;
        for (i, user) in users.iter().enumerate() {
            if i > 0 {
                append_item(&mut body, TlvType::Separator as u8, &[]);
            }
            append_item(&mut body, TlvType::Identifier as u8, user.id.as_bytes());
            append_item(&mut body, TlvType::PublicKey as u8, &user.ltpk);
            append_item(
                &mut body,
                TlvType::Permissions as u8,
                &[if user.admin { 0x01 } else { 0x00 }],
            );
        }

        Ok(PairingsOutput::reply(body))
    }
}

fn success_body() -> Vec<u8> {
    let mut tlv = Tlv8::new();
    tlv.set(TlvType::State, vec![0x02]);
    tlv.encode()
}

fn append_item(buf: &mut Vec<u8>, typ: u8, value: &[u8]) {
    if value.is_empty() {
        buf.push(typ);
        buf.push(0);
        return;
    }
    for chunk in value.chunks(255) {
        buf.push(typ);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}
