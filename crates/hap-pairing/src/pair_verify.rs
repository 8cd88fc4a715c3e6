//! Accessory-side pair-verify protocol (M1-M4).
//!
//! Pair-verify proves that a connecting controller holds the long-term
//! key it registered during pair-setup, and derives the directional
//! session keys for the encrypted channel. The M4 response is the last
//! plaintext message on the connection; the session keys take effect
//! from the next request.

use hap_core::error::{PairingError, Result};
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    curve25519::EcdhKeyPair,
    ed25519::{verify, IdentityKeyPair},
    hkdf,
    keys::{SessionKeys, SharedSecret},
    tlv::{Tlv8, TlvError, TlvType},
};
use std::sync::Arc;

use crate::auth::AuthStore;

const PV_MSG02_NONCE: &[u8] = b"PV-Msg02";
const PV_MSG03_NONCE: &[u8] = b"PV-Msg03";

/// A completed verification: who connected and the channel keys.
pub struct VerifiedSession {
    pub controller_id: String,
    pub keys: SessionKeys,
}

/// Result of feeding one request to the state machine.
pub struct VerifyOutput {
    /// TLV8 response body.
    pub body: Vec<u8>,
    /// Present when M4 was produced and the session is verified.
    pub completed: Option<VerifiedSession>,
}

impl VerifyOutput {
    fn reply(tlv: Tlv8) -> Self {
        Self {
            body: tlv.encode(),
            completed: None,
        }
    }
}

enum VerifyStage {
    Idle,
    /// M2 sent, waiting for the controller's signed identity.
    AwaitingM3 {
        accessory_public: [u8; 32],
        controller_public: [u8; 32],
        shared_secret: [u8; 32],
        session_key: [u8; 32],
    },
}

/// Per-connection pair-verify state machine.
pub struct PairVerifyServer {
    auth: Arc<dyn AuthStore>,
    stage: VerifyStage,
}

impl PairVerifyServer {
    pub fn new(auth: Arc<dyn AuthStore>) -> Self {
        Self {
            auth,
            stage: VerifyStage::Idle,
        }
    }

    /// Process one pair-verify request body, returning the response.
    pub fn handle(&mut self, body: &[u8]) -> Result<VerifyOutput> {
        let tlv = Tlv8::parse(body)?;
        let state = tlv
            .state()
            .ok_or(PairingError::MissingTlv(TlvType::State as u8))?;

        match state {
            0x01 => self.m1(&tlv),
            0x03 => self.m3(&tlv),
            other => {
                tracing::warn!(state = other, "unexpected pair-verify state");
                self.stage = VerifyStage::Idle;
                Ok(VerifyOutput::reply(Tlv8::error_response(
                    other.wrapping_add(1),
                    TlvError::Unknown,
                )))
            }
        }
    }

    /// M1 -> M2: ECDH key agreement plus the accessory's signed identity.
    ///
    /// A repeated M1 restarts the handshake with a fresh ephemeral key.
    fn m1(&mut self, tlv: &Tlv8) -> Result<VerifyOutput> {
        let controller_public = tlv.require(TlvType::PublicKey)?;
        if controller_public.len() != 32 {
            return Ok(VerifyOutput::reply(Tlv8::error_response(
                0x02,
                TlvError::Unknown,
            )));
        }
        let mut controller_public_arr = [0u8; 32];
        controller_public_arr.copy_from_slice(controller_public);

        let ecdh = EcdhKeyPair::generate();
        let accessory_public = ecdh.public_key();

        let shared_secret = match ecdh.diffie_hellman(&controller_public_arr) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(error = %e, "pair-verify ECDH failed");
                return Ok(VerifyOutput::reply(Tlv8::error_response(
                    0x02,
                    TlvError::Unknown,
                )));
            }
        };

        let session_key = hkdf::derive_pair_verify_key(&shared_secret)?;

        // Accessory signs: accessory ECDH pub || accessory id || controller ECDH pub
        let identity = IdentityKeyPair::from_seed(&self.auth.identity_seed());
        let device_id = self.auth.device_id();

        let mut accessory_info = Vec::with_capacity(64 + device_id.len());
        accessory_info.extend_from_slice(&accessory_public);
        accessory_info.extend_from_slice(device_id.as_bytes());
        accessory_info.extend_from_slice(&controller_public_arr);
        let signature = identity.sign(&accessory_info);

        let mut inner = Tlv8::new();
        inner.set(TlvType::Identifier, device_id.into_bytes());
        inner.set(TlvType::Signature, signature.to_vec());

        let encrypted = encrypt_with_nonce(
            &session_key,
            &nonce_from_string(PV_MSG02_NONCE),
            &inner.encode(),
        )?;

        tracing::debug!("pair-verify M1 received, ECDH complete");
        self.stage = VerifyStage::AwaitingM3 {
            accessory_public,
            controller_public: controller_public_arr,
            shared_secret,
            session_key,
        };

        Ok(VerifyOutput::reply(Tlv8::pair_verify_m2(
            &accessory_public,
            encrypted,
        )))
    }

    /// M3 -> M4: verify the controller's signature against its stored LTPK.
    fn m3(&mut self, tlv: &Tlv8) -> Result<VerifyOutput> {
        let (accessory_public, controller_public, shared_secret, session_key) =
            match std::mem::replace(&mut self.stage, VerifyStage::Idle) {
                VerifyStage::AwaitingM3 {
                    accessory_public,
                    controller_public,
                    shared_secret,
                    session_key,
                } => (
                    accessory_public,
                    controller_public,
                    shared_secret,
                    session_key,
                ),
                _ => {
                    tracing::warn!("pair-verify M3 without preceding M1");
                    return Ok(VerifyOutput::reply(Tlv8::error_response(
                        0x04,
                        TlvError::Unknown,
                    )));
                }
            };

        let encrypted = tlv.require(TlvType::EncryptedData)?;

        let decrypted =
            match decrypt_with_nonce(&session_key, &nonce_from_string(PV_MSG03_NONCE), encrypted) {
                Ok(plain) => plain,
                Err(e) => {
                    tracing::warn!(error = %e, "pair-verify M3 decryption failed");
                    return Ok(VerifyOutput::reply(Tlv8::error_response(
                        0x04,
                        TlvError::Authentication,
                    )));
                }
            };

        let inner = Tlv8::parse(&decrypted)?;
        let controller_id_bytes = inner.require(TlvType::Identifier)?;
        let signature = inner.require(TlvType::Signature)?;

        let controller_id = String::from_utf8(controller_id_bytes.to_vec())
            .map_err(|_| PairingError::Protocol("controller id is not UTF-8".to_string()))?;

        let ltpk = match self.auth.user_ltpk(&controller_id) {
            Some(key) => key,
            None => {
                tracing::warn!(controller = %controller_id, "pair-verify from unknown controller");
                return Ok(VerifyOutput::reply(Tlv8::error_response(
                    0x04,
                    TlvError::Authentication,
                )));
            }
        };

        if signature.len() != 64 {
            return Ok(VerifyOutput::reply(Tlv8::error_response(
                0x04,
                TlvError::Authentication,
            )));
        }
        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(signature);

        // Controller signs: controller ECDH pub || controller id || accessory ECDH pub
        let mut controller_info = Vec::with_capacity(64 + controller_id.len());
        controller_info.extend_from_slice(&controller_public);
        controller_info.extend_from_slice(controller_id.as_bytes());
        controller_info.extend_from_slice(&accessory_public);

        if verify(&ltpk, &controller_info, &sig_arr).is_err() {
            tracing::warn!(controller = %controller_id, "pair-verify signature invalid");
            return Ok(VerifyOutput::reply(Tlv8::error_response(
                0x04,
                TlvError::Authentication,
            )));
        }

        let keys = SessionKeys::derive(&SharedSecret::from(shared_secret))?;

        // M4 goes out in the clear; the keys apply from the next request
        let mut response = Tlv8::new();
        response.set(TlvType::State, vec![0x04]);

        tracing::info!(controller = %controller_id, "pair-verify complete");

        Ok(VerifyOutput {
            body: response.encode(),
            completed: Some(VerifiedSession {
                controller_id,
                keys,
            }),
        })
    }
}
