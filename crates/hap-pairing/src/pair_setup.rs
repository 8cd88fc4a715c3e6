//! Accessory-side pair-setup protocol (M1-M6).
//!
//! Pair-setup authenticates a new controller against the setup PIN using
//! SRP-6a, then exchanges long-term Ed25519 public keys under a session
//! key derived from the SRP shared secret. On success the controller is
//! persisted as an admin pairing.

use hap_core::error::{PairingError, Result};
use hap_crypto::{
    chacha::{decrypt_with_nonce, encrypt_with_nonce, nonce_from_string},
    ed25519::{verify, IdentityKeyPair},
    hkdf,
    srp::{SrpServer, PAIR_SETUP_IDENTITY},
    tlv::{Tlv8, TlvError, TlvType},
};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::auth::{AuthStore, PairedController};

const PS_MSG05_NONCE: &[u8] = b"PS-Msg05";
const PS_MSG06_NONCE: &[u8] = b"PS-Msg06";

/// Result of feeding one request to the state machine.
pub struct SetupOutput {
    /// TLV8 response body.
    pub body: Vec<u8>,
    /// Set to the controller id when M6 completed and the pairing was
    /// persisted. The server uses this to stop advertising as unpaired.
    pub completed: Option<String>,
}

impl SetupOutput {
    fn reply(tlv: Tlv8) -> Self {
        Self {
            body: tlv.encode(),
            completed: None,
        }
    }
}

enum SetupStage {
    Idle,
    /// M2 sent, waiting for the controller's SRP proof.
    AwaitingProof { srp: Box<SrpServer> },
    /// M4 sent, waiting for the encrypted key exchange.
    AwaitingExchange { shared_secret: Zeroizing<Vec<u8>> },
}

/// Per-connection pair-setup state machine.
pub struct PairSetupServer {
    auth: Arc<dyn AuthStore>,
    stage: SetupStage,
}

impl PairSetupServer {
    pub fn new(auth: Arc<dyn AuthStore>) -> Self {
        Self {
            auth,
            stage: SetupStage::Idle,
        }
    }

    /// Process one pair-setup request body, returning the response.
    ///
    /// Authentication failures produce a TLV error response and reset the
    /// state machine; only malformed TLV bodies produce an `Err`.
    pub fn handle(&mut self, body: &[u8]) -> Result<SetupOutput> {
        let tlv = Tlv8::parse(body)?;
        let state = tlv
            .state()
            .ok_or(PairingError::MissingTlv(TlvType::State as u8))?;

        match state {
            0x01 => self.m1(),
            0x03 => self.m3(&tlv),
            0x05 => self.m5(&tlv),
            other => {
                tracing::warn!(state = other, "unexpected pair-setup state");
                self.stage = SetupStage::Idle;
                Ok(SetupOutput::reply(Tlv8::error_response(
                    other.wrapping_add(1),
                    TlvError::Unknown,
                )))
            }
        }
    }

    /// M1 -> M2: start a fresh SRP exchange.
    ///
    /// A repeated M1 always restarts with a new ephemeral server key, so a
    /// controller retrying after a failure never sees stale SRP state.
    fn m1(&mut self) -> Result<SetupOutput> {
        let pin = self.auth.pin();
        let salt = self.auth.salt();

        let srp = SrpServer::new(PAIR_SETUP_IDENTITY, pin.as_bytes(), salt);
        let public_key = srp.public_key();

        tracing::debug!("pair-setup M1 received, starting SRP exchange");
        self.stage = SetupStage::AwaitingProof { srp: Box::new(srp) };

        Ok(SetupOutput::reply(Tlv8::pair_setup_m2(&salt, &public_key)))
    }

    /// M3 -> M4: verify the controller's SRP proof.
    fn m3(&mut self, tlv: &Tlv8) -> Result<SetupOutput> {
        let srp = match std::mem::replace(&mut self.stage, SetupStage::Idle) {
            SetupStage::AwaitingProof { srp } => srp,
            _ => {
                tracing::warn!("pair-setup M3 without preceding M1");
                return Ok(SetupOutput::reply(Tlv8::error_response(
                    0x04,
                    TlvError::Unknown,
                )));
            }
        };

        let client_public = tlv.require(TlvType::PublicKey)?;
        let client_proof = tlv.require(TlvType::Proof)?;

        let session = match srp.verify_client_proof(client_public, client_proof) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "SRP proof verification failed");
                return Ok(SetupOutput::reply(Tlv8::error_response(
                    0x04,
                    TlvError::Authentication,
                )));
            }
        };

        let response = Tlv8::pair_setup_m4(&session.server_proof);
        self.stage = SetupStage::AwaitingExchange {
            shared_secret: Zeroizing::new(session.shared_secret.clone()),
        };

        Ok(SetupOutput::reply(response))
    }

    /// M5 -> M6: exchange long-term identity keys and persist the pairing.
    fn m5(&mut self, tlv: &Tlv8) -> Result<SetupOutput> {
        let shared_secret = match std::mem::replace(&mut self.stage, SetupStage::Idle) {
            SetupStage::AwaitingExchange { shared_secret } => shared_secret,
            _ => {
                tracing::warn!("pair-setup M5 without preceding M3");
                return Ok(SetupOutput::reply(Tlv8::error_response(
                    0x06,
                    TlvError::Unknown,
                )));
            }
        };

        let encrypted = tlv.require(TlvType::EncryptedData)?;
        let session_key = hkdf::derive_pair_setup_key(&shared_secret)?;

        let decrypted =
            match decrypt_with_nonce(&session_key, &nonce_from_string(PS_MSG05_NONCE), encrypted) {
                Ok(plain) => plain,
                Err(e) => {
                    tracing::warn!(error = %e, "pair-setup M5 decryption failed");
                    return Ok(SetupOutput::reply(Tlv8::error_response(
                        0x06,
                        TlvError::Authentication,
                    )));
                }
            };

        let inner = Tlv8::parse(&decrypted)?;
        let controller_id = inner.require(TlvType::Identifier)?.to_vec();
        let controller_ltpk = inner.require(TlvType::PublicKey)?;
        let signature = inner.require(TlvType::Signature)?;

        if controller_ltpk.len() != 32 || signature.len() != 64 {
            return Ok(SetupOutput::reply(Tlv8::error_response(
                0x06,
                TlvError::Authentication,
            )));
        }

        // Controller signs: iOSDeviceX || controller id || controller LTPK
        let device_x = hkdf::derive_controller_sign_key(&shared_secret)?;
        let mut signed_message =
            Vec::with_capacity(device_x.len() + controller_id.len() + controller_ltpk.len());
        signed_message.extend_from_slice(&device_x);
        signed_message.extend_from_slice(&controller_id);
        signed_message.extend_from_slice(controller_ltpk);

        let mut ltpk_arr = [0u8; 32];
        ltpk_arr.copy_from_slice(controller_ltpk);
        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(signature);

        if verify(&ltpk_arr, &signed_message, &sig_arr).is_err() {
            tracing::warn!("pair-setup M5 controller signature invalid");
            return Ok(SetupOutput::reply(Tlv8::error_response(
                0x06,
                TlvError::Authentication,
            )));
        }

        let controller_id = String::from_utf8(controller_id)
            .map_err(|_| PairingError::Protocol("controller id is not UTF-8".to_string()))?;

        // The first controller paired via pair-setup is always an admin
        self.auth.add_user(PairedController {
            id: controller_id.clone(),
            ltpk: ltpk_arr,
            admin: true,
        })?;

        // Accessory signs: AccessoryX || accessory id || accessory LTPK
        let accessory_x = hkdf::derive_accessory_sign_key(&shared_secret)?;
        let identity = IdentityKeyPair::from_seed(&self.auth.identity_seed());
        let device_id = self.auth.device_id();
        let accessory_ltpk = identity.public_key();

        let mut accessory_info =
            Vec::with_capacity(accessory_x.len() + device_id.len() + accessory_ltpk.len());
        accessory_info.extend_from_slice(&accessory_x);
        accessory_info.extend_from_slice(device_id.as_bytes());
        accessory_info.extend_from_slice(&accessory_ltpk);
        let accessory_signature = identity.sign(&accessory_info);

        let mut inner_reply = Tlv8::new();
        inner_reply.set(TlvType::Identifier, device_id.into_bytes());
        inner_reply.set(TlvType::PublicKey, accessory_ltpk.to_vec());
        inner_reply.set(TlvType::Signature, accessory_signature.to_vec());

        let encrypted_reply = encrypt_with_nonce(
            &session_key,
            &nonce_from_string(PS_MSG06_NONCE),
            &inner_reply.encode(),
        )?;

        let mut response = Tlv8::new();
        response.set(TlvType::State, vec![0x06]);
        response.set(TlvType::EncryptedData, encrypted_reply);

        tracing::info!(controller = %controller_id, "pair-setup complete");

        Ok(SetupOutput {
            body: response.encode(),
            completed: Some(controller_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_crypto::srp::{SrpChallenge, SrpClient};
    use std::sync::Mutex;

    struct MemoryAuthStore {
        pin: String,
        users: Mutex<Vec<PairedController>>,
        seed: [u8; 32],
    }

    impl MemoryAuthStore {
        fn new(pin: &str) -> Self {
            Self {
                pin: pin.to_string(),
                users: Mutex::new(Vec::new()),
                seed: [0x51u8; 32],
            }
        }
    }

    impl AuthStore for MemoryAuthStore {
        fn pin(&self) -> String {
            self.pin.clone()
        }
        fn device_id(&self) -> String {
            "AA:BB:CC:DD:EE:FF".to_string()
        }
        fn salt(&self) -> [u8; 16] {
            [0x7Eu8; 16]
        }
        fn identity_seed(&self) -> [u8; 32] {
            self.seed
        }
        fn has_user(&self) -> bool {
            !self.users.lock().unwrap().is_empty()
        }
        fn add_user(&self, controller: PairedController) -> Result<()> {
            let mut users = self.users.lock().unwrap();
            users.retain(|u| u.id != controller.id);
            users.push(controller);
            Ok(())
        }
        fn remove_user(&self, id: &str) -> Result<()> {
            self.users.lock().unwrap().retain(|u| u.id != id);
            Ok(())
        }
        fn list_users(&self) -> Result<Vec<PairedController>> {
            Ok(self.users.lock().unwrap().clone())
        }
        fn user_ltpk(&self, id: &str) -> Option<[u8; 32]> {
            self.users
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.id == id)
                .map(|u| u.ltpk)
        }
        fn user_is_admin(&self, id: &str) -> bool {
            self.users
                .lock()
                .unwrap()
                .iter()
                .any(|u| u.id == id && u.admin)
        }
    }

    fn m1_body() -> Vec<u8> {
        let mut tlv = Tlv8::new();
        tlv.set(TlvType::State, vec![0x01]);
        tlv.set(TlvType::Method, vec![0x00]);
        tlv.encode()
    }

    /// Drive a full controller-side pair-setup against the server engine.
    fn run_full_setup(
        server: &mut PairSetupServer,
        pin: &str,
        controller_id: &str,
    ) -> (SetupOutput, IdentityKeyPair) {
        // M1 -> M2
        let m2 = server.handle(&m1_body()).unwrap();
        let m2_tlv = Tlv8::parse(&m2.body).unwrap();
        assert_eq!(m2_tlv.state(), Some(0x02));

        let salt_bytes = m2_tlv.get(TlvType::Salt).unwrap();
        let mut salt = [0u8; 16];
        salt.copy_from_slice(salt_bytes);

        let client = SrpClient::new(PAIR_SETUP_IDENTITY, pin.as_bytes());
        let proof = client
            .process_challenge(&SrpChallenge {
                salt,
                server_public_key: m2_tlv.get(TlvType::PublicKey).unwrap().to_vec(),
            })
            .unwrap();

        // M3 -> M4
        let mut m3 = Tlv8::new();
        m3.set(TlvType::State, vec![0x03]);
        m3.set(TlvType::PublicKey, client.public_key());
        m3.set(TlvType::Proof, proof.client_proof.clone());
        let m4 = server.handle(&m3.encode()).unwrap();
        let m4_tlv = Tlv8::parse(&m4.body).unwrap();
        assert_eq!(m4_tlv.state(), Some(0x04));
        assert!(client.verify_server_proof(
            m4_tlv.get(TlvType::Proof).unwrap(),
            &proof.expected_server_proof
        ));

        // M5 -> M6
        let session_key = hkdf::derive_pair_setup_key(&proof.shared_secret).unwrap();
        let device_x = hkdf::derive_controller_sign_key(&proof.shared_secret).unwrap();

        let controller_identity = IdentityKeyPair::generate();
        let ltpk = controller_identity.public_key();

        let mut signed = Vec::new();
        signed.extend_from_slice(&device_x);
        signed.extend_from_slice(controller_id.as_bytes());
        signed.extend_from_slice(&ltpk);
        let signature = controller_identity.sign(&signed);

        let mut inner = Tlv8::new();
        inner.set(TlvType::Identifier, controller_id.as_bytes().to_vec());
        inner.set(TlvType::PublicKey, ltpk.to_vec());
        inner.set(TlvType::Signature, signature.to_vec());

        let encrypted = encrypt_with_nonce(
            &session_key,
            &nonce_from_string(PS_MSG05_NONCE),
            &inner.encode(),
        )
        .unwrap();

        let mut m5 = Tlv8::new();
        m5.set(TlvType::State, vec![0x05]);
        m5.set(TlvType::EncryptedData, encrypted);

        (server.handle(&m5.encode()).unwrap(), controller_identity)
    }

    mod happy_path {
        use super::*;

        #[test]
        fn full_exchange_persists_controller() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth.clone());

            let (m6, _identity) = run_full_setup(&mut server, "031-45-154", "controller-1");

            let m6_tlv = Tlv8::parse(&m6.body).unwrap();
            assert_eq!(m6_tlv.state(), Some(0x06));
            assert_eq!(m6.completed.as_deref(), Some("controller-1"));
            assert!(auth.has_user());
            assert!(auth.user_is_admin("controller-1"));
        }

        #[test]
        fn m6_carries_valid_accessory_signature() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth.clone());

            // Re-derive the session key on the controller side to open M6
            let m2 = server.handle(&m1_body()).unwrap();
            let m2_tlv = Tlv8::parse(&m2.body).unwrap();
            let mut salt = [0u8; 16];
            salt.copy_from_slice(m2_tlv.get(TlvType::Salt).unwrap());

            let client = SrpClient::new(PAIR_SETUP_IDENTITY, b"031-45-154");
            let proof = client
                .process_challenge(&SrpChallenge {
                    salt,
                    server_public_key: m2_tlv.get(TlvType::PublicKey).unwrap().to_vec(),
                })
                .unwrap();

            let mut m3 = Tlv8::new();
            m3.set(TlvType::State, vec![0x03]);
            m3.set(TlvType::PublicKey, client.public_key());
            m3.set(TlvType::Proof, proof.client_proof.clone());
            server.handle(&m3.encode()).unwrap();

            let session_key = hkdf::derive_pair_setup_key(&proof.shared_secret).unwrap();
            let device_x = hkdf::derive_controller_sign_key(&proof.shared_secret).unwrap();
            let controller_identity = IdentityKeyPair::generate();
            let ltpk = controller_identity.public_key();
            let mut signed = Vec::new();
            signed.extend_from_slice(&device_x);
            signed.extend_from_slice(b"controller-1");
            signed.extend_from_slice(&ltpk);
            let signature = controller_identity.sign(&signed);

            let mut inner = Tlv8::new();
            inner.set(TlvType::Identifier, b"controller-1".to_vec());
            inner.set(TlvType::PublicKey, ltpk.to_vec());
            inner.set(TlvType::Signature, signature.to_vec());
            let encrypted = encrypt_with_nonce(
                &session_key,
                &nonce_from_string(PS_MSG05_NONCE),
                &inner.encode(),
            )
            .unwrap();
            let mut m5 = Tlv8::new();
            m5.set(TlvType::State, vec![0x05]);
            m5.set(TlvType::EncryptedData, encrypted);
            let m6 = server.handle(&m5.encode()).unwrap();

            let m6_tlv = Tlv8::parse(&m6.body).unwrap();
            let decrypted = decrypt_with_nonce(
                &session_key,
                &nonce_from_string(PS_MSG06_NONCE),
                m6_tlv.get(TlvType::EncryptedData).unwrap(),
            )
            .unwrap();
            let inner_reply = Tlv8::parse(&decrypted).unwrap();

            let accessory_id = inner_reply.get(TlvType::Identifier).unwrap();
            let accessory_ltpk = inner_reply.get(TlvType::PublicKey).unwrap();
            let accessory_sig = inner_reply.get(TlvType::Signature).unwrap();
            assert_eq!(accessory_id, auth.device_id().as_bytes());

            let accessory_x = hkdf::derive_accessory_sign_key(&proof.shared_secret).unwrap();
            let mut expected = Vec::new();
            expected.extend_from_slice(&accessory_x);
            expected.extend_from_slice(accessory_id);
            expected.extend_from_slice(accessory_ltpk);

            let mut pk = [0u8; 32];
            pk.copy_from_slice(accessory_ltpk);
            let mut sig = [0u8; 64];
            sig.copy_from_slice(accessory_sig);
            assert!(verify(&pk, &expected, &sig).is_ok());
        }
    }

    mod failures {
        use super::*;

        #[test]
        fn wrong_pin_yields_authentication_error() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth.clone());

            let m2 = server.handle(&m1_body()).unwrap();
            let m2_tlv = Tlv8::parse(&m2.body).unwrap();
            let mut salt = [0u8; 16];
            salt.copy_from_slice(m2_tlv.get(TlvType::Salt).unwrap());

            let client = SrpClient::new(PAIR_SETUP_IDENTITY, b"999-99-999");
            let proof = client
                .process_challenge(&SrpChallenge {
                    salt,
                    server_public_key: m2_tlv.get(TlvType::PublicKey).unwrap().to_vec(),
                })
                .unwrap();

            let mut m3 = Tlv8::new();
            m3.set(TlvType::State, vec![0x03]);
            m3.set(TlvType::PublicKey, client.public_key());
            m3.set(TlvType::Proof, proof.client_proof);
            let m4 = server.handle(&m3.encode()).unwrap();

            let m4_tlv = Tlv8::parse(&m4.body).unwrap();
            assert_eq!(m4_tlv.state(), Some(0x04));
            assert_eq!(m4_tlv.error(), Some(TlvError::Authentication as u8));
            assert!(!auth.has_user());
        }

        #[test]
        fn m3_without_m1_yields_error() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth);

            let mut m3 = Tlv8::new();
            m3.set(TlvType::State, vec![0x03]);
            m3.set(TlvType::PublicKey, vec![0x01; 384]);
            m3.set(TlvType::Proof, vec![0x02; 64]);
            let out = server.handle(&m3.encode()).unwrap();

            let tlv = Tlv8::parse(&out.body).unwrap();
            assert_eq!(tlv.error(), Some(TlvError::Unknown as u8));
        }

        #[test]
        fn failed_proof_discards_srp_state() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth);

            server.handle(&m1_body()).unwrap();

            let mut m3 = Tlv8::new();
            m3.set(TlvType::State, vec![0x03]);
            m3.set(TlvType::PublicKey, vec![0x01; 384]);
            m3.set(TlvType::Proof, vec![0x02; 64]);
            let first = server.handle(&m3.encode()).unwrap();
            assert!(Tlv8::parse(&first.body).unwrap().error().is_some());

            // Retrying M3 after the failure hits fresh (Idle) state
            let second = server.handle(&m3.encode()).unwrap();
            let tlv = Tlv8::parse(&second.body).unwrap();
            assert_eq!(tlv.error(), Some(TlvError::Unknown as u8));
        }

        #[test]
        fn malformed_body_is_an_error() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth);
            assert!(server.handle(&[0x06]).is_err());
        }
    }

    mod replay {
        use super::*;

        #[test]
        fn repeated_m1_restarts_with_fresh_srp_key() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth);

            let first = server.handle(&m1_body()).unwrap();
            let second = server.handle(&m1_body()).unwrap();

            let pk1 = Tlv8::parse(&first.body)
                .unwrap()
                .get(TlvType::PublicKey)
                .unwrap()
                .to_vec();
            let pk2 = Tlv8::parse(&second.body)
                .unwrap()
                .get(TlvType::PublicKey)
                .unwrap()
                .to_vec();
            assert_ne!(pk1, pk2);
        }

        #[test]
        fn setup_still_succeeds_after_m1_replay() {
            let auth = Arc::new(MemoryAuthStore::new("031-45-154"));
            let mut server = PairSetupServer::new(auth.clone());

            // Stale M1 whose M2 the controller never used
            server.handle(&m1_body()).unwrap();

            let (m6, _) = run_full_setup(&mut server, "031-45-154", "controller-2");
            assert_eq!(m6.completed.as_deref(), Some("controller-2"));
            assert!(auth.has_user());
        }
    }
}
