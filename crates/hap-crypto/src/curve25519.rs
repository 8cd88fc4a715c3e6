//! Curve25519 ECDH for the pair-verify key agreement.

use hap_core::error::CryptoError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

/// Ephemeral Curve25519 key pair.
///
/// A fresh pair is generated for every pair-verify M1 and consumed by the
/// Diffie-Hellman exchange, so a key is never used for two handshakes.
#[derive(ZeroizeOnDrop)]
pub struct EcdhKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl EcdhKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    /// Create from existing secret key bytes.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let static_secret = StaticSecret::from(*secret);
        let public = PublicKey::from(&static_secret);
        Self {
            public: public.to_bytes(),
            secret: *secret,
        }
    }

    /// Get the public key (32 bytes).
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Perform Diffie-Hellman key exchange, consuming the key pair.
    ///
    /// Rejects an all-zero peer key and an all-zero shared secret
    /// (low-order point contribution).
    pub fn diffie_hellman(self, peer_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        if peer_public.iter().all(|&b| b == 0) {
            return Err(CryptoError::KeyDerivation(
                "Peer public key is all zeros".to_string(),
            ));
        }

        let static_secret = StaticSecret::from(self.secret);
        let their_public = PublicKey::from(*peer_public);
        let shared = static_secret.diffie_hellman(&their_public).to_bytes();

        if shared.iter().all(|&b| b == 0) {
            return Err(CryptoError::KeyDerivation(
                "Shared secret is all zeros (low-order peer point)".to_string(),
            ));
        }

        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod key_generation {
        use super::*;

        #[test]
        fn generate_creates_unique_keys() {
            let kp1 = EcdhKeyPair::generate();
            let kp2 = EcdhKeyPair::generate();
            assert_ne!(kp1.public_key(), kp2.public_key());
        }

        #[test]
        fn from_secret_derives_rfc7748_public_key() {
            let secret =
                hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                    .unwrap();
            let expected_public =
                hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                    .unwrap();

            let mut secret_arr = [0u8; 32];
            secret_arr.copy_from_slice(&secret);

            let kp = EcdhKeyPair::from_secret(&secret_arr);
            assert_eq!(kp.public_key().to_vec(), expected_public);
        }
    }

    mod diffie_hellman {
        use super::*;

        #[test]
        fn both_parties_derive_same_secret() {
            let accessory = EcdhKeyPair::generate();
            let controller = EcdhKeyPair::generate();

            let accessory_public = accessory.public_key();
            let controller_public = controller.public_key();

            let shared_a = accessory.diffie_hellman(&controller_public).unwrap();
            let shared_c = controller.diffie_hellman(&accessory_public).unwrap();

            assert_eq!(shared_a, shared_c);
        }

        #[test]
        fn rfc7748_shared_secret_vector() {
            let alice_secret =
                hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                    .unwrap();
            let bob_public =
                hex::decode("de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f")
                    .unwrap();
            let expected_shared =
                hex::decode("4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742")
                    .unwrap();

            let mut secret_arr = [0u8; 32];
            secret_arr.copy_from_slice(&alice_secret);
            let mut peer_arr = [0u8; 32];
            peer_arr.copy_from_slice(&bob_public);

            let shared = EcdhKeyPair::from_secret(&secret_arr)
                .diffie_hellman(&peer_arr)
                .unwrap();
            assert_eq!(shared.to_vec(), expected_shared);
        }

        #[test]
        fn rejects_all_zero_peer_key() {
            let kp = EcdhKeyPair::generate();
            assert!(kp.diffie_hellman(&[0u8; 32]).is_err());
        }

        #[test]
        fn rejects_low_order_peer_point() {
            let low_order =
                hex::decode("ecffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff7f")
                    .unwrap();
            let mut low_order_arr = [0u8; 32];
            low_order_arr.copy_from_slice(&low_order);

            let kp = EcdhKeyPair::generate();
            assert!(kp.diffie_hellman(&low_order_arr).is_err());
        }
    }
}
