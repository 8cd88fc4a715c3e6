//! Key material wrappers that zeroize on drop.

use hap_core::error::CryptoError;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hkdf;

/// Shared secret from SRP or ECDH.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for SharedSecret {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A 32-byte symmetric encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Directional session keys for a verified connection.
///
/// Derived once from the pair-verify shared secret. The accessory sends
/// with `accessory_to_controller` and receives with `controller_to_accessory`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub accessory_to_controller: [u8; 32],
    pub controller_to_accessory: [u8; 32],
}

impl SessionKeys {
    /// Derive both directional keys from the pair-verify shared secret.
    pub fn derive(shared_secret: &SharedSecret) -> Result<Self, CryptoError> {
        Ok(Self {
            accessory_to_controller: hkdf::derive_accessory_to_controller_key(
                shared_secret.as_bytes(),
            )?,
            controller_to_accessory: hkdf::derive_controller_to_accessory_key(
                shared_secret.as_bytes(),
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_keys_are_directional() {
        let shared = SharedSecret::from([0xA7u8; 32]);
        let keys = SessionKeys::derive(&shared).unwrap();
        assert_ne!(keys.accessory_to_controller, keys.controller_to_accessory);
    }

    #[test]
    fn derivation_is_deterministic() {
        let shared = SharedSecret::from([0x13u8; 32]);
        let keys1 = SessionKeys::derive(&shared).unwrap();
        let keys2 = SessionKeys::derive(&shared).unwrap();
        assert_eq!(keys1.accessory_to_controller, keys2.accessory_to_controller);
        assert_eq!(keys1.controller_to_accessory, keys2.controller_to_accessory);
    }

    #[test]
    fn different_secrets_produce_different_keys() {
        let keys1 = SessionKeys::derive(&SharedSecret::from([0x01u8; 32])).unwrap();
        let keys2 = SessionKeys::derive(&SharedSecret::from([0x02u8; 32])).unwrap();
        assert_ne!(keys1.accessory_to_controller, keys2.accessory_to_controller);
    }
}
