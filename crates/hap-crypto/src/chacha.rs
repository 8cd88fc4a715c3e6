//! ChaCha20-Poly1305 AEAD encryption for the verified session channel.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hap_core::error::CryptoError;
use zeroize::ZeroizeOnDrop;

/// Verified-session cipher with per-direction auto-incrementing nonces.
///
/// The accessory encrypts outbound frames (responses and events) with the
/// accessory-to-controller key and decrypts inbound frames with the
/// controller-to-accessory key. Counters never reset for the lifetime of
/// the session; an authentication failure is fatal for the connection.
#[derive(ZeroizeOnDrop)]
pub struct SessionCipher {
    outbound_key: [u8; 32],
    inbound_key: [u8; 32],
    #[zeroize(skip)]
    outbound_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    inbound_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    encrypt_counter: u64,
    #[zeroize(skip)]
    decrypt_counter: u64,
}

impl SessionCipher {
    /// Create cipher with separate outbound/inbound keys.
    pub fn new(outbound_key: [u8; 32], inbound_key: [u8; 32]) -> Self {
        let outbound_cipher = ChaCha20Poly1305::new(&outbound_key.into());
        let inbound_cipher = ChaCha20Poly1305::new(&inbound_key.into());
        Self {
            outbound_key,
            inbound_key,
            outbound_cipher,
            inbound_cipher,
            encrypt_counter: 0,
            decrypt_counter: 0,
        }
    }

    /// Encrypt plaintext with HomeKit framing.
    ///
    /// Each block is: [u16_le len][ciphertext][16-byte tag], with AAD=len.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        const MAX_BLOCK: usize = 0x400;
        if plaintext.is_empty() {
            return Err(CryptoError::Encryption("Empty plaintext".to_string()));
        }

        let mut out = Vec::with_capacity(plaintext.len() + (plaintext.len() / MAX_BLOCK + 1) * 18);
        let mut offset = 0;
        while offset < plaintext.len() {
            let remaining = plaintext.len() - offset;
            let block_len = remaining.min(MAX_BLOCK) as u16;
            let block = &plaintext[offset..offset + block_len as usize];
            let aad = block_len.to_le_bytes();

            let nonce = build_nonce_from_counter(self.encrypt_counter);
            let nonce = Nonce::from_slice(&nonce);
            let payload = Payload { msg: block, aad: &aad };

            let ciphertext_with_tag = self
                .outbound_cipher
                .encrypt(nonce, payload)
                .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))?;

            out.extend_from_slice(&aad);
            out.extend_from_slice(&ciphertext_with_tag);

            self.encrypt_counter += 1;
            offset += block_len as usize;
        }

        Ok(out)
    }

    /// Decrypt HomeKit-framed data (with length prefix).
    ///
    /// Format: [u16_le len][ciphertext][16-byte tag] repeated for each block.
    /// Any authentication or framing failure leaves the counter untouched
    /// and must close the connection.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < 18 {
            return Err(CryptoError::Decryption(
                "Data too short for HomeKit frame".to_string(),
            ));
        }

        let mut out = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(CryptoError::Decryption(
                    "Incomplete length prefix".to_string(),
                ));
            }

            let block_len = u16::from_le_bytes([data[offset], data[offset + 1]]);
            offset += 2;

            let block_end = offset + block_len as usize + 16;
            if block_end > data.len() {
                return Err(CryptoError::Decryption(
                    "Incomplete ciphertext block".to_string(),
                ));
            }

            let aad = block_len.to_le_bytes();
            let nonce = build_nonce_from_counter(self.decrypt_counter);
            let nonce = Nonce::from_slice(&nonce);
            let payload = Payload {
                msg: &data[offset..block_end],
                aad: &aad,
            };

            let plaintext = self
                .inbound_cipher
                .decrypt(nonce, payload)
                .map_err(|_| {
                    CryptoError::Decryption("Decryption/authentication failed".to_string())
                })?;

            self.decrypt_counter += 1;
            out.extend_from_slice(&plaintext);
            offset = block_end;
        }

        Ok(out)
    }

    /// Get current encryption nonce counter.
    pub fn encrypt_counter(&self) -> u64 {
        self.encrypt_counter
    }

    /// Get current decryption nonce counter.
    pub fn decrypt_counter(&self) -> u64 {
        self.decrypt_counter
    }
}

/// Build 12-byte nonce with u64 counter at bytes 4-11 (little-endian).
fn build_nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Build 12-byte nonce from a short ASCII label, right-aligned.
///
/// Used for the fixed pairing nonces ("PS-Msg05", "PV-Msg02", ...).
pub fn nonce_from_string(s: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    let len = s.len().min(12);
    let start = 12 - len;
    nonce[start..].copy_from_slice(&s[..len]);
    nonce
}

/// One-shot encryption with an explicit nonce (pairing messages).
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))
}

/// One-shot decryption with an explicit nonce (pairing messages).
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext_with_tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext_with_tag.len() < 16 {
        return Err(CryptoError::Decryption(
            "Ciphertext too short (missing tag)".to_string(),
        ));
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext_with_tag)
        .map_err(|_| CryptoError::Decryption("Decryption/authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_ciphers() -> (SessionCipher, SessionCipher) {
        let a2c = [0x11u8; 32];
        let c2a = [0x22u8; 32];
        // Accessory side and controller side see opposite key roles
        (SessionCipher::new(a2c, c2a), SessionCipher::new(c2a, a2c))
    }

    mod session_cipher {
        use super::*;

        #[test]
        fn accessory_to_controller_roundtrip() {
            let (mut accessory, mut controller) = paired_ciphers();
            let frame = accessory.encrypt(b"hello controller").unwrap();
            let plain = controller.decrypt(&frame).unwrap();
            assert_eq!(plain, b"hello controller");
        }

        #[test]
        fn controller_to_accessory_roundtrip() {
            let (mut accessory, mut controller) = paired_ciphers();
            let frame = controller.encrypt(b"hello accessory").unwrap();
            let plain = accessory.decrypt(&frame).unwrap();
            assert_eq!(plain, b"hello accessory");
        }

        #[test]
        fn counters_advance_per_block() {
            let (mut accessory, mut controller) = paired_ciphers();
            for _ in 0..3 {
                let frame = accessory.encrypt(b"tick").unwrap();
                controller.decrypt(&frame).unwrap();
            }
            assert_eq!(accessory.encrypt_counter(), 3);
            assert_eq!(controller.decrypt_counter(), 3);
        }

        #[test]
        fn large_payload_is_fragmented() {
            let (mut accessory, mut controller) = paired_ciphers();
            let payload = vec![0xA5u8; 3000]; // > 2 blocks of 0x400
            let frame = accessory.encrypt(&payload).unwrap();
            assert_eq!(controller.decrypt(&frame).unwrap(), payload);
            assert_eq!(accessory.encrypt_counter(), 3);
        }

        #[test]
        fn counter_mismatch_fails_authentication() {
            let (mut accessory, mut controller) = paired_ciphers();
            let first = accessory.encrypt(b"one").unwrap();
            let second = accessory.encrypt(b"two").unwrap();
            // Skip the first frame: controller's counter no longer matches
            drop(first);
            assert!(controller.decrypt(&second).is_err());
        }

        #[test]
        fn tampered_frame_fails_authentication() {
            let (mut accessory, mut controller) = paired_ciphers();
            let mut frame = accessory.encrypt(b"payload").unwrap();
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
            assert!(controller.decrypt(&frame).is_err());
        }

        #[test]
        fn empty_plaintext_is_rejected() {
            let (mut accessory, _) = paired_ciphers();
            assert!(accessory.encrypt(&[]).is_err());
        }
    }

    mod nonce_helpers {
        use super::*;

        #[test]
        fn counter_nonce_little_endian_at_offset_4() {
            let nonce = build_nonce_from_counter(1);
            assert_eq!(nonce[0..4], [0, 0, 0, 0]);
            assert_eq!(nonce[4], 1);
            assert_eq!(nonce[5..12], [0, 0, 0, 0, 0, 0, 0]);
        }

        #[test]
        fn string_nonce_right_aligned() {
            let nonce = nonce_from_string(b"PV-Msg02");
            assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
            assert_eq!(&nonce[4..12], b"PV-Msg02");
        }
    }

    mod one_shot {
        use super::*;

        #[test]
        fn encrypt_decrypt_roundtrip() {
            let key = [0x42u8; 32];
            let nonce = nonce_from_string(b"PS-Msg05");
            let ct = encrypt_with_nonce(&key, &nonce, b"inner tlv").unwrap();
            let pt = decrypt_with_nonce(&key, &nonce, &ct).unwrap();
            assert_eq!(pt, b"inner tlv");
        }

        #[test]
        fn wrong_nonce_fails() {
            let key = [0x42u8; 32];
            let ct = encrypt_with_nonce(&key, &nonce_from_string(b"PS-Msg05"), b"x").unwrap();
            assert!(decrypt_with_nonce(&key, &nonce_from_string(b"PS-Msg06"), &ct).is_err());
        }

        #[test]
        fn short_ciphertext_is_rejected() {
            let key = [0x42u8; 32];
            let nonce = nonce_from_string(b"PS-Msg05");
            assert!(decrypt_with_nonce(&key, &nonce, &[0u8; 8]).is_err());
        }
    }
}
