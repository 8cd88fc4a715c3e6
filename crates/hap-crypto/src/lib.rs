//! # hap-crypto
//!
//! Cryptographic primitives for the HAP pairing and session layers.
//!
//! This crate provides:
//! - SRP-6a (3072-bit) for pair-setup, both accessory and controller sides
//! - Curve25519 ECDH for pair-verify key agreement
//! - Ed25519 for long-term identity signatures
//! - ChaCha20-Poly1305 for AEAD session encryption with HomeKit framing
//! - HKDF-SHA512 for key derivation
//!
//! All secret material is zeroized on drop.

pub mod chacha;
pub mod curve25519;
pub mod ed25519;
pub mod hkdf;
pub mod keys;
pub mod srp;
pub mod tlv;

pub use chacha::SessionCipher;
pub use keys::{EncryptionKey, SessionKeys, SharedSecret};
pub use tlv::{Tlv8, TlvError, TlvMethod, TlvType};
