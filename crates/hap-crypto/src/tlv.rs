//! TLV8 encoding/decoding for HAP pairing messages.
//!
//! TLV8 format: [Type: 1 byte][Length: 1 byte][Value: 0-255 bytes]
//! Values longer than 255 bytes are fragmented across multiple TLVs.

use hap_core::error::ParseError;
use std::collections::HashMap;

/// TLV type constants for HAP pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    Error = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0A,
    Permissions = 0x0B,
    FragmentData = 0x0C,
    FragmentLast = 0x0D,
    SessionId = 0x0E,
    Flags = 0x13,
    Separator = 0xFF,
}

/// Pairing method values carried in `TlvType::Method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvMethod {
    PairSetup = 0x00,
    PairVerify = 0x02,
    AddPairing = 0x03,
    RemovePairing = 0x04,
    ListPairings = 0x05,
}

/// Pairing error codes carried in `TlvType::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvError {
    Unknown = 0x01,
    Authentication = 0x02,
    Backoff = 0x03,
    MaxPeers = 0x04,
    MaxTries = 0x05,
    Unavailable = 0x06,
    Busy = 0x07,
}

/// Parsed TLV8 message.
#[derive(Debug, Clone, Default)]
pub struct Tlv8 {
    items: HashMap<u8, Vec<u8>>,
}

impl Tlv8 {
    /// Create empty TLV8 message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TLV8 from bytes.
    ///
    /// Handles fragmented values (values > 255 bytes split across multiple TLVs).
    /// Consecutive TLVs with the same type are concatenated.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
        let mut i = 0;
        let mut last_type: Option<u8> = None;

        while i < data.len() {
            if i + 2 > data.len() {
                return Err(ParseError::InvalidFormat(
                    "TLV8: truncated header".to_string(),
                ));
            }

            let typ = data[i];
            let len = data[i + 1] as usize;
            i += 2;

            if i + len > data.len() {
                return Err(ParseError::InvalidFormat(format!(
                    "TLV8: truncated value (expected {} bytes, got {})",
                    len,
                    data.len() - i
                )));
            }

            let value = &data[i..i + len];
            i += len;

            // Fragmentation: consecutive TLVs of the same type concatenate
            if Some(typ) == last_type {
                if let Some(existing) = items.get_mut(&typ) {
                    existing.extend_from_slice(value);
                }
            } else {
                items
                    .entry(typ)
                    .or_insert_with(Vec::new)
                    .extend_from_slice(value);
            }

            last_type = Some(typ);
        }

        Ok(Self { items })
    }

    /// Encode to bytes.
    ///
    /// Values > 255 bytes are automatically fragmented across multiple TLVs.
    pub fn encode(&self) -> Vec<u8> {
        let mut result = Vec::new();

        // Sort by type for deterministic output
        let mut types: Vec<_> = self.items.keys().collect();
        types.sort();

        for typ in types {
            let value = &self.items[typ];

            if value.is_empty() {
                result.push(*typ);
                result.push(0);
            } else {
                for chunk in value.chunks(255) {
                    result.push(*typ);
                    result.push(chunk.len() as u8);
                    result.extend_from_slice(chunk);
                }
            }
        }

        result
    }

    /// Get value for type.
    pub fn get(&self, typ: TlvType) -> Option<&[u8]> {
        self.items.get(&(typ as u8)).map(|v| v.as_slice())
    }

    /// Get value for type, or a protocol error naming the missing tag.
    pub fn require(&self, typ: TlvType) -> Result<&[u8], ParseError> {
        self.get(typ).ok_or(ParseError::MissingField(match typ {
            TlvType::Method => "Method",
            TlvType::Identifier => "Identifier",
            TlvType::Salt => "Salt",
            TlvType::PublicKey => "PublicKey",
            TlvType::Proof => "Proof",
            TlvType::EncryptedData => "EncryptedData",
            TlvType::State => "State",
            TlvType::Signature => "Signature",
            _ => "TLV item",
        }))
    }

    /// Set value for type.
    pub fn set(&mut self, typ: TlvType, value: impl Into<Vec<u8>>) {
        self.items.insert(typ as u8, value.into());
    }

    /// Check if type is present.
    pub fn contains(&self, typ: TlvType) -> bool {
        self.items.contains_key(&(typ as u8))
    }

    /// Get state value (single byte).
    pub fn state(&self) -> Option<u8> {
        self.get(TlvType::State).and_then(|v| v.first().copied())
    }

    /// Get method value (single byte).
    pub fn method(&self) -> Option<u8> {
        self.get(TlvType::Method).and_then(|v| v.first().copied())
    }

    /// Get error value (single byte).
    pub fn error(&self) -> Option<u8> {
        self.get(TlvType::Error).and_then(|v| v.first().copied())
    }

    /// Build an error response for the given handshake state.
    pub fn error_response(state: u8, error: TlvError) -> Self {
        let mut tlv = Self::new();
        tlv.set(TlvType::State, vec![state]);
        tlv.set(TlvType::Error, vec![error as u8]);
        tlv
    }

    /// Build pair-setup M2: salt plus the accessory's SRP public key.
    pub fn pair_setup_m2(salt: &[u8], server_public_key: &[u8]) -> Self {
        let mut tlv = Self::new();
        tlv.set(TlvType::State, vec![0x02]);
        tlv.set(TlvType::Salt, salt.to_vec());
        tlv.set(TlvType::PublicKey, server_public_key.to_vec());
        tlv
    }

    /// Build pair-setup M4: the accessory's SRP proof.
    pub fn pair_setup_m4(server_proof: &[u8]) -> Self {
        let mut tlv = Self::new();
        tlv.set(TlvType::State, vec![0x04]);
        tlv.set(TlvType::Proof, server_proof.to_vec());
        tlv
    }

    /// Build pair-verify M2: ephemeral public key plus encrypted identity proof.
    pub fn pair_verify_m2(public_key: &[u8; 32], encrypted: Vec<u8>) -> Self {
        let mut tlv = Self::new();
        tlv.set(TlvType::State, vec![0x02]);
        tlv.set(TlvType::PublicKey, public_key.to_vec());
        tlv.set(TlvType::EncryptedData, encrypted);
        tlv
    }
}
