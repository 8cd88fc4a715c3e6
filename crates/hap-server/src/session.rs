//! Per-connection session state and transport crypto gating.

use hap_core::error::{CryptoError, PairingError, Result};
use hap_crypto::{keys::SessionKeys, SessionCipher};

/// Handshake phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Fresh connection, plaintext, only pairing endpoints reachable.
    Unverified,
    /// Pair-setup in progress.
    PairSetup,
    /// Pair-verify in progress.
    PairVerify,
    /// Authenticated; all bodies encrypted with the session cipher.
    Verified,
    /// Connection torn down; no further traffic.
    Closed,
}

/// State owned exclusively by one connection.
///
/// Key material lives only here and is zeroized when the cipher drops,
/// whether on `close` or on connection teardown.
pub struct Session {
    phase: SessionPhase,
    cipher: Option<SessionCipher>,
    controller_id: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Unverified,
            cipher: None,
            controller_id: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_verified(&self) -> bool {
        self.phase == SessionPhase::Verified
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// Identifier of the verified controller, if any.
    pub fn controller_id(&self) -> Option<&str> {
        self.controller_id.as_deref()
    }

    /// Mark a handshake as in progress.
    pub fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != SessionPhase::Closed {
            self.phase = phase;
        }
    }

    /// Install the session keys after a completed pair-verify.
    ///
    /// The keys take effect for the request after the M4 response;
    /// callers must send that response in plaintext.
    pub fn activate(&mut self, controller_id: String, keys: &SessionKeys) {
        self.cipher = Some(SessionCipher::new(
            keys.accessory_to_controller,
            keys.controller_to_accessory,
        ));
        self.controller_id = Some(controller_id);
        self.phase = SessionPhase::Verified;
    }

    /// Decrypt an inbound body. Any failure closes the session.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| PairingError::InvalidState("no session cipher".to_string()))?;
        match cipher.decrypt(data) {
            Ok(plain) => Ok(plain),
            Err(e) => {
                tracing::warn!(error = %e, "session decrypt failed, closing connection");
                self.close();
                Err(e.into())
            }
        }
    }

    /// Encrypt an outbound body (response or event).
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.phase != SessionPhase::Verified {
            return Err(PairingError::InvalidState("session not verified".to_string()).into());
        }
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| CryptoError::Encryption("no session cipher".to_string()))?;
        cipher.encrypt(data).map_err(Into::into)
    }

    /// Tear down the session, dropping (and zeroizing) key material.
    pub fn close(&mut self) {
        self.cipher = None;
        self.controller_id = None;
        self.phase = SessionPhase::Closed;
    }
}
