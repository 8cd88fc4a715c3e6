//! Persistent authentication state shared by the pairing engines.

use hap_core::Result;

/// A controller that completed pair-setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedController {
    /// Controller identifier (a UUID string on Apple controllers).
    pub id: String,
    /// Controller's long-term Ed25519 public key.
    pub ltpk: [u8; 32],
    /// Admin controllers may manage pairings.
    pub admin: bool,
}

/// Storage for the accessory identity and paired controllers.
///
/// Implementations must persist across restarts or every controller
/// loses its pairing. The accessory identity (device id, SRP salt,
/// Ed25519 seed) is generated once and never regenerated.
pub trait AuthStore: Send + Sync {
    /// Setup PIN in `XXX-XX-XXX` form.
    fn pin(&self) -> String;

    /// Stable accessory identifier (MAC-style string).
    fn device_id(&self) -> String;

    /// SRP salt, generated once at first startup.
    fn salt(&self) -> [u8; 16];

    /// Seed of the accessory's long-term Ed25519 identity key.
    fn identity_seed(&self) -> [u8; 32];

    /// True once at least one controller is paired.
    fn has_user(&self) -> bool;

    /// Persist a paired controller. Adding an existing id with the same
    /// key is idempotent.
    fn add_user(&self, controller: PairedController) -> Result<()>;

    /// Remove a paired controller. Removing an unknown id is a no-op.
    fn remove_user(&self, id: &str) -> Result<()>;

    /// All paired controllers.
    fn list_users(&self) -> Result<Vec<PairedController>>;

    /// Long-term public key for a paired controller, if known.
    fn user_ltpk(&self, id: &str) -> Option<[u8; 32]>;

    /// Whether a paired controller has admin permission.
    fn user_is_admin(&self, id: &str) -> bool;
}
