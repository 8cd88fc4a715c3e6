//! # hap-pairing
//!
//! Accessory-side HomeKit pairing state machines.
//!
//! - [`PairSetupServer`] runs the SRP-based pair-setup exchange (M1-M6)
//! - [`PairVerifyServer`] runs the ECDH pair-verify exchange (M1-M4)
//! - [`PairingsController`] handles add/remove/list pairing requests on
//!   an already-verified session
//!
//! Each engine is a per-connection state machine: the server owns one
//! instance per connection and feeds it raw TLV8 request bodies.

pub mod auth;
pub mod pair_setup;
pub mod pair_verify;
pub mod pairings;

pub use auth::{AuthStore, PairedController};
pub use pair_setup::{PairSetupServer, SetupOutput};
pub use pair_verify::{PairVerifyServer, VerifiedSession, VerifyOutput};
pub use pairings::{PairingsController, PairingsOutput};
