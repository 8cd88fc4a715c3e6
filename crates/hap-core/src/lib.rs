//! # hap-core
//!
//! Core types and error definitions shared across all HAP server crates.

pub mod error;

pub use error::{CryptoError, Error, PairingError, ParseError, Result};
