//! # hap-server
//!
//! Connection-level protocol engine for a HAP accessory server.
//!
//! The engine turns an anonymous plaintext connection into an
//! authenticated, encrypted session (pair-setup then pair-verify) and
//! serves characteristic read/write/subscribe traffic over it, pushing
//! batched event notifications to subscribed connections.
//!
//! Transport, mDNS advertisement and pairing persistence are external
//! collaborators behind the traits in [`traits`].

pub mod accessory;
pub mod characteristics;
pub mod connection;
pub mod context;
pub mod event;
pub mod http;
pub mod registry;
pub mod root;
pub mod session;
pub mod subscriptions;
pub mod traits;

pub use accessory::{Accessory, Characteristic, Service};
pub use connection::Connection;
pub use context::ServerContext;
pub use hap_pairing::{AuthStore, PairedController};
pub use http::{HttpRequest, HttpResponse, Method};
pub use registry::Registry;
pub use root::BridgeRoot;
pub use session::{Session, SessionPhase};
pub use subscriptions::SubscriptionTable;
pub use traits::{Advertiser, EventConnection, TransportSink};
