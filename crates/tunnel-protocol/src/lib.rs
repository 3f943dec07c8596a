//! # Tunnel Protocol
//!
//! Shared between the Gateway and the Agent: the frame wire format
//! ([`codec`], [`frame`]), the mapping/config data model ([`mapping`]),
//! and small utilities both sides need independently of any transport
//! ([`backoff`], [`clock`]).

pub mod backoff;
pub mod clock;
pub mod codec;
pub mod frame;
pub mod http;
pub mod mapping;

pub use codec::{decode, encode, CodecError};
pub use frame::Frame;
pub use http::is_hop_by_hop;
pub use mapping::{ConfigSnapshot, PortMapping};
