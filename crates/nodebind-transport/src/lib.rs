//! Blocking TCP transport for nodebind nodes.
//!
//! Nodes are addressed by `tcp://host:port` URIs. This crate turns those
//! into connected [`NodeStream`]s (one per peer connection) and a
//! [`NodeListener`] for the local node's inbound side.
//!
//! This is the lowest layer of nodebind. Framing and connection management
//! build on top of [`NodeStream`].

pub mod address;
pub mod error;
pub mod stream;
pub mod tcp;

pub use address::NodeAddress;
pub use error::{Result, TransportError};
pub use stream::NodeStream;
pub use tcp::{connect, NodeListener};
