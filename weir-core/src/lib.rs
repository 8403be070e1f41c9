//! The weir connection core: a deterministic TCP/IPv4 stack built for
//! single-threaded, cooperative hosts.
//!
//! The crate implements the Transmission Control Protocol as described in
//! [RFC 793](https://www.rfc-editor.org/rfc/rfc793.html) with the retransmission
//! timer of [RFC 6298](https://www.rfc-editor.org/rfc/rfc6298.html) and the
//! Reno/NewReno congestion control of [RFC 5681](https://www.rfc-editor.org/rfc/rfc5681.html)
//! and [RFC 6582](https://www.rfc-editor.org/rfc/rfc6582.html).
//!
//! # Organization
//!
//! - [`message`] provides the byte rope that carries segment text
//! - [`wire`] is the single host/network seam: header layout, options,
//!   and the one's-complement checksum
//! - [`tcp`] holds the connection machine ([`tcp::Tcb`]) and the host
//!   ([`tcp::Tcp`]) that owns connections, listeners and port allocation
//!
//! # Determinism
//!
//! Nothing in this crate reads a clock or spawns a task. Time advances only
//! through `advance_time(Duration)` and all output is polled, so every
//! exchange between two hosts can be replayed byte for byte in a unit test.

pub mod message;
pub use message::Message;

pub mod endpoint;
pub use endpoint::{Endpoint, Endpoints, Ipv4Address};

pub mod wire;

pub mod tcp;
pub use tcp::{Datagram, Tcp, TcpConfig, TcpEvent};

use std::hash::BuildHasherDefault;

/// The hash map used throughout the crate. The connection and listener
/// tables are keyed by small fixed-size types, where FxHasher beats SipHash
/// comfortably.
pub type FxHashMap<K, V> =
    std::collections::HashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
