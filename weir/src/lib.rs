//! weir: a reverse-proxy load balancer on the [`weir_core`] TCP stack.
//!
//! The balancer listens on a client-facing TCP instance and fans accepted
//! connections out across a fleet of backend nodes reached through a second
//! TCP instance. Each backend keeps a pool of pre-established, warm upstream
//! connections so that a client can be paired without waiting out a
//! handshake; liveness probing takes dead backends out of rotation and a
//! wait queue absorbs clients while the pool refills.
//!
//! Everything runs on one thread. The driver calls [`Balancer::step`] with
//! the elapsed time, moves datagrams between the two TCP instances and the
//! outside world, and that is the whole event loop.

pub mod config;
pub use config::Config;

pub mod nodes;
pub use nodes::{Node, Nodes, Session};

pub mod balancer;
pub use balancer::{Balancer, Waiting};

pub mod liveupdate;
pub use liveupdate::{Restore, Storage};

pub mod demo;
