//! The host/network seam: TCP header layout, option codec, and the
//! one's-complement checksum. All byte-order conversion in the crate happens
//! here; everything above this module works in host order.

pub mod checksum;
pub use checksum::Checksum;

pub mod options;
pub use options::TcpOption;

pub mod packet;
pub use packet::{Control, PacketError, TcpHeader, TcpHeaderBuilder};
