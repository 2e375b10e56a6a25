//! Serial transport stack.
//!
//! Three layers, leaf-first: the [`frame`] codec escapes the reserved
//! delimiter byte out of arbitrary payloads; the [`registry`] shares one
//! physical serial connection between logical consumers; [`packet`] composes
//! the two into a discovery-capable framed request/response channel.

pub mod frame;
pub mod packet;
pub mod registry;

pub use packet::{PacketStream, PortSelector};
pub use registry::{OpenParams, PortHandle, PortRegistry, SerialConnection};
