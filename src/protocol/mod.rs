//! Binary opcode command protocol and the device state machines built on it.
//!
//! Requests are a single opcode byte followed by fixed-layout packed
//! arguments; responses echo the opcode followed by the packed result. The
//! reserved FAIL opcode (0xFF) always signals a device-side failure,
//! regardless of which command was in flight or what payload follows it.
//!
//! Two firmware families share this convention:
//! - the framed fluidic family (big-endian fields, COBS-framed transport),
//!   served by [`flow`];
//! - a legacy CNC/valve firmware family (little-endian fields, raw serial
//!   with ack-byte responses), served by [`sipper`].

pub mod flow;
pub mod sipper;

use crate::error::{FluidicError, Result};
use crate::transport::PacketStream;

pub use flow::{FlowController, SensorInfo};
pub use sipper::{SipPhase, Sipper, SipperConfig};

/// Opcode reserved for device-side failure reports.
pub const FAIL: u8 = 0xFF;

/// A framed request/response channel.
///
/// [`PacketStream`] is the production implementation; tests substitute
/// scripted links.
pub trait FramedLink: Send {
    fn send(&mut self, payload: &[u8]) -> Result<()>;
    fn recv(&mut self) -> Result<Vec<u8>>;
}

impl FramedLink for PacketStream {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        PacketStream::write(self, payload)
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        PacketStream::read(self)
    }
}

/// Send `opcode` + packed `args`, read one response, and return its payload.
///
/// Raises [`FluidicError::DeviceFailure`] on the FAIL sentinel and
/// [`FluidicError::UnexpectedResponse`] when the echoed opcode differs from
/// the request; neither is retried here.
pub fn transact(link: &mut dyn FramedLink, opcode: u8, args: &[u8]) -> Result<Vec<u8>> {
    let mut request = Vec::with_capacity(1 + args.len());
    request.push(opcode);
    request.extend_from_slice(args);
    link.send(&request)?;

    let response = link.recv()?;
    let echo = *response
        .first()
        .ok_or_else(|| FluidicError::Protocol("empty response frame".to_string()))?;
    if echo == FAIL {
        return Err(FluidicError::DeviceFailure);
    }
    if echo != opcode {
        return Err(FluidicError::UnexpectedResponse {
            expected: opcode,
            got: echo,
        });
    }
    Ok(response[1..].to_vec())
}
