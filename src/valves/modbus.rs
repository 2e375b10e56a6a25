//! Minimal synchronous Modbus-TCP client for the network valve bank.
//!
//! Only the two function codes the valve hardware needs are implemented:
//! 0x01 (read coils) and 0x05 (write single coil). Requests carry the
//! standard 7-byte MBAP header (transaction id, protocol id 0, remaining
//! length, unit id) followed by the PDU; an exception response sets the
//! high bit of the echoed function code and carries one exception byte.
//!
//! The client is deliberately blocking: valve writes are ordered,
//! low-volume, and issued from the same synchronous control flow as the
//! serial devices.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::error::{FluidicError, Result};

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

const MBAP_LEN: usize = 7;
const PROTOCOL_ID: u16 = 0;

/// Byte transport under the Modbus client. `TcpStream` in production;
/// tests substitute scripted fakes.
pub trait ModbusIo: Send {
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
}

impl ModbusIo for TcpStream {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Write::write_all(self, data)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match Read::read_exact(self, buf) {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Err(FluidicError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Blocking Modbus-TCP master speaking to one unit.
pub struct ModbusTcpClient {
    io: Box<dyn ModbusIo>,
    transaction_id: u16,
    unit_id: u8,
}

impl ModbusTcpClient {
    /// Connect to `addr` (e.g. `"192.168.1.30:502"`) with a per-read
    /// timeout.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FluidicError::Configuration("empty valve bank address".to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        debug!("Connected to Modbus valve bank at {}", addr);
        Ok(Self::over(Box::new(stream), 1))
    }

    /// Build over an arbitrary transport (test seam).
    pub fn over(io: Box<dyn ModbusIo>, unit_id: u8) -> Self {
        Self {
            io,
            transaction_id: 0,
            unit_id,
        }
    }

    /// Read `count` coils starting at `addr`, LSB-first per the wire format.
    pub fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<bool>> {
        let mut data = [0u8; 4];
        BigEndian::write_u16(&mut data[0..2], addr);
        BigEndian::write_u16(&mut data[2..4], count);
        let response = self.request(FC_READ_COILS, &data)?;

        let expected_bytes = (count as usize).div_ceil(8);
        if response.len() < 1 + expected_bytes || response[0] as usize != expected_bytes {
            return Err(FluidicError::Protocol(format!(
                "read coils returned {} data bytes, expected {}",
                response.len().saturating_sub(1),
                expected_bytes
            )));
        }
        let mut bits = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            bits.push(response[1 + i / 8] >> (i % 8) & 1 == 1);
        }
        Ok(bits)
    }

    /// Write one coil. `on` maps to the 0xFF00 coil value.
    pub fn write_single_coil(&mut self, addr: u16, on: bool) -> Result<()> {
        let mut data = [0u8; 4];
        BigEndian::write_u16(&mut data[0..2], addr);
        BigEndian::write_u16(&mut data[2..4], if on { 0xFF00 } else { 0x0000 });
        let response = self.request(FC_WRITE_SINGLE_COIL, &data)?;
        // The slave echoes address and value on success.
        if response != data {
            return Err(FluidicError::Protocol(
                "write coil echo did not match request".to_string(),
            ));
        }
        Ok(())
    }

    fn request(&mut self, function: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;

        let mut frame = Vec::with_capacity(MBAP_LEN + 1 + data.len());
        frame.resize(MBAP_LEN, 0);
        BigEndian::write_u16(&mut frame[0..2], tid);
        BigEndian::write_u16(&mut frame[2..4], PROTOCOL_ID);
        BigEndian::write_u16(&mut frame[4..6], (2 + data.len()) as u16);
        frame[6] = self.unit_id;
        frame.push(function);
        frame.extend_from_slice(data);
        trace!("modbus request: {:02x?}", frame);
        self.io.write_all(&frame)?;

        let mut header = [0u8; MBAP_LEN];
        self.io.read_exact(&mut header)?;
        if BigEndian::read_u16(&header[0..2]) != tid {
            return Err(FluidicError::Protocol(
                "modbus transaction id mismatch".to_string(),
            ));
        }
        if BigEndian::read_u16(&header[2..4]) != PROTOCOL_ID {
            return Err(FluidicError::Protocol(
                "unexpected modbus protocol id".to_string(),
            ));
        }
        let remaining = BigEndian::read_u16(&header[4..6]) as usize;
        if remaining < 2 {
            return Err(FluidicError::Protocol("truncated modbus response".to_string()));
        }
        let mut body = vec![0u8; remaining - 1];
        self.io.read_exact(&mut body)?;
        trace!("modbus response: {:02x?}", body);

        let echoed = body[0];
        if echoed == function | 0x80 {
            let exception = body.get(1).copied().unwrap_or(0);
            return Err(FluidicError::ModbusException {
                function,
                exception,
            });
        }
        if echoed != function {
            return Err(FluidicError::Protocol(format!(
                "modbus function echo {:#04x} does not match request {:#04x}",
                echoed, function
            )));
        }
        Ok(body[1..].to_vec())
    }
}
