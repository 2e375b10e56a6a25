//! Framed packet transport over a shared serial port.
//!
//! A `PacketStream` is constructed by scanning candidate serial ports for a
//! device that answers the one-byte handshake:
//!
//! - client sends the frame `[0x00]`;
//! - a single-logical-device firmware answers with the frame `[0x00]`;
//! - a multi-logical-device firmware answers `[0x00, device_id]`, where the
//!   id distinguishes co-located roles on one physical link (0 = pump
//!   controller, 1 = relay controller).
//!
//! Candidates that fail to answer, or answer with the wrong shape, are
//! closed and skipped. Once accepted, the stream frames every write and
//! decodes exactly one frame per read, with the port's per-read timeout
//! applied to each length-directed read. A short read is fatal; callers
//! never see a partial frame.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::error::{FluidicError, Result};
use crate::transport::frame;
use crate::transport::registry::{OpenParams, PortHandle, PortRegistry};

/// Baud rate used by the framed fluidic firmware family.
pub const HANDSHAKE_BAUD: u32 = 115_200;

/// How discovery picks candidate ports out of the system list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    /// Substring match on the USB manufacturer string.
    Manufacturer(String),
    /// Exact USB vendor/product id match.
    UsbId { vid: u16, pid: u16 },
    /// USB vendor/product id match plus a device id the firmware must echo
    /// in its handshake (shared-transport firmwares).
    UsbDevice { vid: u16, pid: u16, device_id: u8 },
}

impl PortSelector {
    pub fn expected_device_id(&self) -> Option<u8> {
        match self {
            PortSelector::UsbDevice { device_id, .. } => Some(*device_id),
            _ => None,
        }
    }
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::Manufacturer(m) => write!(f, "manufacturer contains '{}'", m),
            PortSelector::UsbId { vid, pid } => write!(f, "usb {:04x}:{:04x}", vid, pid),
            PortSelector::UsbDevice { vid, pid, device_id } => {
                write!(f, "usb {:04x}:{:04x} device id {}", vid, pid, device_id)
            }
        }
    }
}

/// One framed request/response channel to a fluidic firmware.
///
/// Owns a single reference on the underlying shared port; the reference is
/// released exactly once, on `close()` or drop.
pub struct PacketStream {
    handle: PortHandle,
    device_id: Option<u8>,
}

impl PacketStream {
    /// Scan system serial ports matching `selector` and return a stream on
    /// the first one that completes the handshake.
    pub fn discover(
        registry: &Arc<PortRegistry>,
        selector: &PortSelector,
        timeout: Duration,
    ) -> Result<Self> {
        let candidates = candidate_ports(selector)?;
        for name in &candidates {
            let handle = match registry.acquire(name, &OpenParams::new(HANDSHAKE_BAUD, timeout)) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!("Skipping candidate '{}': {}", name, e);
                    continue;
                }
            };
            match Self::probe(handle, selector.expected_device_id()) {
                Ok(stream) => {
                    info!("Found device for [{}] on '{}'", selector, name);
                    return Ok(stream);
                }
                Err(e) => debug!("Rejecting candidate '{}': {}", name, e),
            }
        }
        Err(FluidicError::DeviceNotFound(selector.to_string()))
    }

    /// Perform the handshake on an already-acquired port.
    ///
    /// On failure the handle is dropped, releasing its port reference.
    pub fn probe(handle: PortHandle, expected_id: Option<u8>) -> Result<Self> {
        handle.reset_input_buffer()?;
        handle.write(&frame::encode(&[0x00]))?;
        let response = frame::decode_from(|n| handle.read_exact(n))?;

        let accepted = match expected_id {
            None => response == [0x00],
            Some(id) => response == [0x00, id],
        };
        if !accepted {
            return Err(FluidicError::Protocol(format!(
                "unexpected handshake response {:02x?}",
                response
            )));
        }

        let device_id = response.get(1).copied();
        Ok(Self { handle, device_id })
    }

    /// Device id echoed during the handshake, if the firmware reported one.
    pub fn device_id(&self) -> Option<u8> {
        self.device_id
    }

    pub fn port_name(&self) -> &str {
        self.handle.name()
    }

    /// Frame and transmit one payload.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        self.handle.write(&frame::encode(payload))
    }

    /// Block until one complete frame is decoded.
    ///
    /// Each length-directed read is bounded by the port's per-read timeout;
    /// fewer bytes than requested within that window raises
    /// [`FluidicError::Timeout`]. On frame corruption the stream has been
    /// resynchronized to the next delimiter before the error returns.
    pub fn read(&self) -> Result<Vec<u8>> {
        frame::decode_from(|n| self.handle.read_exact(n))
    }

    /// Release the underlying port reference. Safe to call repeatedly;
    /// dropping the stream has the same effect.
    pub fn close(&mut self) {
        self.handle.close();
    }
}

/// Enumerate system serial ports matching `selector`.
fn candidate_ports(selector: &PortSelector) -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    let mut names = Vec::new();
    for port in ports {
        let serialport::SerialPortType::UsbPort(ref usb) = port.port_type else {
            continue;
        };
        let matches = match selector {
            PortSelector::Manufacturer(m) => usb
                .manufacturer
                .as_deref()
                .is_some_and(|s| s.contains(m.as_str())),
            PortSelector::UsbId { vid, pid }
            | PortSelector::UsbDevice { vid, pid, .. } => usb.vid == *vid && usb.pid == *pid,
        };
        if matches {
            names.push(port.port_name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::registry::SerialConnection;
    use std::collections::VecDeque;

    struct FakeConn {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl SerialConnection for FakeConn {
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.tx.extend_from_slice(data);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn clear_input(&mut self) -> Result<()> {
            // The fake's rx queue is the device's pending reply, not stale
            // input, so discovery's buffer reset must leave it alone.
            Ok(())
        }
    }

    fn handle_with_response(
        registry: &Arc<PortRegistry>,
        name: &str,
        response: &[u8],
    ) -> PortHandle {
        let rx: VecDeque<u8> = frame::encode(response).into_iter().collect();
        registry
            .acquire_with(name, Duration::from_millis(20), move || {
                Ok(Box::new(FakeConn { rx, tx: Vec::new() }) as Box<dyn SerialConnection>)
            })
            .unwrap()
    }

    #[test]
    fn test_probe_accepts_single_device_handshake() {
        let registry = PortRegistry::new();
        let handle = handle_with_response(&registry, "COM5", &[0x00]);
        let stream = PacketStream::probe(handle, None).unwrap();
        assert_eq!(stream.device_id(), None);
        assert_eq!(stream.port_name(), "COM5");
    }

    #[test]
    fn test_probe_accepts_expected_device_id() {
        let registry = PortRegistry::new();
        let handle = handle_with_response(&registry, "COM5", &[0x00, 0x01]);
        let stream = PacketStream::probe(handle, Some(1)).unwrap();
        assert_eq!(stream.device_id(), Some(1));
    }

    #[test]
    fn test_probe_rejects_wrong_device_id_and_releases_port() {
        let registry = PortRegistry::new();
        let handle = handle_with_response(&registry, "COM5", &[0x00, 0x02]);
        assert!(PacketStream::probe(handle, Some(1)).is_err());
        // The rejected candidate's reference must be gone.
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_probe_rejects_garbage_handshake() {
        let registry = PortRegistry::new();
        let handle = handle_with_response(&registry, "COM5", &[0x07]);
        assert!(PacketStream::probe(handle, None).is_err());
    }

    #[test]
    fn test_probe_times_out_on_silent_device() {
        let registry = PortRegistry::new();
        let handle = registry
            .acquire_with("COM6", Duration::from_millis(10), || {
                Ok(Box::new(FakeConn {
                    rx: VecDeque::new(),
                    tx: Vec::new(),
                }) as Box<dyn SerialConnection>)
            })
            .unwrap();
        match PacketStream::probe(handle, None) {
            Err(FluidicError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_round_trip_through_stream() {
        let registry = PortRegistry::new();
        let mut seed = frame::encode(&[0x00]);
        seed.extend(frame::encode(&[0x01, 0xAB, 0x00, 0xCD]));
        let rx: VecDeque<u8> = seed.into_iter().collect();
        let handle = registry
            .acquire_with("COM8", Duration::from_millis(20), move || {
                Ok(Box::new(FakeConn { rx, tx: Vec::new() }) as Box<dyn SerialConnection>)
            })
            .unwrap();
        let stream = PacketStream::probe(handle, None).unwrap();
        stream.write(&[0x42]).unwrap();
        assert_eq!(stream.read().unwrap(), vec![0x01, 0xAB, 0x00, 0xCD]);
    }

    #[test]
    fn test_selector_display_names_expected_shape() {
        let sel = PortSelector::UsbDevice {
            vid: 0x303A,
            pid: 0x1001,
            device_id: 1,
        };
        assert_eq!(sel.to_string(), "usb 303a:1001 device id 1");
        assert_eq!(sel.expected_device_id(), Some(1));
    }
}
