//! Shared serial-port registry.
//!
//! A physical serial line permits one in-flight operation at a time, but
//! several logical devices may sit behind one connector (e.g. a combined
//! pump+motion firmware). The registry maps port name -> (connection,
//! reference count, lock) so that every consumer of a port shares a single
//! physical connection object.
//!
//! Lock discipline: the registry's own lock guards only the name->entry map
//! (acquire/release bookkeeping); each port additionally owns a dedicated
//! lock serializing all I/O on that port. Handle operations take the port
//! lock for their duration, never the registry lock, so acquiring a handle
//! for port A never blocks I/O in progress on port B.
//!
//! Handles release their reference deterministically on `close()` or on
//! drop; double-close is a no-op.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{FluidicError, Result};

/// Minimal surface a physical connection must provide.
///
/// Implemented for real ports via the `serialport` crate; tests substitute
/// in-memory fakes.
pub trait SerialConnection: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read available bytes into `buf`, waiting at most the connection's
    /// internal poll interval. Returns `Ok(0)` when nothing arrived.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Discard any unread input.
    fn clear_input(&mut self) -> Result<()>;
}

/// Open parameters for a physical port.
///
/// `timeout` is the overall per-read window: an exact-size read that cannot
/// be satisfied within it fails with [`FluidicError::Timeout`].
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl OpenParams {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }
}

struct PortEntry {
    conn: Arc<Mutex<Box<dyn SerialConnection>>>,
    timeout: Duration,
    refcount: usize,
}

/// Process-wide registry of shared serial connections.
///
/// Constructed once and handed to every transport by `Arc`; there is no
/// module-global state.
#[derive(Default)]
pub struct PortRegistry {
    ports: Mutex<HashMap<String, PortEntry>>,
}

impl PortRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire a handle on a physical port, opening it on first use.
    ///
    /// Later acquisitions of the same name share the existing connection;
    /// their `params` are ignored (the first open wins).
    pub fn acquire(self: &Arc<Self>, name: &str, params: &OpenParams) -> Result<PortHandle> {
        let baud = params.baud_rate;
        let port_name = name.to_string();
        self.acquire_with(name, params.timeout, move || {
            let port = serialport::new(&port_name, baud)
                // Short internal poll; the handle loops up to the overall
                // per-read window.
                .timeout(Duration::from_millis(50))
                .open()?;
            debug!("Opened serial port '{}' at {} baud", port_name, baud);
            Ok(Box::new(SystemSerial { port }) as Box<dyn SerialConnection>)
        })
    }

    /// Acquire a handle, opening the connection through `open` if the port
    /// is not already registered. This is the seam used by discovery and by
    /// tests that inject fake connections.
    pub fn acquire_with<F>(self: &Arc<Self>, name: &str, timeout: Duration, open: F) -> Result<PortHandle>
    where
        F: FnOnce() -> Result<Box<dyn SerialConnection>>,
    {
        let mut ports = lock(&self.ports);
        if !ports.contains_key(name) {
            let conn = open()?;
            ports.insert(
                name.to_string(),
                PortEntry {
                    conn: Arc::new(Mutex::new(conn)),
                    timeout,
                    refcount: 0,
                },
            );
        }
        let entry = ports
            .get_mut(name)
            .ok_or_else(|| FluidicError::Configuration(format!("port '{}' vanished", name)))?;
        entry.refcount += 1;
        Ok(PortHandle {
            registry: Arc::clone(self),
            name: name.to_string(),
            conn: Arc::clone(&entry.conn),
            timeout: entry.timeout,
            closed: false,
        })
    }

    fn release(&self, name: &str) {
        let mut ports = lock(&self.ports);
        if let Some(entry) = ports.get_mut(name) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                ports.remove(name);
                debug!("Closed serial port '{}'", name);
            }
        }
    }

    /// Number of physical connections currently open.
    pub fn open_count(&self) -> usize {
        lock(&self.ports).len()
    }

    /// Whether a physical connection exists for `name`.
    pub fn is_open(&self, name: &str) -> bool {
        lock(&self.ports).contains_key(name)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference-counted handle on one shared port.
///
/// Every operation serializes on the port's dedicated lock. The reference
/// is returned exactly once, on `close()` or drop, whichever comes first.
pub struct PortHandle {
    registry: Arc<PortRegistry>,
    name: String,
    conn: Arc<Mutex<Box<dyn SerialConnection>>>,
    timeout: Duration,
    closed: bool,
}

impl PortHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The per-read timeout window configured at open.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        lock(&self.conn).write_all(data)
    }

    /// Read exactly `size` bytes within the per-read window.
    ///
    /// A short read is a fatal [`FluidicError::Timeout`]: the caller must
    /// not continue on a partial frame.
    pub fn read_exact(&self, size: usize) -> Result<Vec<u8>> {
        let mut conn = lock(&self.conn);
        let deadline = Instant::now() + self.timeout;
        let mut out = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = conn.read(&mut out[filled..])?;
            filled += n;
            if filled < size && Instant::now() >= deadline {
                return Err(FluidicError::Timeout);
            }
        }
        Ok(out)
    }

    /// Read bytes up to and including a terminating newline, or until the
    /// per-read window elapses (returning what arrived).
    pub fn read_line(&self) -> Result<Vec<u8>> {
        let mut conn = lock(&self.conn);
        let deadline = Instant::now() + self.timeout;
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = conn.read(&mut byte)?;
            if n == 1 {
                out.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            } else if Instant::now() >= deadline {
                break;
            }
        }
        Ok(out)
    }

    pub fn reset_input_buffer(&self) -> Result<()> {
        lock(&self.conn).clear_input()
    }

    /// Release this handle's reference. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.registry.release(&self.name);
        }
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct SystemSerial {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialConnection for SystemSerial {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => {
                warn!("Serial read error on shared port: {}", e);
                Err(e.into())
            }
        }
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}
