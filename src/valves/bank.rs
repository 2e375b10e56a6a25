//! Valve bank drivers.
//!
//! A bank is an indexed set of boolean-addressable valves. Two backends
//! exist: a network coil bank spoken to over Modbus-TCP, and a local relay
//! bank behind the framed serial protocol. Both sit behind the [`ValveBank`]
//! trait so the multiplexing layer does not care which one it drives.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::error::{FluidicError, Result};
use crate::protocol::{transact, FramedLink};
use crate::valves::modbus::ModbusTcpClient;

/// State of one valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveState {
    Open,
    Closed,
}

impl ValveState {
    pub fn is_open(self) -> bool {
        self == ValveState::Open
    }

    pub fn from_open(open: bool) -> Self {
        if open {
            ValveState::Open
        } else {
            ValveState::Closed
        }
    }
}

impl fmt::Display for ValveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveState::Open => write!(f, "open"),
            ValveState::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for ValveState {
    type Err = FluidicError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ValveState::Open),
            "closed" => Ok(ValveState::Closed),
            other => Err(FluidicError::Configuration(format!(
                "'{}' is not a valve state (expected 'open' or 'closed')",
                other
            ))),
        }
    }
}

/// An indexed bank of boolean valves.
pub trait ValveBank: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&mut self, index: usize) -> Result<ValveState>;

    fn write(&mut self, index: usize, state: ValveState) -> Result<()>;

    /// Read the whole bank in index order.
    fn states(&mut self) -> Result<Vec<ValveState>> {
        (0..self.len()).map(|i| self.read(i)).collect()
    }
}

/// Shared handle used by the multiplexing layer: several logical valve
/// groups address the same physical bank.
pub type SharedBank = Arc<Mutex<dyn ValveBank>>;

pub fn shared(bank: impl ValveBank + 'static) -> SharedBank {
    Arc::new(Mutex::new(bank))
}

pub(crate) fn lock_bank(bank: &SharedBank) -> std::sync::MutexGuard<'_, dyn ValveBank + 'static> {
    bank.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(FluidicError::ValveIndex { index, len });
    }
    Ok(())
}

/// Which coil value means "open" on this wiring.
///
/// Some banks wire coil 1 to the de-energized (closed-equivalent) state, so
/// the mapping is explicit rather than assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoilPolarity {
    /// Coil value 1 energizes the valve open (factory default wiring).
    #[default]
    EnergizedOpen,
    /// Coil value 1 is the de-energized/closed-equivalent state.
    EnergizedClosed,
}

impl CoilPolarity {
    fn to_state(self, coil: bool) -> ValveState {
        match self {
            CoilPolarity::EnergizedOpen => ValveState::from_open(coil),
            CoilPolarity::EnergizedClosed => ValveState::from_open(!coil),
        }
    }

    fn to_coil(self, state: ValveState) -> bool {
        match self {
            CoilPolarity::EnergizedOpen => state.is_open(),
            CoilPolarity::EnergizedClosed => !state.is_open(),
        }
    }
}

/// Coil address offset for reads: the bank's status coils live in a
/// separate block above the command coils.
pub const COIL_READ_BASE: u16 = 512;

/// Network-addressed valve bank over Modbus-TCP coils.
///
/// Per the device's register map, valve `i` is *read* at coil
/// `i + COIL_READ_BASE` and *written* at coil `i`.
pub struct ModbusValveBank {
    client: ModbusTcpClient,
    num_valves: usize,
    polarity: CoilPolarity,
}

impl ModbusValveBank {
    pub const DEFAULT_NUM_VALVES: usize = 48;

    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        Ok(Self::over(
            ModbusTcpClient::connect(addr, timeout)?,
            Self::DEFAULT_NUM_VALVES,
            CoilPolarity::default(),
        ))
    }

    pub fn over(client: ModbusTcpClient, num_valves: usize, polarity: CoilPolarity) -> Self {
        Self {
            client,
            num_valves,
            polarity,
        }
    }
}

impl ValveBank for ModbusValveBank {
    fn len(&self) -> usize {
        self.num_valves
    }

    fn read(&mut self, index: usize) -> Result<ValveState> {
        check_index(index, self.num_valves)?;
        let coil = self
            .client
            .read_coils(index as u16 + COIL_READ_BASE, 1)?
            .first()
            .copied()
            .ok_or_else(|| FluidicError::Protocol("empty coil read".to_string()))?;
        Ok(self.polarity.to_state(coil))
    }

    fn write(&mut self, index: usize, state: ValveState) -> Result<()> {
        check_index(index, self.num_valves)?;
        self.client
            .write_single_coil(index as u16, self.polarity.to_coil(state))?;
        debug!("valve {} -> {}", index, state);
        Ok(())
    }
}

/// Opcodes of the relay firmware on the framed serial protocol
/// (handshake device id 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayOpcode {
    GetValve = 0x03,
    SetValve = 0x04,
}

/// Local relay bank behind a framed serial link.
pub struct RelayBank<L: FramedLink> {
    link: L,
    num_valves: usize,
}

impl<L: FramedLink> RelayBank<L> {
    /// The wire format carries the valve index in one byte.
    pub const MAX_VALVES: usize = 256;

    pub fn over(link: L, num_valves: usize) -> Result<Self> {
        if num_valves > Self::MAX_VALVES {
            return Err(FluidicError::Configuration(format!(
                "{} valves exceeds the relay protocol's {}-valve address space",
                num_valves,
                Self::MAX_VALVES
            )));
        }
        Ok(Self { link, num_valves })
    }
}

impl<L: FramedLink> ValveBank for RelayBank<L> {
    fn len(&self) -> usize {
        self.num_valves
    }

    fn read(&mut self, index: usize) -> Result<ValveState> {
        check_index(index, self.num_valves)?;
        let payload = transact(&mut self.link, RelayOpcode::GetValve as u8, &[index as u8])?;
        match payload.as_slice() {
            [state] => Ok(ValveState::from_open(*state != 0)),
            _ => Err(FluidicError::Protocol(format!(
                "GET_VALVE returned {} payload bytes, expected 1",
                payload.len()
            ))),
        }
    }

    fn write(&mut self, index: usize, state: ValveState) -> Result<()> {
        check_index(index, self.num_valves)?;
        let payload = transact(
            &mut self.link,
            RelayOpcode::SetValve as u8,
            &[index as u8, state.is_open() as u8],
        )?;
        if !payload.is_empty() {
            return Err(FluidicError::Protocol(format!(
                "SET_VALVE echoed {} unexpected payload bytes",
                payload.len()
            )));
        }
        Ok(())
    }
}

/// In-memory bank for tests and dry runs.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    states: Vec<ValveState>,
}

impl MemoryBank {
    pub fn closed(len: usize) -> Self {
        Self {
            states: vec![ValveState::Closed; len],
        }
    }
}

impl ValveBank for MemoryBank {
    fn len(&self) -> usize {
        self.states.len()
    }

    fn read(&mut self, index: usize) -> Result<ValveState> {
        check_index(index, self.states.len())?;
        Ok(self.states[index])
    }

    fn write(&mut self, index: usize, state: ValveState) -> Result<()> {
        check_index(index, self.states.len())?;
        self.states[index] = state;
        Ok(())
    }
}
