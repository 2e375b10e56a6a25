//! Valve hardware and the multiplexing layers above it.

pub mod bank;
pub mod chip;
pub mod modbus;
pub mod mux;

pub use bank::{
    shared, CoilPolarity, MemoryBank, ModbusValveBank, RelayBank, SharedBank, ValveBank,
    ValveState,
};
pub use chip::{Chip, Path};
pub use modbus::ModbusTcpClient;
pub use mux::{TreeValves, Valves, STATE_CLOSED, STATE_INVALID, STATE_OPEN};
