//! Custom error types for the fluidic stack.
//!
//! This module defines the primary error type, `FluidicError`, used across the
//! transport, protocol, and valve layers. Using the `thiserror` crate, it
//! provides a centralized taxonomy matching what the hardware can actually do
//! to us:
//!
//! - **Transport timeouts** are fatal for the in-flight operation and are
//!   never retried internally.
//! - **Frame corruption** means the decoder hit a delimiter where none was
//!   expected; the stream has been resynchronized to the next frame boundary
//!   by the time the error reaches the caller.
//! - **Device failure** is the firmware's FAIL opcode (0xFF) and is raised
//!   regardless of which command was in flight.
//! - **Protocol mismatch** (response opcode != request opcode) indicates a
//!   desynced firmware or transport and is likewise never retried here.
//! - **Configuration errors** surface immediately at the call that supplied
//!   the bad input (well labels, valve indices, tree patterns, selectors).
//!
//! Any retry policy belongs to a calling orchestrator, not this layer.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, FluidicError>;

#[derive(Error, Debug)]
pub enum FluidicError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Read timed out before the requested bytes arrived")]
    Timeout,

    #[error("Frame corrupted: unexpected delimiter inside frame data")]
    FrameCorruption,

    #[error("Device reported failure (FAIL opcode)")]
    DeviceFailure,

    #[error("Unexpected response opcode: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedResponse { expected: u8, got: u8 },

    #[error("No device matched selector: {0}")]
    DeviceNotFound(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Modbus exception {exception:#04x} for function {function:#04x}")]
    ModbusException { function: u8, exception: u8 },

    #[error("Valve index {index} out of range for a bank of {len} valves")]
    ValveIndex { index: usize, len: usize },

    #[error("Unknown valve path '{0}'")]
    UnknownPath(String),

    #[error("Unknown tree state label '{0}'")]
    UnknownLabel(String),

    #[error("Invalid well label '{0}'")]
    InvalidWell(String),
}
