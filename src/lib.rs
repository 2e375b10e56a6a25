//! Device-communication stack for microfluidic lab hardware.
//!
//! This library talks to the fluidic instruments of an imaging rig: framed
//! serial firmwares (pump/flow-sensor controllers and the sipper's combined
//! CNC/valve/pump board) and a network valve bank multiplexed into named
//! flow paths on a chip.

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod valves;

pub use error::{FluidicError, Result};
