//! Pump/flow-sensor controller on the framed fluidic firmware family.
//!
//! Protocol overview:
//! - Format: `[opcode][big-endian packed fields]` inside one frame
//! - `0x00` INIT: handshake, handled by discovery
//! - `0x01` FLOW_SENSOR_INFO: no args; returns three flag bytes followed by
//!   two f64 fields (flow in ul/min, temperature in degrees C)
//! - `0x02` SET_PUMP_RPM: one f64 argument; echo with no payload
//! - `0x03` GET_PUMP_RPM: no args; returns one f64
//! - `0xFF` FAIL: device-side failure, any payload
//!
//! Pump speed is signed: a negative rpm reverses the flow direction.

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FluidicError, Result};
use crate::protocol::{transact, FramedLink};
use crate::transport::{PacketStream, PortRegistry, PortSelector};

/// Command opcodes understood by the pump firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Init = 0x00,
    FlowSensorInfo = 0x01,
    SetPumpRpm = 0x02,
    GetPumpRpm = 0x03,
}

/// One reading of the in-line flow sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorInfo {
    /// Air bubble currently at the sensor.
    pub air: bool,
    /// Sensor is in its high-flow range.
    pub high_flow: bool,
    /// Firmware-side exponential smoothing enabled.
    pub exp_smoothing: bool,
    /// Flow rate in microliters per minute.
    pub ul_per_min: f64,
    /// Sensor temperature in degrees Celsius.
    pub degrees_c: f64,
}

/// Peristaltic pump + flow sensor behind one framed link.
pub struct FlowController<L: FramedLink> {
    name: String,
    link: L,
}

impl FlowController<PacketStream> {
    /// Scan for the pump firmware and connect to the first port that
    /// completes the handshake.
    pub fn connect(
        name: impl Into<String>,
        registry: &Arc<PortRegistry>,
        selector: &PortSelector,
        timeout: Duration,
    ) -> Result<Self> {
        let link = PacketStream::discover(registry, selector, timeout)?;
        Ok(Self::over(name, link))
    }
}

impl<L: FramedLink> FlowController<L> {
    /// Build a controller over an already-established link (used by tests
    /// and by callers that performed discovery themselves).
    pub fn over(name: impl Into<String>, link: L) -> Self {
        Self {
            name: name.into(),
            link,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the pump speed in rpm. Sign encodes direction: negative values
    /// run the pump in reverse.
    pub fn set_rpm(&mut self, rpm: f64) -> Result<()> {
        let mut args = [0u8; 8];
        BigEndian::write_f64(&mut args, rpm);
        let payload = transact(&mut self.link, Opcode::SetPumpRpm as u8, &args)?;
        if !payload.is_empty() {
            return Err(FluidicError::Protocol(format!(
                "SET_PUMP_RPM echoed {} unexpected payload bytes",
                payload.len()
            )));
        }
        debug!("[{}] pump rpm set to {}", self.name, rpm);
        Ok(())
    }

    /// Read back the current pump speed in rpm.
    pub fn rpm(&mut self) -> Result<f64> {
        let payload = transact(&mut self.link, Opcode::GetPumpRpm as u8, &[])?;
        if payload.len() != 8 {
            return Err(FluidicError::Protocol(format!(
                "GET_PUMP_RPM payload was {} bytes, expected 8",
                payload.len()
            )));
        }
        Ok(BigEndian::read_f64(&payload))
    }

    /// Read the full sensor record.
    pub fn sensor_info(&mut self) -> Result<SensorInfo> {
        let payload = transact(&mut self.link, Opcode::FlowSensorInfo as u8, &[])?;
        if payload.len() != 19 {
            return Err(FluidicError::Protocol(format!(
                "FLOW_SENSOR_INFO payload was {} bytes, expected 19",
                payload.len()
            )));
        }
        Ok(SensorInfo {
            air: payload[0] != 0,
            high_flow: payload[1] != 0,
            exp_smoothing: payload[2] != 0,
            ul_per_min: BigEndian::read_f64(&payload[3..11]),
            degrees_c: BigEndian::read_f64(&payload[11..19]),
        })
    }

    pub fn air(&mut self) -> Result<bool> {
        Ok(self.sensor_info()?.air)
    }

    pub fn high_flow(&mut self) -> Result<bool> {
        Ok(self.sensor_info()?.high_flow)
    }

    pub fn exp_smoothing(&mut self) -> Result<bool> {
        Ok(self.sensor_info()?.exp_smoothing)
    }

    /// Current flow rate in microliters per minute.
    pub fn flow_rate(&mut self) -> Result<f64> {
        Ok(self.sensor_info()?.ul_per_min)
    }

    /// Sensor temperature in degrees Celsius.
    pub fn temperature(&mut self) -> Result<f64> {
        Ok(self.sensor_info()?.degrees_c)
    }
}
