//! Well-plate sipper: a CNC gantry, a waste valve with an in-line bubble
//! sensor, and a piezo pump, each behind its own serial link to a legacy
//! firmware family.
//!
//! Protocol overview (little-endian fields, unframed):
//! - CNC link: `[0x00]` home, `[0x01][x:u32][y:u32][z:u32]` move,
//!   `[0x03]` position query returning three u32 step counts
//! - valve link: `[0x00]` close, `[0x01]` open, `[0x02]` sensor query
//!   returning `[flow:f32][temp:f32][flags:u16]` (bit 0 = air at sensor)
//! - pump link: `[frequency:u16][voltage:u8]`
//!
//! Every request is answered first by one ack byte; zero means success and
//! anything else is followed by a zero-terminated ASCII error message.
//!
//! Positions are stored in native step units and converted to millimeters
//! with a fixed steps-per-millimeter constant. A position write blocks until
//! the read-back position equals the commanded target exactly; that is this
//! firmware's definition of motion complete. Neither the motion poll nor the
//! sip air-detection poll imposes its own overall timeout: bounding a stuck
//! device is deliberately left to the caller.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use regex::Regex;

use crate::error::{FluidicError, Result};
use crate::transport::{OpenParams, PortHandle, PortRegistry};

/// Leadscrew conversion: 200 full steps x 16 microsteps per 8 mm pitch.
pub const STEPS_PER_MM: f64 = 400.0;

/// Pump drive used for sustained flow.
pub const FLOW_FREQUENCY: u16 = 200;
pub const FLOW_VOLTAGE: u8 = 250;

const CNC_HOME: u8 = 0x00;
const CNC_MOVE: u8 = 0x01;
const CNC_GET_POSITION: u8 = 0x03;

const VALVE_CLOSE: u8 = 0x00;
const VALVE_OPEN: u8 = 0x01;
const VALVE_SENSOR_INFO: u8 = 0x02;

const ACK_OK: u8 = 0x00;

/// Read-back poll interval for motion and air detection.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pause before resetting a link after a failed transaction, so a firmware
/// still talking finishes before the buffer clear.
const RECOVERY_DELAY: Duration = Duration::from_millis(200);

/// Settling time after opening the USB serial adapters.
const STARTUP_DELAY: Duration = Duration::from_millis(200);

/// Geometry of a rectangular well plate, anchored at two reference wells.
///
/// `a1` is the physical position of well A1 in millimeters; `far_corner` is
/// the position of the last well (highest row letter, highest column). All
/// other wells are placed by linear interpolation, which also handles
/// plates mounted with either axis inverted.
#[derive(Debug, Clone)]
pub struct PlateMap {
    pub rows: usize,
    pub cols: usize,
    pub a1: (f64, f64),
    pub far_corner: (f64, f64),
}

impl PlateMap {
    pub fn new(rows: usize, cols: usize, a1: (f64, f64), far_corner: (f64, f64)) -> Result<Self> {
        if rows == 0 || rows > 26 || cols == 0 {
            return Err(FluidicError::Configuration(format!(
                "invalid plate dimensions {}x{}",
                rows, cols
            )));
        }
        // A degenerate corner pair would make the pitch zero and the
        // inverse transform divide by it.
        if (cols > 1 && far_corner.0 == a1.0) || (rows > 1 && far_corner.1 == a1.1) {
            return Err(FluidicError::Configuration(format!(
                "reference wells {:?} and {:?} must be separated on every multi-well axis",
                a1, far_corner
            )));
        }
        Ok(Self {
            rows,
            cols,
            a1,
            far_corner,
        })
    }

    /// Parse a well label like `"A1"` into 0-indexed (row, column).
    pub fn parse(&self, label: &str) -> Result<(usize, usize)> {
        static WELL_RE: OnceLock<Regex> = OnceLock::new();
        let re = WELL_RE.get_or_init(|| {
            #[allow(clippy::unwrap_used)]
            Regex::new(r"^([A-Za-z])([0-9]+)$").unwrap()
        });
        let caps = re
            .captures(label)
            .ok_or_else(|| FluidicError::InvalidWell(label.to_string()))?;
        let row = (caps[1].to_ascii_uppercase().as_bytes()[0] - b'A') as usize;
        let col = caps[2]
            .parse::<usize>()
            .ok()
            .and_then(|c| c.checked_sub(1))
            .ok_or_else(|| FluidicError::InvalidWell(label.to_string()))?;
        if row >= self.rows || col >= self.cols {
            return Err(FluidicError::InvalidWell(label.to_string()));
        }
        Ok((row, col))
    }

    fn pitch(&self) -> (f64, f64) {
        let px = if self.cols > 1 {
            (self.far_corner.0 - self.a1.0) / (self.cols - 1) as f64
        } else {
            0.0
        };
        let py = if self.rows > 1 {
            (self.far_corner.1 - self.a1.1) / (self.rows - 1) as f64
        } else {
            0.0
        };
        (px, py)
    }

    /// Physical (x, y) of a well in millimeters.
    pub fn well_to_mm(&self, label: &str) -> Result<(f64, f64)> {
        let (row, col) = self.parse(label)?;
        let (px, py) = self.pitch();
        Ok((
            self.a1.0 + col as f64 * px,
            self.a1.1 + row as f64 * py,
        ))
    }

    /// Nearest well label for a physical position, or `None` when the
    /// position rounds outside the grid.
    pub fn nearest_well(&self, x: f64, y: f64) -> Option<String> {
        let (px, py) = self.pitch();
        let col = if self.cols > 1 {
            ((x - self.a1.0) / px).round()
        } else {
            0.0
        };
        let row = if self.rows > 1 {
            ((y - self.a1.1) / py).round()
        } else {
            0.0
        };
        if col < 0.0 || row < 0.0 || col as usize >= self.cols || row as usize >= self.rows {
            return None;
        }
        Some(format!("{}{}", (b'A' + row as u8) as char, col as usize + 1))
    }
}

/// Connection and geometry settings for a [`Sipper`].
#[derive(Debug, Clone)]
pub struct SipperConfig {
    pub cnc_port: String,
    pub valve_port: String,
    pub pump_port: String,
    pub baud_rate: u32,
    pub cnc_timeout: Duration,
    pub io_timeout: Duration,
    pub plate: PlateMap,
    /// Probe-down height in millimeters.
    pub z_bottom: f64,
    /// Per-axis travel limits in steps.
    pub max_steps: [u32; 3],
    /// Optional logical-name -> plate-label aliases (e.g. "waste" -> "H12").
    pub aliases: HashMap<String, String>,
    /// Blocking settle time after air is detected during a sip.
    pub flush_delay: Duration,
}

impl Default for SipperConfig {
    fn default() -> Self {
        Self {
            cnc_port: String::new(),
            valve_port: String::new(),
            pump_port: String::new(),
            baud_rate: 9600,
            cnc_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(1),
            // Standard 96-well plate, 9 mm pitch, A1 at the gantry origin.
            plate: PlateMap {
                rows: 8,
                cols: 12,
                a1: (0.0, 0.0),
                far_corner: (99.0, 63.0),
            },
            z_bottom: 5.0,
            max_steps: [7500, 6000, 3000],
            aliases: HashMap::new(),
            flush_delay: Duration::from_secs(2),
        }
    }
}

/// Phases of the liquid-sipping sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipPhase {
    Idle,
    PurgingToWaste,
    Sipping,
    AirDetected,
    Flushing,
    Ready,
}

/// One reading of the sipper's in-line sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SipperSensor {
    pub flow_ul_per_min: f32,
    pub degrees_c: f32,
    pub flags: u16,
}

impl SipperSensor {
    /// Air bubble currently at the sensor.
    pub fn air(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// The combined gantry + valve + pump device.
pub struct Sipper {
    name: String,
    cnc: PortHandle,
    valve: PortHandle,
    pump: PortHandle,
    plate: PlateMap,
    z_bottom: f64,
    max_steps: [u32; 3],
    aliases: HashMap<String, String>,
    flush_delay: Duration,
    xyz: [u32; 3],
    valve_open: bool,
    frequency: u16,
    voltage: u8,
    well: Option<String>,
    phase: SipPhase,
}

impl Sipper {
    /// Open the three configured ports through the shared registry and home
    /// the gantry.
    pub fn connect(
        name: impl Into<String>,
        registry: &Arc<PortRegistry>,
        config: SipperConfig,
    ) -> Result<Self> {
        let cnc = registry.acquire(
            &config.cnc_port,
            &OpenParams::new(config.baud_rate, config.cnc_timeout),
        )?;
        let valve = registry.acquire(
            &config.valve_port,
            &OpenParams::new(config.baud_rate, config.io_timeout),
        )?;
        let pump = registry.acquire(
            &config.pump_port,
            &OpenParams::new(config.baud_rate, config.io_timeout),
        )?;
        Self::with_handles(name, config, cnc, valve, pump)
    }

    /// Build over already-acquired handles. This is the seam used by tests
    /// and by callers that manage port acquisition themselves.
    pub fn with_handles(
        name: impl Into<String>,
        config: SipperConfig,
        cnc: PortHandle,
        valve: PortHandle,
        pump: PortHandle,
    ) -> Result<Self> {
        let plate = PlateMap::new(
            config.plate.rows,
            config.plate.cols,
            config.plate.a1,
            config.plate.far_corner,
        )?;
        if config.z_bottom < 0.0 || mm_to_steps(config.z_bottom) > config.max_steps[2] {
            return Err(FluidicError::Configuration(format!(
                "z_bottom {} mm outside axis travel",
                config.z_bottom
            )));
        }

        let mut sipper = Self {
            name: name.into(),
            cnc,
            valve,
            pump,
            plate,
            z_bottom: config.z_bottom,
            max_steps: config.max_steps,
            aliases: config.aliases,
            flush_delay: config.flush_delay,
            xyz: [0; 3],
            valve_open: false,
            frequency: 0,
            voltage: 0,
            well: None,
            phase: SipPhase::Idle,
        };

        thread::sleep(STARTUP_DELAY);
        sipper.cnc.reset_input_buffer()?;
        sipper.valve.reset_input_buffer()?;
        sipper.pump.reset_input_buffer()?;
        sipper.home()?;
        Ok(sipper)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> SipPhase {
        self.phase
    }

    pub fn plate(&self) -> &PlateMap {
        &self.plate
    }

    // --- motion -----------------------------------------------------------

    /// Current position in steps, read back from the firmware.
    pub fn position_steps(&self) -> Result<[u32; 3]> {
        atomic(&self.cnc, || {
            self.cnc.write(&[CNC_GET_POSITION])?;
            ack(&self.cnc)?;
            let raw = self.cnc.read_exact(12)?;
            Ok([
                LittleEndian::read_u32(&raw[0..4]),
                LittleEndian::read_u32(&raw[4..8]),
                LittleEndian::read_u32(&raw[8..12]),
            ])
        })
    }

    /// Current position in millimeters.
    pub fn position_mm(&self) -> Result<[f64; 3]> {
        let steps = self.position_steps()?;
        Ok([
            steps_to_mm(steps[0]),
            steps_to_mm(steps[1]),
            steps_to_mm(steps[2]),
        ])
    }

    /// Command an absolute move in steps and block until the read-back
    /// position equals the target exactly.
    ///
    /// The poll has no overall timeout: each position read is bounded by the
    /// port's per-read window, but a firmware that never reaches the target
    /// blocks this call indefinitely. Bounding that is the caller's job.
    pub fn move_to_steps(&mut self, target: [u32; 3]) -> Result<()> {
        for (axis, (&t, &max)) in target.iter().zip(self.max_steps.iter()).enumerate() {
            if t > max {
                return Err(FluidicError::Configuration(format!(
                    "axis {} target {} exceeds travel limit {}",
                    axis, t, max
                )));
            }
        }

        atomic(&self.cnc, || {
            let mut request = [0u8; 13];
            request[0] = CNC_MOVE;
            LittleEndian::write_u32(&mut request[1..5], target[0]);
            LittleEndian::write_u32(&mut request[5..9], target[1]);
            LittleEndian::write_u32(&mut request[9..13], target[2]);
            self.cnc.write(&request)?;
            ack(&self.cnc)
        })?;

        while self.position_steps()? != target {
            thread::sleep(POLL_INTERVAL);
        }
        self.xyz = target;
        debug!("[{}] at {:?} steps", self.name, target);
        Ok(())
    }

    /// Command an absolute move in millimeters.
    pub fn move_to_mm(&mut self, x: f64, y: f64, z: f64) -> Result<()> {
        self.move_to_steps([mm_to_steps(x), mm_to_steps(y), mm_to_steps(z)])
    }

    /// Home all axes and clear the cached well.
    pub fn home(&mut self) -> Result<()> {
        self.well = None;
        self.pause()?;
        atomic(&self.cnc, || {
            self.cnc.write(&[CNC_HOME])?;
            ack(&self.cnc)
        })?;
        self.xyz = [0; 3];
        info!("[{}] homed", self.name);
        Ok(())
    }

    // --- well addressing --------------------------------------------------

    /// Seat the probe in a well: raise Z, travel in XY, then lower Z only
    /// after arrival, so the probe never drags across the plate.
    pub fn set_well(&mut self, well: &str) -> Result<()> {
        let label = self
            .aliases
            .get(well)
            .cloned()
            .unwrap_or_else(|| well.to_string());
        let (x, y) = self.plate.well_to_mm(&label)?;

        let here = self.position_mm()?;
        self.move_to_mm(here[0], here[1], 0.0)?;
        self.move_to_mm(x, y, 0.0)?;
        self.move_to_mm(x, y, self.z_bottom)?;
        self.well = Some(label.clone());
        info!("[{}] seated in well {}", self.name, label);
        Ok(())
    }

    /// Raise the probe out of the plate.
    pub fn retract(&mut self) -> Result<()> {
        let here = self.position_mm()?;
        self.move_to_mm(here[0], here[1], 0.0)?;
        self.well = None;
        Ok(())
    }

    /// Nearest well for the current position, or `None` when the probe is
    /// raised or the position is outside the grid.
    pub fn current_well(&self) -> Result<Option<String>> {
        let steps = self.position_steps()?;
        if steps[2] != mm_to_steps(self.z_bottom) {
            return Ok(None);
        }
        Ok(self
            .plate
            .nearest_well(steps_to_mm(steps[0]), steps_to_mm(steps[1])))
    }

    // --- valve / sensor / pump -------------------------------------------

    /// Open or close the waste-path valve.
    pub fn set_valve(&mut self, open: bool) -> Result<()> {
        atomic(&self.valve, || {
            self.valve.write(&[if open { VALVE_OPEN } else { VALVE_CLOSE }])?;
            ack(&self.valve)
        })?;
        self.valve_open = open;
        Ok(())
    }

    /// Last commanded valve state.
    pub fn valve_is_open(&self) -> bool {
        self.valve_open
    }

    pub fn sensor_info(&self) -> Result<SipperSensor> {
        atomic(&self.valve, || {
            self.valve.write(&[VALVE_SENSOR_INFO])?;
            ack(&self.valve)?;
            let raw = self.valve.read_exact(10)?;
            Ok(SipperSensor {
                flow_ul_per_min: LittleEndian::read_f32(&raw[0..4]),
                degrees_c: LittleEndian::read_f32(&raw[4..8]),
                flags: LittleEndian::read_u16(&raw[8..10]),
            })
        })
    }

    pub fn air(&self) -> Result<bool> {
        Ok(self.sensor_info()?.air())
    }

    pub fn flow_rate(&self) -> Result<f32> {
        Ok(self.sensor_info()?.flow_ul_per_min)
    }

    pub fn temperature(&self) -> Result<f32> {
        Ok(self.sensor_info()?.degrees_c)
    }

    /// Drive the pump. Frequency in Hz, voltage in volts peak.
    pub fn set_pump(&mut self, voltage: u8, frequency: u16) -> Result<()> {
        atomic(&self.pump, || {
            let mut request = [0u8; 3];
            LittleEndian::write_u16(&mut request[0..2], frequency);
            request[2] = voltage;
            self.pump.write(&request)?;
            ack(&self.pump)
        })?;
        self.voltage = voltage;
        self.frequency = frequency;
        Ok(())
    }

    pub fn set_voltage(&mut self, voltage: u8) -> Result<()> {
        let frequency = self.frequency;
        self.set_pump(voltage, frequency)
    }

    pub fn set_frequency(&mut self, frequency: u16) -> Result<()> {
        let voltage = self.voltage;
        self.set_pump(voltage, frequency)
    }

    pub fn voltage(&self) -> u8 {
        self.voltage
    }

    pub fn frequency(&self) -> u16 {
        self.frequency
    }

    /// Stop the pump.
    pub fn pause(&mut self) -> Result<()> {
        self.set_pump(0, 0)
    }

    // --- sequences --------------------------------------------------------

    /// Flow from `well` into the system (waste path closed).
    pub fn flow(&mut self, well: &str) -> Result<()> {
        self.pause()?;
        self.set_well(well)?;
        self.set_valve(false)?;
        self.set_pump(FLOW_VOLTAGE, FLOW_FREQUENCY)
    }

    /// Purge from `well` straight to waste (waste path open).
    pub fn purge(&mut self, well: &str) -> Result<()> {
        self.pause()?;
        self.set_well(well)?;
        self.set_valve(true)?;
        self.set_pump(FLOW_VOLTAGE, FLOW_FREQUENCY)
    }

    /// Sip from `well`: purge to waste until the air bubble reaches the
    /// sensor, then flush and stop.
    ///
    /// The air-detection poll is unbounded by design; if the sensor never
    /// reports air this call blocks until the caller intervenes. Each
    /// individual sensor read is still bounded by the port's read timeout.
    pub fn sip(&mut self, well: &str) -> Result<()> {
        self.run_sip(well, false)
    }

    /// Sip variant for lines that still hold liquid from a previous draw:
    /// waits for the air slug to arrive *and* pass the sensor
    /// (false -> true -> false) before flushing.
    pub fn sip_after_liquid(&mut self, well: &str) -> Result<()> {
        self.run_sip(well, true)
    }

    fn run_sip(&mut self, well: &str, prior_liquid: bool) -> Result<()> {
        let result = self.sip_sequence(well, prior_liquid);
        if result.is_err() {
            // A later phase() read must not report the aborted step.
            self.phase = SipPhase::Idle;
        }
        result
    }

    fn sip_sequence(&mut self, well: &str, prior_liquid: bool) -> Result<()> {
        self.phase = SipPhase::PurgingToWaste;
        info!("[{}] sip: purging to waste", self.name);
        self.pause()?;
        self.set_valve(true)?;
        self.set_well(well)?;
        self.set_pump(FLOW_VOLTAGE, FLOW_FREQUENCY)?;

        self.phase = SipPhase::Sipping;
        if prior_liquid {
            // The flag may already read true from the previous draw's
            // trailing air; wait for liquid first so the slug edge is real.
            while self.air()? {
                thread::sleep(POLL_INTERVAL);
            }
        }
        while !self.air()? {
            thread::sleep(POLL_INTERVAL);
        }
        self.phase = SipPhase::AirDetected;
        info!("[{}] sip: air detected", self.name);
        if prior_liquid {
            while self.air()? {
                thread::sleep(POLL_INTERVAL);
            }
        }

        self.phase = SipPhase::Flushing;
        thread::sleep(self.flush_delay);
        self.set_valve(false)?;
        self.pause()?;
        self.phase = SipPhase::Ready;
        info!("[{}] sip: ready", self.name);
        Ok(())
    }
}

/// Convert millimeters to the nearest whole step.
pub fn mm_to_steps(mm: f64) -> u32 {
    (mm * STEPS_PER_MM).round().max(0.0) as u32
}

/// Convert a step count to millimeters.
pub fn steps_to_mm(steps: u32) -> f64 {
    steps as f64 / STEPS_PER_MM
}

/// Read one ack byte; a nonzero ack is followed by a zero-terminated ASCII
/// error message which becomes the error detail.
fn ack(handle: &PortHandle) -> Result<()> {
    let ack = handle.read_exact(1)?[0];
    if ack == ACK_OK {
        return Ok(());
    }
    Err(FluidicError::Device(read_error_string(handle)?))
}

fn read_error_string(handle: &PortHandle) -> Result<String> {
    let mut out = Vec::new();
    loop {
        match handle.read_exact(1) {
            Ok(byte) if byte[0] == 0 => break,
            Ok(byte) => out.push(byte[0]),
            // A firmware that stops mid-message still yields what it sent.
            Err(FluidicError::Timeout) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Run one transaction; on failure, give the firmware time to finish
/// talking and clear the link so the next transaction starts clean.
fn atomic<T>(handle: &PortHandle, op: impl FnOnce() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(e) => {
            thread::sleep(RECOVERY_DELAY);
            let _ = handle.reset_input_buffer();
            Err(e)
        }
    }
}
