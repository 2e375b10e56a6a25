//! Integration tests for the sipper state machine running against reactive
//! simulated firmwares (CNC gantry, valve/sensor board, piezo pump) behind
//! the shared port registry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use chipflow::protocol::sipper::{mm_to_steps, SipPhase, Sipper, SipperConfig};
use chipflow::transport::{PortHandle, PortRegistry, SerialConnection};
use chipflow::{FluidicError, Result};

const ACK_OK: u8 = 0x00;

/// CNC firmware: tracks position, completes every move instantly.
#[derive(Default)]
struct CncState {
    pos: [u32; 3],
    homes: usize,
}

struct CncFirmware {
    state: Arc<Mutex<CncState>>,
    out: VecDeque<u8>,
}

impl SerialConnection for CncFirmware {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match data {
            [0x00] => {
                state.pos = [0; 3];
                state.homes += 1;
                self.out.push_back(ACK_OK);
            }
            [0x01, args @ ..] if args.len() == 12 => {
                state.pos = [
                    LittleEndian::read_u32(&args[0..4]),
                    LittleEndian::read_u32(&args[4..8]),
                    LittleEndian::read_u32(&args[8..12]),
                ];
                self.out.push_back(ACK_OK);
            }
            [0x03] => {
                self.out.push_back(ACK_OK);
                let mut reply = [0u8; 12];
                LittleEndian::write_u32(&mut reply[0..4], state.pos[0]);
                LittleEndian::write_u32(&mut reply[4..8], state.pos[1]);
                LittleEndian::write_u32(&mut reply[8..12], state.pos[2]);
                self.out.extend(reply);
            }
            _ => {
                self.out.push_back(1);
                self.out.extend(b"bad cnc command\0".iter().copied());
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(drain(&mut self.out, buf))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.out.clear();
        Ok(())
    }
}

/// Valve/sensor firmware: records valve commands and plays back a scripted
/// air-flag sequence (the last value repeats once the script runs out).
struct ValveState {
    commands: Vec<bool>,
    air_script: VecDeque<bool>,
    last_air: bool,
    fail_with: Option<String>,
}

struct ValveFirmware {
    state: Arc<Mutex<ValveState>>,
    out: VecDeque<u8>,
}

impl SerialConnection for ValveFirmware {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_with.take() {
            self.out.push_back(1);
            self.out.extend(message.as_bytes().iter().copied());
            self.out.push_back(0);
            return Ok(());
        }
        match data {
            [cmd @ (0x00 | 0x01)] => {
                state.commands.push(*cmd == 0x01);
                self.out.push_back(ACK_OK);
            }
            [0x02] => {
                let air = state.air_script.pop_front().unwrap_or(state.last_air);
                state.last_air = air;
                self.out.push_back(ACK_OK);
                let mut reply = [0u8; 10];
                LittleEndian::write_f32(&mut reply[0..4], 55.0);
                LittleEndian::write_f32(&mut reply[4..8], 24.5);
                LittleEndian::write_u16(&mut reply[8..10], air as u16);
                self.out.extend(reply);
            }
            _ => {
                self.out.push_back(1);
                self.out.extend(b"bad valve command\0".iter().copied());
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(drain(&mut self.out, buf))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.out.clear();
        Ok(())
    }
}

/// Pump firmware: acks every 3-byte drive command and logs it.
struct PumpFirmware {
    log: Arc<Mutex<Vec<(u8, u16)>>>,
    out: VecDeque<u8>,
}

impl SerialConnection for PumpFirmware {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if data.len() == 3 {
            let frequency = LittleEndian::read_u16(&data[0..2]);
            self.log.lock().unwrap().push((data[2], frequency));
            self.out.push_back(ACK_OK);
        } else {
            self.out.push_back(1);
            self.out.extend(b"bad pump command\0".iter().copied());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(drain(&mut self.out, buf))
    }

    fn clear_input(&mut self) -> Result<()> {
        self.out.clear();
        Ok(())
    }
}

fn drain(out: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let mut n = 0;
    while n < buf.len() {
        match out.pop_front() {
            Some(b) => {
                buf[n] = b;
                n += 1;
            }
            None => break,
        }
    }
    n
}

struct Rig {
    cnc_state: Arc<Mutex<CncState>>,
    valve_state: Arc<Mutex<ValveState>>,
    pump_log: Arc<Mutex<Vec<(u8, u16)>>>,
    sipper: Sipper,
}

fn rig(registry: &Arc<PortRegistry>, config: SipperConfig, air_script: &[bool]) -> Rig {
    let cnc_state = Arc::new(Mutex::new(CncState::default()));
    let valve_state = Arc::new(Mutex::new(ValveState {
        commands: Vec::new(),
        air_script: air_script.iter().copied().collect(),
        last_air: false,
        fail_with: None,
    }));
    let pump_log = Arc::new(Mutex::new(Vec::new()));

    let cnc = acquire(registry, &config.cnc_port, {
        let state = Arc::clone(&cnc_state);
        move || {
            Box::new(CncFirmware {
                state,
                out: VecDeque::new(),
            }) as Box<dyn SerialConnection>
        }
    });
    let valve = acquire(registry, &config.valve_port, {
        let state = Arc::clone(&valve_state);
        move || {
            Box::new(ValveFirmware {
                state,
                out: VecDeque::new(),
            }) as Box<dyn SerialConnection>
        }
    });
    let pump = acquire(registry, &config.pump_port, {
        let log = Arc::clone(&pump_log);
        move || {
            Box::new(PumpFirmware {
                log,
                out: VecDeque::new(),
            }) as Box<dyn SerialConnection>
        }
    });

    let sipper = Sipper::with_handles("sipper", config, cnc, valve, pump).unwrap();
    Rig {
        cnc_state,
        valve_state,
        pump_log,
        sipper,
    }
}

fn acquire(
    registry: &Arc<PortRegistry>,
    name: &str,
    make: impl FnOnce() -> Box<dyn SerialConnection>,
) -> PortHandle {
    registry
        .acquire_with(name, Duration::from_millis(100), move || Ok(make()))
        .unwrap()
}

fn test_config(suffix: &str) -> SipperConfig {
    SipperConfig {
        cnc_port: format!("cnc-{}", suffix),
        valve_port: format!("valve-{}", suffix),
        pump_port: format!("pump-{}", suffix),
        // The whole default plate must be reachable.
        max_steps: [40_000, 26_000, 3_000],
        flush_delay: Duration::from_millis(1),
        ..SipperConfig::default()
    }
}

#[test]
fn test_connect_homes_and_stops_the_pump() {
    let registry = PortRegistry::new();
    let rig = rig(&registry, test_config("a"), &[]);

    assert_eq!(rig.cnc_state.lock().unwrap().homes, 1);
    assert_eq!(rig.sipper.position_steps().unwrap(), [0, 0, 0]);
    assert_eq!(rig.pump_log.lock().unwrap().first(), Some(&(0, 0)));
    assert_eq!(registry.open_count(), 3);
}

#[test]
fn test_set_well_travels_raised_and_seats_the_probe() {
    let registry = PortRegistry::new();
    let mut r = rig(&registry, test_config("b"), &[]);

    r.sipper.set_well("B2").unwrap();
    // B2 on the default plate is one 9 mm pitch in on both axes.
    let expected = [mm_to_steps(9.0), mm_to_steps(9.0), mm_to_steps(5.0)];
    assert_eq!(r.cnc_state.lock().unwrap().pos, expected);
    assert_eq!(r.sipper.current_well().unwrap(), Some("B2".to_string()));

    r.sipper.retract().unwrap();
    assert_eq!(r.sipper.current_well().unwrap(), None);
    assert_eq!(r.cnc_state.lock().unwrap().pos[2], 0);
}

#[test]
fn test_well_aliases_resolve() {
    let registry = PortRegistry::new();
    let mut config = test_config("c");
    config.aliases = HashMap::from([("rinse".to_string(), "C4".to_string())]);
    let mut r = rig(&registry, config, &[]);

    r.sipper.set_well("rinse").unwrap();
    assert_eq!(r.sipper.current_well().unwrap(), Some("C4".to_string()));
    assert!(matches!(
        r.sipper.set_well("Z99"),
        Err(FluidicError::InvalidWell(_))
    ));
}

#[test]
fn test_sip_runs_to_ready_on_air_detection() {
    let registry = PortRegistry::new();
    // Liquid for two sensor polls, then the air slug arrives.
    let mut r = rig(&registry, test_config("d"), &[false, false, true]);

    r.sipper.sip("A3").unwrap();
    assert_eq!(r.sipper.phase(), SipPhase::Ready);
    assert!(!r.sipper.valve_is_open());

    // Waste path opened for the draw and closed again at the end.
    let commands = r.valve_state.lock().unwrap().commands.clone();
    assert_eq!(commands.first(), Some(&true));
    assert_eq!(commands.last(), Some(&false));

    // The pump ran at flow drive and was parked afterwards.
    let pump = r.pump_log.lock().unwrap().clone();
    assert!(pump.contains(&(250, 200)));
    assert_eq!(pump.last(), Some(&(0, 0)));
}

#[test]
fn test_sip_after_liquid_waits_for_the_full_air_slug() {
    let registry = PortRegistry::new();
    // Trailing air from the previous draw, then liquid, then the new slug
    // arrives and passes the sensor.
    let mut r = rig(
        &registry,
        test_config("g"),
        &[true, false, false, true, true, false],
    );

    r.sipper.sip_after_liquid("B5").unwrap();
    assert_eq!(r.sipper.phase(), SipPhase::Ready);
    assert!(!r.sipper.valve_is_open());

    // The scripted edges were consumed in order: stale-air wait, slug
    // arrival, slug passage.
    assert!(r.valve_state.lock().unwrap().air_script.is_empty());
    let pump = r.pump_log.lock().unwrap().clone();
    assert!(pump.contains(&(250, 200)));
    assert_eq!(pump.last(), Some(&(0, 0)));
}

#[test]
fn test_firmware_error_string_surfaces() {
    let registry = PortRegistry::new();
    let mut r = rig(&registry, test_config("e"), &[]);

    r.valve_state.lock().unwrap().fail_with = Some("valve jammed".to_string());
    match r.sipper.set_valve(true) {
        Err(FluidicError::Device(message)) => assert_eq!(message, "valve jammed"),
        other => panic!("expected device error, got {:?}", other),
    }
    // The link recovered; the next command goes through.
    r.sipper.set_valve(true).unwrap();
}

#[test]
fn test_failed_sip_returns_the_phase_to_idle() {
    let registry = PortRegistry::new();
    let mut r = rig(&registry, test_config("h"), &[]);

    // The waste valve refuses right at the start of the sequence.
    r.valve_state.lock().unwrap().fail_with = Some("stuck plunger".to_string());
    assert!(r.sipper.sip("A2").is_err());
    assert_eq!(r.sipper.phase(), SipPhase::Idle);
}

#[test]
fn test_travel_limits_are_enforced_before_sending() {
    let registry = PortRegistry::new();
    let mut r = rig(&registry, test_config("f"), &[]);

    assert!(matches!(
        r.sipper.move_to_steps([50_000, 0, 0]),
        Err(FluidicError::Configuration(_))
    ));
    // Nothing was sent: the firmware position is unchanged.
    assert_eq!(r.cnc_state.lock().unwrap().pos, [0, 0, 0]);
}
